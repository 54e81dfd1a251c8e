//! Configuration key entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "config_key")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub feature_version_id: i64,
    pub name: String,
    #[sea_orm(column_type = "Text")]
    pub description: String,
    /// Validator definitions in JSON format
    #[sea_orm(column_type = "Text", nullable)]
    pub validators: Option<String>,
    pub validators_updated_at: Option<DateTime>,
    pub valid_from: Option<DateTime>,
    pub valid_to: Option<DateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

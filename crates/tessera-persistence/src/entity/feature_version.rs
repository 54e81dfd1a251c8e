//! Feature version entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "feature_version")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub feature_id: i64,
    pub version: i32,
    pub valid_from: Option<DateTime>,
    pub valid_to: Option<DateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

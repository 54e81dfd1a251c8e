//! Link between a feature version and a service version

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "feature_version_service_version")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub feature_version_id: i64,
    pub service_version_id: i64,
    pub valid_from: Option<DateTime>,
    pub valid_to: Option<DateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

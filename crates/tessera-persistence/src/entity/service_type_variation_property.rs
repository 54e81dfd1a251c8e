//! Relevant property of a service type; lower priority ranks higher

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "service_type_variation_property")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub service_type_id: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub variation_property_id: i64,
    pub priority: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

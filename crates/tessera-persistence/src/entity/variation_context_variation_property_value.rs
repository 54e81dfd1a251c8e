//! Membership of a property value in a variation context

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "variation_context_variation_property_value")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub variation_context_id: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub variation_property_value_id: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

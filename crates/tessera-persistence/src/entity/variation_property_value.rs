//! Variation property value entity
//!
//! Values of one property form a forest through `parent_id`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "variation_property_value")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub variation_property_id: i64,
    pub value: String,
    pub parent_id: Option<i64>,
    pub sort_order: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

//! Changeset change entity
//!
//! One row per pending mutation. `kind` selects which id columns are meaningful.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "changeset_change")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub changeset_id: i64,
    /// SERVICE_VERSION, FEATURE_VERSION, LINK, KEY, VARIATION_VALUE
    pub kind: String,
    /// CREATE, UPDATE, DELETE
    pub r#type: String,
    pub service_version_id: Option<i64>,
    pub feature_version_id: Option<i64>,
    pub key_id: Option<i64>,
    pub variation_context_id: Option<i64>,
    pub old_variation_value_id: Option<i64>,
    pub new_variation_value_id: Option<i64>,
    pub link_id: Option<i64>,
    pub created_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

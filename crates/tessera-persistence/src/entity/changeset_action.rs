//! Changeset action entity for the audit trail

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "changeset_action")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub changeset_id: i64,
    /// CREATE, COMMIT, REOPEN, STASH, APPLY, DISCARD, COMMENT
    pub r#type: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub comment: Option<String>,
    pub user_id: i64,
    pub created_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

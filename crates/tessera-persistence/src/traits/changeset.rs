//! Changeset persistence trait
//!
//! Defines the interface for changesets, their pending-change log and their
//! audit actions.

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::model::{
    ActionType, ChangeKind, ChangeRecord, ChangeType, ChangesetActionRecord, ChangesetRecord,
    ChangesetState,
};

/// Changeset, change-log and action operations
#[async_trait]
pub trait ChangesetPersistence: Send + Sync {
    /// Find a changeset by id
    async fn changeset_find(&self, id: i64) -> anyhow::Result<Option<ChangesetRecord>>;

    /// Find the open changeset owned by a user, if any
    async fn changeset_find_open_by_user(
        &self,
        user_id: i64,
    ) -> anyhow::Result<Option<ChangesetRecord>>;

    /// List changesets, optionally filtered by owner and state, ordered by id
    async fn changeset_list(
        &self,
        user_id: Option<i64>,
        state: Option<ChangesetState>,
    ) -> anyhow::Result<Vec<ChangesetRecord>>;

    /// Create an open changeset for a user
    async fn changeset_create(
        &mut self,
        user_id: i64,
        at: NaiveDateTime,
    ) -> anyhow::Result<ChangesetRecord>;

    /// Find a changeset and hold a row lock on it until the transaction ends
    async fn changeset_lock(&mut self, id: i64) -> anyhow::Result<Option<ChangesetRecord>>;

    /// Set the state of a changeset
    async fn changeset_update_state(
        &mut self,
        id: i64,
        state: ChangesetState,
        applied_at: Option<NaiveDateTime>,
    ) -> anyhow::Result<()>;

    /// Append a change to a changeset's log
    async fn change_create(
        &mut self,
        changeset_id: i64,
        change_type: ChangeType,
        kind: ChangeKind,
        at: NaiveDateTime,
    ) -> anyhow::Result<ChangeRecord>;

    /// Find a change by id
    async fn change_find(&self, id: i64) -> anyhow::Result<Option<ChangeRecord>>;

    /// List the changes of a changeset in storage order
    async fn change_list(&self, changeset_id: i64) -> anyhow::Result<Vec<ChangeRecord>>;

    /// Delete a change row
    async fn change_delete(&mut self, id: i64) -> anyhow::Result<bool>;

    /// Delete every change row of a changeset
    async fn change_delete_by_changeset(&mut self, changeset_id: i64) -> anyhow::Result<u64>;

    /// Append an audit action
    async fn action_create(
        &mut self,
        changeset_id: i64,
        action_type: ActionType,
        comment: Option<&str>,
        user_id: i64,
        at: NaiveDateTime,
    ) -> anyhow::Result<ChangesetActionRecord>;

    /// List the actions of a changeset in storage order
    async fn action_list(&self, changeset_id: i64) -> anyhow::Result<Vec<ChangesetActionRecord>>;
}

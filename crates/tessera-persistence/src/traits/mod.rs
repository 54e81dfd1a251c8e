//! Persistence traits for the unified storage abstraction layer
//!
//! This module defines the core persistence traits that abstract over the
//! storage backends: external database (MySQL/PostgreSQL) and in-memory.
//! All work happens inside a transaction opened by `PersistenceService::begin`.

pub mod changeset;
pub mod entity;
pub mod variation;

pub use changeset::ChangesetPersistence;
pub use entity::EntityPersistence;
pub use variation::VariationPersistence;

use async_trait::async_trait;

use crate::model::StorageMode;

/// A unit of work over every persistence trait
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait PersistenceTransaction:
    ChangesetPersistence + EntityPersistence + VariationPersistence + Send + Sync
{
    /// Make the writes of this transaction visible
    async fn commit(self: Box<Self>) -> anyhow::Result<()>;

    /// Discard the writes of this transaction
    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

/// Unified persistence service trait
///
/// This is the main entry point for storage. Implementations hand out
/// transactions against the configured backend.
#[async_trait]
pub trait PersistenceService: Send + Sync {
    /// Open a serializable transaction
    async fn begin(&self) -> anyhow::Result<Box<dyn PersistenceTransaction>>;

    /// Get the current storage mode
    fn storage_mode(&self) -> StorageMode;

    /// Health check for the storage backend
    async fn health_check(&self) -> anyhow::Result<()>;
}

/// Finish a unit of work: commit on `Ok`, roll back on `Err`.
///
/// The original result is handed back; a failed commit turns `Ok` into the
/// commit error, a failed rollback is logged and the original error is kept.
pub async fn commit_or_rollback<T, E>(
    tx: Box<dyn PersistenceTransaction>,
    result: Result<T, E>,
) -> Result<T, E>
where
    E: From<anyhow::Error>,
{
    match result {
        Ok(value) => {
            tx.commit().await.map_err(E::from)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!("Failed to roll back transaction: {:#}", rollback_err);
            }
            Err(err)
        }
    }
}

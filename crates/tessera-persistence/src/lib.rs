//! Tessera Persistence - Storage abstraction and backends
//!
//! This crate provides:
//! - SeaORM entity definitions for every persisted table
//! - Persistence trait abstractions and the unit-of-work primitive
//! - Domain model types returned by the persistence traits
//! - An external database backend and an in-memory backend

pub mod entity;
pub mod memory;
pub mod model;
pub mod sql;
pub mod traits;

// Re-export sea-orm for convenience
pub use sea_orm;

// Re-export persistence traits
pub use traits::{
    ChangesetPersistence, EntityPersistence, PersistenceService, PersistenceTransaction,
    VariationPersistence, commit_or_rollback,
};

// Re-export backends
pub use memory::MemoryPersistService;
pub use sql::ExternalDbPersistService;

// Re-export model types
pub use model::{
    ActionType, ChangeKind, ChangeRecord, ChangeType, ChangesetActionRecord, ChangesetRecord,
    ChangesetState, FeatureRecord, FeatureVersionRecord, KeyRecord, LinkRecord, ServiceRecord,
    ServiceTypePropertyRecord, ServiceTypeRecord, ServiceVersionRecord, StorageMode, Validity,
    VariationPropertyRecord, VariationPropertyValueRecord, VariationValueRecord, VersionedEntity,
};

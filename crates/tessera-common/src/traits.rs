//! Caller identity traits
//!
//! Every core operation receives an explicit `UserContext` instead of reading
//! the current user from ambient state. Permission grants are resolved by a
//! `PermissionLookup` supplied by the identity collaborator.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Permission level granted on a resource, ordered from weakest to strongest
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionLevel {
    #[default]
    None,
    Read,
    Write,
    Admin,
}

impl PermissionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionLevel::None => "NONE",
            PermissionLevel::Read => "READ",
            PermissionLevel::Write => "WRITE",
            PermissionLevel::Admin => "ADMIN",
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(PermissionLevel::None),
            "READ" => Ok(PermissionLevel::Read),
            "WRITE" => Ok(PermissionLevel::Write),
            "ADMIN" => Ok(PermissionLevel::Admin),
            _ => Err(format!("Invalid permission level: {}", s)),
        }
    }
}

/// Permission lookup provided by the identity collaborator
pub trait PermissionLookup: Send + Sync {
    /// Level granted on a service
    fn service_level(&self, service_id: i64) -> PermissionLevel;

    /// Level granted on a feature
    fn feature_level(&self, feature_id: i64) -> PermissionLevel;

    /// Level granted on a key
    fn key_level(&self, key_id: i64) -> PermissionLevel;

    /// Level granted on a variation context within a service
    fn variation_level(&self, service_id: i64, variation_context_id: i64) -> PermissionLevel;
}

/// Grant table backed by plain maps.
///
/// Missing entries resolve to `PermissionLevel::None`. Variation grants fall
/// back to the service grant when no context-specific grant exists.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    services: HashMap<i64, PermissionLevel>,
    features: HashMap<i64, PermissionLevel>,
    keys: HashMap<i64, PermissionLevel>,
    variations: HashMap<(i64, i64), PermissionLevel>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_service(mut self, service_id: i64, level: PermissionLevel) -> Self {
        self.services.insert(service_id, level);
        self
    }

    pub fn grant_feature(mut self, feature_id: i64, level: PermissionLevel) -> Self {
        self.features.insert(feature_id, level);
        self
    }

    pub fn grant_key(mut self, key_id: i64, level: PermissionLevel) -> Self {
        self.keys.insert(key_id, level);
        self
    }

    pub fn grant_variation(
        mut self,
        service_id: i64,
        variation_context_id: i64,
        level: PermissionLevel,
    ) -> Self {
        self.variations
            .insert((service_id, variation_context_id), level);
        self
    }
}

impl PermissionLookup for StaticPermissions {
    fn service_level(&self, service_id: i64) -> PermissionLevel {
        self.services.get(&service_id).copied().unwrap_or_default()
    }

    fn feature_level(&self, feature_id: i64) -> PermissionLevel {
        self.features.get(&feature_id).copied().unwrap_or_default()
    }

    fn key_level(&self, key_id: i64) -> PermissionLevel {
        self.keys.get(&key_id).copied().unwrap_or_default()
    }

    fn variation_level(&self, service_id: i64, variation_context_id: i64) -> PermissionLevel {
        self.variations
            .get(&(service_id, variation_context_id))
            .copied()
            .unwrap_or_else(|| self.service_level(service_id))
    }
}

/// Identity of the caller of a core operation
#[derive(Clone)]
pub struct UserContext {
    pub id: i64,
    pub is_global_admin: bool,
    pub open_changeset_id: Option<i64>,
    pub permissions: Arc<dyn PermissionLookup>,
}

impl UserContext {
    pub fn new(id: i64, permissions: Arc<dyn PermissionLookup>) -> Self {
        Self {
            id,
            is_global_admin: false,
            open_changeset_id: None,
            permissions,
        }
    }

    /// A global administrator; permission lookups are never consulted
    pub fn global_admin(id: i64) -> Self {
        Self {
            id,
            is_global_admin: true,
            open_changeset_id: None,
            permissions: Arc::new(StaticPermissions::new()),
        }
    }

    /// Copy of this context pointing at the given open changeset
    pub fn with_open_changeset(&self, changeset_id: Option<i64>) -> Self {
        Self {
            open_changeset_id: changeset_id,
            ..self.clone()
        }
    }

    pub fn has_service_level(&self, service_id: i64, level: PermissionLevel) -> bool {
        self.is_global_admin || self.permissions.service_level(service_id) >= level
    }

    pub fn has_feature_level(&self, feature_id: i64, level: PermissionLevel) -> bool {
        self.is_global_admin || self.permissions.feature_level(feature_id) >= level
    }

    pub fn has_key_level(&self, key_id: i64, level: PermissionLevel) -> bool {
        self.is_global_admin || self.permissions.key_level(key_id) >= level
    }

    pub fn has_variation_level(
        &self,
        service_id: i64,
        variation_context_id: i64,
        level: PermissionLevel,
    ) -> bool {
        self.is_global_admin
            || self
                .permissions
                .variation_level(service_id, variation_context_id)
                >= level
    }
}

impl fmt::Debug for UserContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserContext")
            .field("id", &self.id)
            .field("is_global_admin", &self.is_global_admin)
            .field("open_changeset_id", &self.open_changeset_id)
            .finish_non_exhaustive()
    }
}

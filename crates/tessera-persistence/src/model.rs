//! Domain model types for the persistence abstraction layer
//!
//! These types are used as return values from the persistence traits,
//! decoupled from specific storage backends.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Storage mode for the persistence layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    /// External database (MySQL/PostgreSQL via SeaORM)
    ExternalDb,
    /// In-process state, lost on restart
    Memory,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::ExternalDb => write!(f, "external_db"),
            StorageMode::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external_db" => Ok(StorageMode::ExternalDb),
            "memory" => Ok(StorageMode::Memory),
            _ => Err(format!("Invalid storage mode: {}", s)),
        }
    }
}

/// Temporal validity window of a versioned row.
///
/// A row is live iff `valid_from` is set and `valid_to` is not. A row with
/// neither set is pending (created by a changeset that has not been applied).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validity {
    pub valid_from: Option<NaiveDateTime>,
    pub valid_to: Option<NaiveDateTime>,
}

impl Validity {
    pub fn is_live(&self) -> bool {
        self.valid_from.is_some() && self.valid_to.is_none()
    }

    pub fn has_ended(&self) -> bool {
        self.valid_to.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.valid_from.is_none() && self.valid_to.is_none()
    }
}

/// Tables carrying a validity window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionedEntity {
    Service,
    ServiceVersion,
    Feature,
    FeatureVersion,
    Link,
    Key,
    VariationValue,
}

impl std::fmt::Display for VersionedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VersionedEntity::Service => "service",
            VersionedEntity::ServiceVersion => "service version",
            VersionedEntity::Feature => "feature",
            VersionedEntity::FeatureVersion => "feature version",
            VersionedEntity::Link => "link",
            VersionedEntity::Key => "key",
            VersionedEntity::VariationValue => "variation value",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Versioned configuration entities
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub id: i64,
    pub name: String,
    pub service_type_id: i64,
    pub description: String,
    pub validity: Validity,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceVersionRecord {
    pub id: i64,
    pub service_id: i64,
    pub version: i32,
    pub published: bool,
    pub validity: Validity,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub validity: Validity,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureVersionRecord {
    pub id: i64,
    pub feature_id: i64,
    pub version: i32,
    pub validity: Validity,
}

/// Link between a feature version and a service version
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRecord {
    pub id: i64,
    pub feature_version_id: i64,
    pub service_version_id: i64,
    pub validity: Validity,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    pub id: i64,
    pub feature_version_id: i64,
    pub name: String,
    pub description: String,
    /// Validator definitions, JSON encoded
    pub validators: Option<String>,
    /// Audit timestamp of the last in-place validator edit
    pub validators_updated_at: Option<NaiveDateTime>,
    pub validity: Validity,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationValueRecord {
    pub id: i64,
    pub key_id: i64,
    pub variation_context_id: i64,
    pub data: String,
    pub validity: Validity,
}

// ============================================================================
// Variation metadata (admin-managed, not versioned)
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationPropertyRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationPropertyValueRecord {
    pub id: i64,
    pub property_id: i64,
    pub value: String,
    pub parent_id: Option<i64>,
    pub sort_order: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTypeRecord {
    pub id: i64,
    pub name: String,
}

/// A property relevant to a service type; lower `priority` ranks higher
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTypePropertyRecord {
    pub service_type_id: i64,
    pub property_id: i64,
    pub priority: i32,
}

// ============================================================================
// Changesets
// ============================================================================

/// Changeset lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangesetState {
    Open,
    Committed,
    Applied,
    Discarded,
    Stashed,
}

impl ChangesetState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangesetState::Open => "OPEN",
            ChangesetState::Committed => "COMMITTED",
            ChangesetState::Applied => "APPLIED",
            ChangesetState::Discarded => "DISCARDED",
            ChangesetState::Stashed => "STASHED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ChangesetState::Applied | ChangesetState::Discarded)
    }
}

impl std::fmt::Display for ChangesetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChangesetState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(ChangesetState::Open),
            "COMMITTED" => Ok(ChangesetState::Committed),
            "APPLIED" => Ok(ChangesetState::Applied),
            "DISCARDED" => Ok(ChangesetState::Discarded),
            "STASHED" => Ok(ChangesetState::Stashed),
            _ => Err(format!("Invalid changeset state: {}", s)),
        }
    }
}

/// Audit action recorded against a changeset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Create,
    Commit,
    Reopen,
    Stash,
    Apply,
    Discard,
    Comment,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Create => "CREATE",
            ActionType::Commit => "COMMIT",
            ActionType::Reopen => "REOPEN",
            ActionType::Stash => "STASH",
            ActionType::Apply => "APPLY",
            ActionType::Discard => "DISCARD",
            ActionType::Comment => "COMMENT",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(ActionType::Create),
            "COMMIT" => Ok(ActionType::Commit),
            "REOPEN" => Ok(ActionType::Reopen),
            "STASH" => Ok(ActionType::Stash),
            "APPLY" => Ok(ActionType::Apply),
            "DISCARD" => Ok(ActionType::Discard),
            "COMMENT" => Ok(ActionType::Comment),
            _ => Err(format!("Invalid action type: {}", s)),
        }
    }
}

/// Whether a change introduces, replaces or removes a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Create => "CREATE",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(ChangeType::Create),
            "UPDATE" => Ok(ChangeType::Update),
            "DELETE" => Ok(ChangeType::Delete),
            _ => Err(format!("Invalid change type: {}", s)),
        }
    }
}

/// What a pending change touches, with the ids it carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    #[serde(rename_all = "camelCase")]
    ServiceVersion { service_version_id: i64 },
    #[serde(rename_all = "camelCase")]
    FeatureVersion { feature_version_id: i64 },
    #[serde(rename_all = "camelCase")]
    Link { link_id: i64 },
    #[serde(rename_all = "camelCase")]
    Key { key_id: i64 },
    #[serde(rename_all = "camelCase")]
    VariationValue {
        key_id: i64,
        variation_context_id: i64,
        old_variation_value_id: Option<i64>,
        new_variation_value_id: Option<i64>,
    },
}

impl ChangeKind {
    /// Discriminator persisted in the `kind` column
    pub fn tag(&self) -> &'static str {
        match self {
            ChangeKind::ServiceVersion { .. } => "SERVICE_VERSION",
            ChangeKind::FeatureVersion { .. } => "FEATURE_VERSION",
            ChangeKind::Link { .. } => "LINK",
            ChangeKind::Key { .. } => "KEY",
            ChangeKind::VariationValue { .. } => "VARIATION_VALUE",
        }
    }

    /// Key touched by a key or value change
    pub fn key_id(&self) -> Option<i64> {
        match self {
            ChangeKind::Key { key_id } | ChangeKind::VariationValue { key_id, .. } => {
                Some(*key_id)
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesetRecord {
    pub id: i64,
    pub user_id: i64,
    pub state: ChangesetState,
    pub created_at: NaiveDateTime,
    pub applied_at: Option<NaiveDateTime>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesetActionRecord {
    pub id: i64,
    pub changeset_id: i64,
    pub action_type: ActionType,
    pub comment: Option<String>,
    pub user_id: i64,
    pub created_at: NaiveDateTime,
}

/// One pending mutation in a changeset
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub id: i64,
    pub changeset_id: i64,
    pub change_type: ChangeType,
    #[serde(flatten)]
    pub kind: ChangeKind,
    pub created_at: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> NaiveDateTime {
        chrono::DateTime::from_timestamp(secs, 0)
            .unwrap()
            .naive_utc()
    }

    #[test]
    fn test_validity_states() {
        let pending = Validity::default();
        assert!(pending.is_pending());
        assert!(!pending.is_live());

        let live = Validity {
            valid_from: Some(at(10)),
            valid_to: None,
        };
        assert!(live.is_live());
        assert!(!live.has_ended());

        let ended = Validity {
            valid_from: Some(at(10)),
            valid_to: Some(at(20)),
        };
        assert!(!ended.is_live());
        assert!(ended.has_ended());
    }

    #[test]
    fn test_changeset_state_round_trip_strings() {
        for state in [
            ChangesetState::Open,
            ChangesetState::Committed,
            ChangesetState::Applied,
            ChangesetState::Discarded,
            ChangesetState::Stashed,
        ] {
            assert_eq!(state.as_str().parse::<ChangesetState>().unwrap(), state);
        }
        assert!("MERGED".parse::<ChangesetState>().is_err());
        assert!(ChangesetState::Applied.is_terminal());
        assert!(!ChangesetState::Stashed.is_terminal());
    }

    #[test]
    fn test_change_kind_tag_and_key() {
        let kind = ChangeKind::VariationValue {
            key_id: 5,
            variation_context_id: 1,
            old_variation_value_id: None,
            new_variation_value_id: Some(9),
        };
        assert_eq!(kind.tag(), "VARIATION_VALUE");
        assert_eq!(kind.key_id(), Some(5));
        assert_eq!(ChangeKind::Link { link_id: 3 }.key_id(), None);
    }

    #[test]
    fn test_change_record_serializes_flat() {
        let change = ChangeRecord {
            id: 1,
            changeset_id: 2,
            change_type: ChangeType::Create,
            kind: ChangeKind::Key { key_id: 7 },
            created_at: at(0),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["kind"], "KEY");
        assert_eq!(json["keyId"], 7);
        assert_eq!(json["changeType"], "CREATE");
    }
}

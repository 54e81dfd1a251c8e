//! Conflict detection for pending changes
//!
//! Every change of a changeset is compared against the live state of the
//! store. Changes are scanned in storage order; earlier changes of the same
//! changeset can excuse later ones (deleting a link before re-creating it is
//! not a duplicate), so the scan threads a `ScanState` through the list.
//! Checkers run in a fixed order and the first one that fires names the
//! conflict.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use tessera_persistence::{ChangeKind, ChangeRecord, ChangeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    /// Value change whose key's feature version has ended
    ValueInDeletedFeature,
    /// Value change whose key has ended
    ValueInDeletedKey,
    /// The replaced value ended and nothing live took its place
    OldValueDeleted,
    /// The replaced value ended and another live value took its place
    OldValueUpdated,
    /// A live value already exists in the target context
    NewValueDuplicateVariation,
    /// The key's validators were edited after the change was recorded
    KeyValidatorsUpdated,
    /// Key change in a feature version that has ended
    KeyInDeletedFeature,
    /// A live key with the same name exists in the feature version
    KeyDuplicateName,
    /// The feature is already linked live to the service version
    DuplicateLink,
    /// The link being removed has already ended
    DeletedLink,
    /// New feature version does not follow the latest one
    InconsistentFeatureVersion,
    /// New service version does not follow the latest one
    InconsistentServiceVersion,
    /// Deletion touching a published service version
    ChangeInPublishedServiceVersion,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::ValueInDeletedFeature => "VALUE_IN_DELETED_FEATURE",
            ConflictKind::ValueInDeletedKey => "VALUE_IN_DELETED_KEY",
            ConflictKind::OldValueDeleted => "OLD_VALUE_DELETED",
            ConflictKind::OldValueUpdated => "OLD_VALUE_UPDATED",
            ConflictKind::NewValueDuplicateVariation => "NEW_VALUE_DUPLICATE_VARIATION",
            ConflictKind::KeyValidatorsUpdated => "KEY_VALIDATORS_UPDATED",
            ConflictKind::KeyInDeletedFeature => "KEY_IN_DELETED_FEATURE",
            ConflictKind::KeyDuplicateName => "KEY_DUPLICATE_NAME",
            ConflictKind::DuplicateLink => "DUPLICATE_LINK",
            ConflictKind::DeletedLink => "DELETED_LINK",
            ConflictKind::InconsistentFeatureVersion => "INCONSISTENT_FEATURE_VERSION",
            ConflictKind::InconsistentServiceVersion => "INCONSISTENT_SERVICE_VERSION",
            ConflictKind::ChangeInPublishedServiceVersion => "CHANGE_IN_PUBLISHED_SERVICE_VERSION",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Snapshot of the live state a change is checked against
// ============================================================================

/// The key a key or value change refers to
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySnapshot {
    pub id: i64,
    pub name: String,
    pub feature_version_id: i64,
    pub live: bool,
    pub ended: bool,
    pub feature_version_ended: bool,
    pub validators_updated_at: Option<NaiveDateTime>,
    /// Another live key with the same name exists in the feature version
    pub live_duplicate: bool,
    /// The feature version is linked to a published service version
    pub in_published_service_version: bool,
}

/// One side (old or new) of a value change
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValueSnapshot {
    pub id: i64,
    pub ended: bool,
    /// Another live value exists for the same key and context
    pub live_in_context: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub id: i64,
    pub feature_id: i64,
    pub service_version_id: i64,
    pub ended: bool,
    /// Another live link joins the same feature and service version
    pub live_duplicate: bool,
    pub service_version_published: bool,
}

/// A feature version or service version change
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionSnapshot {
    /// Owning feature or service
    pub parent_id: i64,
    pub version: i32,
    pub max_live: Option<i32>,
    /// Service version: published itself; feature version: linked to a published one
    pub published: bool,
}

/// A change together with everything the checkers need to know about it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingChange {
    pub change: ChangeRecord,
    pub key: Option<KeySnapshot>,
    pub old_value: Option<ValueSnapshot>,
    pub new_value: Option<ValueSnapshot>,
    pub link: Option<LinkSnapshot>,
    pub version: Option<VersionSnapshot>,
}

impl PendingChange {
    pub fn new(change: ChangeRecord) -> Self {
        Self {
            change,
            key: None,
            old_value: None,
            new_value: None,
            link: None,
            version: None,
        }
    }

    fn is_value(&self) -> bool {
        matches!(self.change.kind, ChangeKind::VariationValue { .. })
    }

    fn is_key(&self) -> bool {
        matches!(self.change.kind, ChangeKind::Key { .. })
    }

    fn is_link(&self) -> bool {
        matches!(self.change.kind, ChangeKind::Link { .. })
    }

    fn is_type(&self, change_type: ChangeType) -> bool {
        self.change.change_type == change_type
    }
}

// ============================================================================
// Scan state
// ============================================================================

/// What the changes scanned so far have done
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanState {
    /// (feature id, service version id) of links deleted earlier
    deleted_links: HashSet<(i64, i64)>,
    /// (feature version id, key name) of keys deleted earlier
    deleted_keys: HashSet<(i64, String)>,
    /// Last version number created per feature
    feature_versions: HashMap<i64, i32>,
    /// Last version number created per service
    service_versions: HashMap<i64, i32>,
}

impl ScanState {
    /// State after `pending` has been scanned
    pub fn advance(&self, pending: &PendingChange) -> ScanState {
        let mut next = self.clone();
        match (&pending.change.kind, pending.change.change_type) {
            (ChangeKind::Link { .. }, ChangeType::Delete) => {
                if let Some(link) = &pending.link {
                    next.deleted_links
                        .insert((link.feature_id, link.service_version_id));
                }
            }
            (ChangeKind::Key { .. }, ChangeType::Delete) => {
                if let Some(key) = &pending.key {
                    next.deleted_keys
                        .insert((key.feature_version_id, key.name.clone()));
                }
            }
            (ChangeKind::FeatureVersion { .. }, ChangeType::Create) => {
                if let Some(version) = &pending.version {
                    next.feature_versions
                        .insert(version.parent_id, version.version);
                }
            }
            (ChangeKind::ServiceVersion { .. }, ChangeType::Create) => {
                if let Some(version) = &pending.version {
                    next.service_versions
                        .insert(version.parent_id, version.version);
                }
            }
            _ => {}
        }
        next
    }

    fn expected_version(seen: &HashMap<i64, i32>, version: &VersionSnapshot) -> i32 {
        let last_seen = seen.get(&version.parent_id).copied().unwrap_or(0);
        last_seen.max(version.max_live.unwrap_or(0)) + 1
    }
}

// ============================================================================
// Checkers
// ============================================================================

type Checker = fn(&PendingChange, &ScanState) -> bool;

/// Checkers in evaluation order
const CHECKERS: [(ConflictKind, Checker); 13] = [
    (ConflictKind::ValueInDeletedFeature, value_in_deleted_feature),
    (ConflictKind::ValueInDeletedKey, value_in_deleted_key),
    (ConflictKind::OldValueDeleted, old_value_deleted),
    (ConflictKind::OldValueUpdated, old_value_updated),
    (ConflictKind::NewValueDuplicateVariation, new_value_duplicate_variation),
    (ConflictKind::KeyValidatorsUpdated, key_validators_updated),
    (ConflictKind::KeyInDeletedFeature, key_in_deleted_feature),
    (ConflictKind::KeyDuplicateName, key_duplicate_name),
    (ConflictKind::DuplicateLink, duplicate_link),
    (ConflictKind::DeletedLink, deleted_link),
    (ConflictKind::InconsistentFeatureVersion, inconsistent_feature_version),
    (ConflictKind::InconsistentServiceVersion, inconsistent_service_version),
    (ConflictKind::ChangeInPublishedServiceVersion, change_in_published_service_version),
];

fn value_in_deleted_feature(p: &PendingChange, _: &ScanState) -> bool {
    p.is_value() && p.key.as_ref().is_some_and(|k| k.feature_version_ended)
}

fn value_in_deleted_key(p: &PendingChange, _: &ScanState) -> bool {
    p.is_value() && p.key.as_ref().is_some_and(|k| k.ended)
}

fn old_value_deleted(p: &PendingChange, _: &ScanState) -> bool {
    p.is_value()
        && p.old_value
            .as_ref()
            .is_some_and(|v| v.ended && !v.live_in_context)
}

fn old_value_updated(p: &PendingChange, _: &ScanState) -> bool {
    p.is_value()
        && p.old_value
            .as_ref()
            .is_some_and(|v| v.ended && v.live_in_context)
}

fn new_value_duplicate_variation(p: &PendingChange, _: &ScanState) -> bool {
    p.is_value()
        && p.is_type(ChangeType::Create)
        && p.new_value.as_ref().is_some_and(|v| v.live_in_context)
}

fn key_validators_updated(p: &PendingChange, _: &ScanState) -> bool {
    p.is_value()
        && p.key.as_ref().is_some_and(|k| {
            k.live
                && k.validators_updated_at
                    .is_some_and(|at| at > p.change.created_at)
        })
}

fn key_in_deleted_feature(p: &PendingChange, _: &ScanState) -> bool {
    p.is_key() && p.key.as_ref().is_some_and(|k| k.feature_version_ended)
}

fn key_duplicate_name(p: &PendingChange, state: &ScanState) -> bool {
    p.is_key()
        && p.is_type(ChangeType::Create)
        && p.key.as_ref().is_some_and(|k| {
            k.live_duplicate
                && !state
                    .deleted_keys
                    .contains(&(k.feature_version_id, k.name.clone()))
        })
}

fn duplicate_link(p: &PendingChange, state: &ScanState) -> bool {
    p.is_link()
        && p.is_type(ChangeType::Create)
        && p.link.as_ref().is_some_and(|l| {
            l.live_duplicate
                && !state
                    .deleted_links
                    .contains(&(l.feature_id, l.service_version_id))
        })
}

fn deleted_link(p: &PendingChange, _: &ScanState) -> bool {
    p.is_link() && p.is_type(ChangeType::Delete) && p.link.as_ref().is_some_and(|l| l.ended)
}

fn inconsistent_feature_version(p: &PendingChange, state: &ScanState) -> bool {
    matches!(p.change.kind, ChangeKind::FeatureVersion { .. })
        && p.is_type(ChangeType::Create)
        && p.version.as_ref().is_some_and(|v| {
            v.version != ScanState::expected_version(&state.feature_versions, v)
        })
}

fn inconsistent_service_version(p: &PendingChange, state: &ScanState) -> bool {
    matches!(p.change.kind, ChangeKind::ServiceVersion { .. })
        && p.is_type(ChangeType::Create)
        && p.version.as_ref().is_some_and(|v| {
            v.version != ScanState::expected_version(&state.service_versions, v)
        })
}

fn change_in_published_service_version(p: &PendingChange, _: &ScanState) -> bool {
    if !p.is_type(ChangeType::Delete) {
        return false;
    }
    match p.change.kind {
        ChangeKind::Link { .. } => p.link.as_ref().is_some_and(|l| l.service_version_published),
        ChangeKind::Key { .. } => p.key.as_ref().is_some_and(|k| k.in_published_service_version),
        ChangeKind::FeatureVersion { .. } | ChangeKind::ServiceVersion { .. } => {
            p.version.as_ref().is_some_and(|v| v.published)
        }
        ChangeKind::VariationValue { .. } => false,
    }
}

/// First conflict of a single change, given the scan so far
pub fn check_change(pending: &PendingChange, state: &ScanState) -> Option<ConflictKind> {
    CHECKERS
        .iter()
        .find(|(_, checker)| checker(pending, state))
        .map(|(kind, _)| *kind)
}

/// Conflicts of a whole changeset, one entry per change in input order
pub fn detect_conflicts(changes: &[PendingChange]) -> Vec<Option<ConflictKind>> {
    let mut state = ScanState::default();
    changes
        .iter()
        .map(|pending| {
            let conflict = check_change(pending, &state);
            state = state.advance(pending);
            conflict
        })
        .collect()
}

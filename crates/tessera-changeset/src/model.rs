//! Request and response structures of the changeset crate

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use tessera_common::validation::{
    MAX_COMMENT_LENGTH, MAX_VALUE_DATA_LENGTH, validate_key_name, validate_name,
};
use tessera_persistence::ChangeRecord;

use crate::conflict::ConflictKind;

/// `validator` length bounds are `u64`
const MAX_VALUE_DATA_LENGTH_U64: u64 = MAX_VALUE_DATA_LENGTH as u64;

/// Tunables of the changeset service
#[derive(Clone, Debug)]
pub struct ChangesetOptions {
    /// Maximum length of a changeset comment, in characters
    pub max_comment_length: usize,
}

impl Default for ChangesetOptions {
    fn default() -> Self {
        Self {
            max_comment_length: MAX_COMMENT_LENGTH,
        }
    }
}

/// A pending change annotated with its conflict, if any
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeView {
    #[serde(flatten)]
    pub change: ChangeRecord,
    pub conflict: Option<ConflictKind>,
}

/// Result of an authoring operation: the record written and the changeset holding the change
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authored<T> {
    pub changeset_id: i64,
    pub record: T,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewServiceRequest {
    #[validate(custom(function = "validate_name"))]
    pub name: String,
    pub service_type_id: i64,
    #[validate(length(max = 1024))]
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewFeatureRequest {
    #[validate(custom(function = "validate_name"))]
    pub name: String,
    #[validate(length(max = 1024))]
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewKeyRequest {
    pub feature_version_id: i64,
    #[validate(custom(function = "validate_key_name"))]
    pub name: String,
    #[validate(length(max = 1024))]
    #[serde(default)]
    pub description: String,
    /// Payload of the key's default value
    #[validate(length(max = MAX_VALUE_DATA_LENGTH_U64))]
    pub default_value: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SetValueRequest {
    pub key_id: i64,
    pub service_type_id: i64,
    /// Property id to value text; empty or `any` leaves a property unconstrained
    #[serde(default)]
    pub variation: HashMap<i64, String>,
    #[validate(length(max = MAX_VALUE_DATA_LENGTH_U64))]
    pub data: String,
}

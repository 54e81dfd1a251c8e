//! Input validation utilities
//!
//! Field-level checks shared by request structs. Failures surface as
//! `TesseraError::InvalidInput`.

use std::sync::LazyLock;

use validator::{Validate, ValidationError};

use crate::error::Result;

/// Maximum length for service, feature and property names
pub const MAX_NAME_LENGTH: usize = 128;

/// Maximum length for key names
pub const MAX_KEY_NAME_LENGTH: usize = 256;

/// Maximum length for a variation property value
pub const MAX_PROPERTY_VALUE_LENGTH: usize = 128;

/// Default maximum length for changeset comments
pub const MAX_COMMENT_LENGTH: usize = 1024;

/// Maximum length for a value payload (1MB)
pub const MAX_VALUE_DATA_LENGTH: usize = 1024 * 1024;

static NAME_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("^[a-zA-Z0-9_.:-]+$").expect("Invalid regex pattern"));

/// Validate an entity name (service, feature, property)
///
/// Names must be non-empty, at most `MAX_NAME_LENGTH` characters, and contain
/// only alphanumeric characters, underscore, dot, colon and hyphen.
pub fn validate_name(name: &str) -> std::result::Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new("name_empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(ValidationError::new("name_too_long"));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(ValidationError::new("name_invalid_chars"));
    }
    Ok(())
}

/// Validate a key name; same alphabet as entity names but a longer limit
pub fn validate_key_name(name: &str) -> std::result::Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new("key_name_empty"));
    }
    if name.len() > MAX_KEY_NAME_LENGTH {
        return Err(ValidationError::new("key_name_too_long"));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(ValidationError::new("key_name_invalid_chars"));
    }
    Ok(())
}

/// Validate a variation property value.
///
/// The pseudo-value `any` is reserved for "unconstrained" lookups.
pub fn validate_property_value(value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("property_value_empty"));
    }
    if value.len() > MAX_PROPERTY_VALUE_LENGTH {
        return Err(ValidationError::new("property_value_too_long"));
    }
    if value.eq_ignore_ascii_case(crate::ANY_VARIATION_VALUE) {
        return Err(ValidationError::new("property_value_reserved"));
    }
    Ok(())
}

/// Validate a comment against a configurable maximum length
pub fn validate_comment(comment: &str, max_length: usize) -> Result<()> {
    if comment.trim().is_empty() {
        return Err(ValidationError::new("comment_empty").into());
    }
    if comment.chars().count() > max_length {
        return Err(ValidationError::new("comment_too_long").into());
    }
    Ok(())
}

/// Run derive-based validation and convert the outcome
pub fn validate_request<T: Validate>(request: &T) -> Result<()> {
    request.validate()?;
    Ok(())
}

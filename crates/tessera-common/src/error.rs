//! Error types and error codes for Tessera
//!
//! This module defines:
//! - `TesseraError`: the error taxonomy every core operation reports
//! - `ErrorCode`: structured error codes a transport layer can hand out as-is

use serde::{Deserialize, Serialize};

/// Application-specific error types
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TesseraError {
    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("duplicate variation: {0}")]
    DuplicateVariation(String),

    #[error("unknown error: {0}")]
    UnknownError(String),
}

pub type Result<T> = std::result::Result<T, TesseraError>;

impl TesseraError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        TesseraError::RecordNotFound(what.to_string())
    }

    pub fn error_code(&self) -> ErrorCode<'static> {
        match self {
            TesseraError::RecordNotFound(_) => RECORD_NOT_FOUND,
            TesseraError::PermissionDenied(_) => PERMISSION_DENIED,
            TesseraError::InvalidOperation(_) => INVALID_OPERATION,
            TesseraError::InvalidInput(_) => INVALID_INPUT,
            TesseraError::DuplicateVariation(_) => DUPLICATE_VARIATION,
            TesseraError::UnknownError(_) => UNKNOWN_ERROR,
        }
    }
}

/// Storage and other infrastructure failures arrive as `anyhow::Error`.
///
/// An error that already carries a `TesseraError` keeps its kind, anything
/// else is reported as `UnknownError` with the full cause chain.
impl From<anyhow::Error> for TesseraError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<TesseraError>() {
            Ok(e) => e,
            Err(err) => TesseraError::UnknownError(format!("{:#}", err)),
        }
    }
}

impl From<validator::ValidationErrors> for TesseraError {
    fn from(errors: validator::ValidationErrors) -> Self {
        TesseraError::InvalidInput(errors.to_string())
    }
}

impl From<validator::ValidationError> for TesseraError {
    fn from(error: validator::ValidationError) -> Self {
        TesseraError::InvalidInput(error.code.to_string())
    }
}

/// Error code structure for API responses
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const SUCCESS: ErrorCode<'static> = ErrorCode {
    code: 0,
    message: "success",
};

pub const RECORD_NOT_FOUND: ErrorCode<'static> = ErrorCode {
    code: 20004,
    message: "record not found",
};

pub const PERMISSION_DENIED: ErrorCode<'static> = ErrorCode {
    code: 10001,
    message: "permission denied",
};

pub const INVALID_OPERATION: ErrorCode<'static> = ErrorCode {
    code: 23000,
    message: "invalid operation",
};

pub const INVALID_INPUT: ErrorCode<'static> = ErrorCode {
    code: 20002,
    message: "invalid input",
};

pub const DUPLICATE_VARIATION: ErrorCode<'static> = ErrorCode {
    code: 20005,
    message: "duplicate variation",
};

pub const UNKNOWN_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30000,
    message: "unknown error",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tessera_error_display() {
        let err = TesseraError::InvalidOperation("changeset is APPLIED".to_string());
        assert_eq!(format!("{}", err), "invalid operation: changeset is APPLIED");

        let err = TesseraError::not_found("changeset 7");
        assert_eq!(format!("{}", err), "record not found: changeset 7");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(SUCCESS.code, 0);
        assert_eq!(
            TesseraError::PermissionDenied(String::new()).error_code(),
            PERMISSION_DENIED
        );
        assert_eq!(
            TesseraError::UnknownError(String::new()).error_code().code,
            30000
        );
    }

    #[test]
    fn test_from_anyhow_wraps_unknown() {
        let err: TesseraError = anyhow::anyhow!("connection reset").into();
        assert_eq!(err, TesseraError::UnknownError("connection reset".to_string()));
    }

    #[test]
    fn test_from_anyhow_keeps_kind() {
        let inner = anyhow::Error::new(TesseraError::not_found("key 3"));
        let err: TesseraError = inner.into();
        assert!(matches!(err, TesseraError::RecordNotFound(_)));
    }

    #[test]
    fn test_from_anyhow_keeps_context_chain() {
        let err: TesseraError = anyhow::anyhow!("disk full")
            .context("writing changeset")
            .into();
        assert_eq!(
            err,
            TesseraError::UnknownError("writing changeset: disk full".to_string())
        );
    }
}

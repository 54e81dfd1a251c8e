//! Tessera Common - Shared types, traits, and utilities
//!
//! This crate provides the foundational types used across all Tessera components:
//! - Error types and error codes
//! - The caller identity passed into every core operation
//! - Input validation helpers
//! - Common constants

pub mod error;
pub mod traits;
pub mod validation;

// Re-exports for convenience
pub use error::{ErrorCode, Result, TesseraError};
pub use traits::*;

/// Id of the well-known variation context with no property values (the default context)
pub const DEFAULT_VARIATION_CONTEXT_ID: i64 = 1;

/// Pseudo-value meaning "unconstrained" when mapping a variation to property values
pub const ANY_VARIATION_VALUE: &str = "any";

//! Tessera Changeset - changeset workflow over versioned configuration
//!
//! - `service`: changeset lifecycle, apply and discard
//! - `state`: the transition table
//! - `conflict`: conflict checkers over pending changes
//! - `pending`: loading pending changes with the live state they are checked against
//! - `authoring`: entity mutations recorded as pending changes

pub mod authoring;
pub mod conflict;
pub mod model;
pub mod pending;
pub mod service;
pub mod state;

pub use authoring::AuthoringService;
pub use conflict::{ConflictKind, PendingChange, ScanState, check_change, detect_conflicts};
pub use model::{
    Authored, ChangeView, ChangesetOptions, NewFeatureRequest, NewKeyRequest, NewServiceRequest,
    SetValueRequest,
};
pub use pending::load_pending_changes;
pub use service::ChangesetService;
pub use state::{Transition, check_transition};

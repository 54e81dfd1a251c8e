//! SeaORM entity definitions for every persisted table

pub mod prelude;

pub mod changeset;
pub mod changeset_action;
pub mod changeset_change;
pub mod config_key;
pub mod feature;
pub mod feature_version;
pub mod feature_version_service_version;
pub mod service;
pub mod service_type;
pub mod service_type_variation_property;
pub mod service_version;
pub mod variation_context;
pub mod variation_context_variation_property_value;
pub mod variation_property;
pub mod variation_property_value;
pub mod variation_value;

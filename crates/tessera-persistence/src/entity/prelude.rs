//! SeaORM entity prelude

pub use super::changeset::Entity as Changeset;
pub use super::changeset_action::Entity as ChangesetAction;
pub use super::changeset_change::Entity as ChangesetChange;
pub use super::config_key::Entity as ConfigKey;
pub use super::feature::Entity as Feature;
pub use super::feature_version::Entity as FeatureVersion;
pub use super::feature_version_service_version::Entity as FeatureVersionServiceVersion;
pub use super::service::Entity as Service;
pub use super::service_type::Entity as ServiceType;
pub use super::service_type_variation_property::Entity as ServiceTypeVariationProperty;
pub use super::service_version::Entity as ServiceVersion;
pub use super::variation_context::Entity as VariationContext;
pub use super::variation_context_variation_property_value::Entity as VariationContextVariationPropertyValue;
pub use super::variation_property::Entity as VariationProperty;
pub use super::variation_property_value::Entity as VariationPropertyValue;
pub use super::variation_value::Entity as VariationValue;

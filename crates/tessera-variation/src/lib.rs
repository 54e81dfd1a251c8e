//! Tessera Variation - variation hierarchy and context resolution
//!
//! - `hierarchy`: property/value forest, rank and order computation, matching
//! - `cache`: atomically swapped hierarchy snapshots with a staleness TTL
//! - `context`: canonical variation context identities
//! - `admin`: administrator operations on properties, values and service types

pub mod admin;
pub mod cache;
pub mod context;
pub mod hierarchy;

pub use admin::{
    NewPropertyRequest, NewPropertyValueRequest, NewServiceTypeRequest, VariationAdminService,
};
pub use cache::{HierarchyCache, HierarchyOptions, HierarchySnapshot};
pub use context::{
    canonicalize, find_variation_context_id, get_variation_context_id,
    get_variation_context_values, resolve_variation_context,
};
pub use hierarchy::{
    HierarchyData, PropertyNode, RankedProperty, ServiceTypeNode, ValueNode, VariationHierarchy,
};

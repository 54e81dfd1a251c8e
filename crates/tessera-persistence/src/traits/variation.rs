//! Variation metadata persistence trait
//!
//! Properties, their value forests, service types and variation contexts.
//! These rows are managed by administrators outside the changeset workflow.

use async_trait::async_trait;

use crate::model::{
    ServiceTypePropertyRecord, ServiceTypeRecord, VariationPropertyRecord,
    VariationPropertyValueRecord,
};

/// Variation metadata and context operations
#[async_trait]
pub trait VariationPersistence: Send + Sync {
    async fn property_list(&self) -> anyhow::Result<Vec<VariationPropertyRecord>>;

    async fn property_create(
        &mut self,
        name: &str,
        description: &str,
    ) -> anyhow::Result<VariationPropertyRecord>;

    async fn property_value_list(&self) -> anyhow::Result<Vec<VariationPropertyValueRecord>>;

    async fn property_value_create(
        &mut self,
        property_id: i64,
        value: &str,
        parent_id: Option<i64>,
        sort_order: i32,
    ) -> anyhow::Result<VariationPropertyValueRecord>;

    async fn service_type_list(&self) -> anyhow::Result<Vec<ServiceTypeRecord>>;

    async fn service_type_create(&mut self, name: &str) -> anyhow::Result<ServiceTypeRecord>;

    async fn service_type_property_list(&self) -> anyhow::Result<Vec<ServiceTypePropertyRecord>>;

    /// Attach a property to a service type, replacing the priority if already attached
    async fn service_type_property_upsert(
        &mut self,
        service_type_id: i64,
        property_id: i64,
        priority: i32,
    ) -> anyhow::Result<ServiceTypePropertyRecord>;

    /// Find the context whose member set equals `value_ids` (sorted, deduplicated)
    async fn context_find(&self, value_ids: &[i64]) -> anyhow::Result<Option<i64>>;

    /// Create a context for `value_ids` (sorted, deduplicated)
    async fn context_create(&mut self, value_ids: &[i64]) -> anyhow::Result<i64>;

    /// Property value ids making up a context, ascending
    async fn context_values(&self, context_id: i64) -> anyhow::Result<Vec<i64>>;
}

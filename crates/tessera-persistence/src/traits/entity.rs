//! Versioned entity persistence trait
//!
//! Services, features, their versions, links, keys and variation values all
//! carry a validity window. Rows are inserted pending and only become live
//! through `start_validity`.

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::model::{
    FeatureRecord, FeatureVersionRecord, KeyRecord, LinkRecord, ServiceRecord,
    ServiceVersionRecord, VariationValueRecord, VersionedEntity,
};

/// Versioned configuration entity operations
#[async_trait]
pub trait EntityPersistence: Send + Sync {
    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    async fn service_find(&self, id: i64) -> anyhow::Result<Option<ServiceRecord>>;

    /// Find a service that is live or pending by name
    async fn service_find_by_name(&self, name: &str) -> anyhow::Result<Option<ServiceRecord>>;

    async fn service_create(
        &mut self,
        name: &str,
        service_type_id: i64,
        description: &str,
    ) -> anyhow::Result<ServiceRecord>;

    async fn service_delete(&mut self, id: i64) -> anyhow::Result<bool>;

    async fn service_version_find(&self, id: i64)
    -> anyhow::Result<Option<ServiceVersionRecord>>;

    async fn service_version_create(
        &mut self,
        service_id: i64,
        version: i32,
    ) -> anyhow::Result<ServiceVersionRecord>;

    async fn service_version_delete(&mut self, id: i64) -> anyhow::Result<bool>;

    /// Highest version number of a service; `live_only` ignores pending and ended rows
    async fn service_version_max(
        &self,
        service_id: i64,
        live_only: bool,
    ) -> anyhow::Result<Option<i32>>;

    async fn service_version_set_published(
        &mut self,
        id: i64,
        published: bool,
    ) -> anyhow::Result<bool>;

    // ------------------------------------------------------------------
    // Features
    // ------------------------------------------------------------------

    async fn feature_find(&self, id: i64) -> anyhow::Result<Option<FeatureRecord>>;

    /// Find a feature that is live or pending by name
    async fn feature_find_by_name(&self, name: &str) -> anyhow::Result<Option<FeatureRecord>>;

    async fn feature_create(
        &mut self,
        name: &str,
        description: &str,
    ) -> anyhow::Result<FeatureRecord>;

    async fn feature_delete(&mut self, id: i64) -> anyhow::Result<bool>;

    async fn feature_version_find(&self, id: i64)
    -> anyhow::Result<Option<FeatureVersionRecord>>;

    async fn feature_version_create(
        &mut self,
        feature_id: i64,
        version: i32,
    ) -> anyhow::Result<FeatureVersionRecord>;

    async fn feature_version_delete(&mut self, id: i64) -> anyhow::Result<bool>;

    /// Highest version number of a feature; `live_only` ignores pending and ended rows
    async fn feature_version_max(
        &self,
        feature_id: i64,
        live_only: bool,
    ) -> anyhow::Result<Option<i32>>;

    // ------------------------------------------------------------------
    // Feature version <-> service version links
    // ------------------------------------------------------------------

    async fn link_find(&self, id: i64) -> anyhow::Result<Option<LinkRecord>>;

    async fn link_create(
        &mut self,
        feature_version_id: i64,
        service_version_id: i64,
    ) -> anyhow::Result<LinkRecord>;

    async fn link_delete(&mut self, id: i64) -> anyhow::Result<bool>;

    /// Live link between any version of a feature and a service version
    async fn link_find_live(
        &self,
        feature_id: i64,
        service_version_id: i64,
    ) -> anyhow::Result<Option<LinkRecord>>;

    /// Every link of a feature version, whatever its validity
    async fn link_list_by_feature_version(
        &self,
        feature_version_id: i64,
    ) -> anyhow::Result<Vec<LinkRecord>>;

    /// Ids of the services a feature is linked to through links that have not ended
    async fn link_services_for_feature(&self, feature_id: i64) -> anyhow::Result<Vec<i64>>;

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    async fn key_find(&self, id: i64) -> anyhow::Result<Option<KeyRecord>>;

    async fn key_create(
        &mut self,
        feature_version_id: i64,
        name: &str,
        description: &str,
    ) -> anyhow::Result<KeyRecord>;

    async fn key_delete(&mut self, id: i64) -> anyhow::Result<bool>;

    /// Live key with the given name in a feature version
    async fn key_find_live_by_name(
        &self,
        feature_version_id: i64,
        name: &str,
    ) -> anyhow::Result<Option<KeyRecord>>;

    /// Replace a key's validators in place and stamp the audit time
    async fn key_update_validators(
        &mut self,
        id: i64,
        validators: Option<&str>,
        at: NaiveDateTime,
    ) -> anyhow::Result<bool>;

    // ------------------------------------------------------------------
    // Variation values
    // ------------------------------------------------------------------

    async fn value_find(&self, id: i64) -> anyhow::Result<Option<VariationValueRecord>>;

    async fn value_create(
        &mut self,
        key_id: i64,
        variation_context_id: i64,
        data: &str,
    ) -> anyhow::Result<VariationValueRecord>;

    async fn value_delete(&mut self, id: i64) -> anyhow::Result<bool>;

    /// Live value of a key in a variation context
    async fn value_find_live(
        &self,
        key_id: i64,
        variation_context_id: i64,
    ) -> anyhow::Result<Option<VariationValueRecord>>;

    /// Live values of a key across all contexts
    async fn value_list_live(&self, key_id: i64) -> anyhow::Result<Vec<VariationValueRecord>>;

    // ------------------------------------------------------------------
    // Validity windows
    // ------------------------------------------------------------------

    /// Open the validity window of a row; returns false when the row is missing
    async fn start_validity(
        &mut self,
        entity: VersionedEntity,
        id: i64,
        at: NaiveDateTime,
    ) -> anyhow::Result<bool>;

    /// Close the validity window of a row; returns false when the row is missing
    async fn end_validity(
        &mut self,
        entity: VersionedEntity,
        id: i64,
        at: NaiveDateTime,
    ) -> anyhow::Result<bool>;
}

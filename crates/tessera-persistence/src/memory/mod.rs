// In-memory persistence backend
// Keeps the whole store in one process-local state value. A transaction holds
// the state lock for its whole lifetime and works on a private copy, so
// transactions are serializable and a rollback simply drops the copy.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use tessera_common::{DEFAULT_VARIATION_CONTEXT_ID, TesseraError};

use crate::model::*;
use crate::traits::*;

#[derive(Clone, Debug)]
struct MemoryState {
    next_id: i64,
    /// One-shot fault injection armed for the next transaction
    fail_after_validity_writes: Option<usize>,

    changesets: BTreeMap<i64, ChangesetRecord>,
    changes: BTreeMap<i64, ChangeRecord>,
    actions: BTreeMap<i64, ChangesetActionRecord>,

    services: BTreeMap<i64, ServiceRecord>,
    service_versions: BTreeMap<i64, ServiceVersionRecord>,
    features: BTreeMap<i64, FeatureRecord>,
    feature_versions: BTreeMap<i64, FeatureVersionRecord>,
    links: BTreeMap<i64, LinkRecord>,
    keys: BTreeMap<i64, KeyRecord>,
    values: BTreeMap<i64, VariationValueRecord>,

    properties: BTreeMap<i64, VariationPropertyRecord>,
    property_values: BTreeMap<i64, VariationPropertyValueRecord>,
    service_types: BTreeMap<i64, ServiceTypeRecord>,
    service_type_properties: Vec<ServiceTypePropertyRecord>,
    contexts: BTreeMap<i64, Vec<i64>>,
}

impl MemoryState {
    fn new() -> Self {
        let mut contexts = BTreeMap::new();
        contexts.insert(DEFAULT_VARIATION_CONTEXT_ID, Vec::new());
        Self {
            next_id: DEFAULT_VARIATION_CONTEXT_ID + 1,
            fail_after_validity_writes: None,
            changesets: BTreeMap::new(),
            changes: BTreeMap::new(),
            actions: BTreeMap::new(),
            services: BTreeMap::new(),
            service_versions: BTreeMap::new(),
            features: BTreeMap::new(),
            feature_versions: BTreeMap::new(),
            links: BTreeMap::new(),
            keys: BTreeMap::new(),
            values: BTreeMap::new(),
            properties: BTreeMap::new(),
            property_values: BTreeMap::new(),
            service_types: BTreeMap::new(),
            service_type_properties: Vec::new(),
            contexts,
        }
    }

    fn next_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn validity_mut(&mut self, entity: VersionedEntity, id: i64) -> Option<&mut Validity> {
        match entity {
            VersionedEntity::Service => self.services.get_mut(&id).map(|r| &mut r.validity),
            VersionedEntity::ServiceVersion => {
                self.service_versions.get_mut(&id).map(|r| &mut r.validity)
            }
            VersionedEntity::Feature => self.features.get_mut(&id).map(|r| &mut r.validity),
            VersionedEntity::FeatureVersion => {
                self.feature_versions.get_mut(&id).map(|r| &mut r.validity)
            }
            VersionedEntity::Link => self.links.get_mut(&id).map(|r| &mut r.validity),
            VersionedEntity::Key => self.keys.get_mut(&id).map(|r| &mut r.validity),
            VersionedEntity::VariationValue => self.values.get_mut(&id).map(|r| &mut r.validity),
        }
    }

    fn feature_of_version(&self, feature_version_id: i64) -> Option<i64> {
        self.feature_versions
            .get(&feature_version_id)
            .map(|fv| fv.feature_id)
    }
}

/// In-memory persistence service
///
/// Suitable for tests and single-process tooling. State is lost on drop.
#[derive(Clone)]
pub struct MemoryPersistService {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryPersistService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistService {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::new())),
        }
    }

    /// Make the next transaction fail on its validity write number `writes + 1`.
    ///
    /// The fault is consumed when that transaction begins.
    pub async fn fail_after_validity_writes(&self, writes: usize) {
        self.state.lock().await.fail_after_validity_writes = Some(writes);
    }
}

#[async_trait]
impl PersistenceService for MemoryPersistService {
    async fn begin(&self) -> anyhow::Result<Box<dyn PersistenceTransaction>> {
        let mut guard = self.state.clone().lock_owned().await;
        let fail_after = guard.fail_after_validity_writes.take();
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            fail_after,
            validity_writes: 0,
        }))
    }

    fn storage_mode(&self) -> StorageMode {
        StorageMode::Memory
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Transaction over the in-memory state
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    fail_after: Option<usize>,
    validity_writes: usize,
}

impl MemoryTransaction {
    fn record_validity_write(&mut self) -> anyhow::Result<()> {
        if let Some(limit) = self.fail_after
            && self.validity_writes >= limit
        {
            anyhow::bail!("Injected storage failure after {} validity writes", limit);
        }
        self.validity_writes += 1;
        Ok(())
    }
}

#[async_trait]
impl PersistenceTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

// ============================================================================
// ChangesetPersistence implementation
// ============================================================================

#[async_trait]
impl ChangesetPersistence for MemoryTransaction {
    async fn changeset_find(&self, id: i64) -> anyhow::Result<Option<ChangesetRecord>> {
        Ok(self.working.changesets.get(&id).cloned())
    }

    async fn changeset_find_open_by_user(
        &self,
        user_id: i64,
    ) -> anyhow::Result<Option<ChangesetRecord>> {
        Ok(self
            .working
            .changesets
            .values()
            .find(|c| c.user_id == user_id && c.state == ChangesetState::Open)
            .cloned())
    }

    async fn changeset_list(
        &self,
        user_id: Option<i64>,
        state: Option<ChangesetState>,
    ) -> anyhow::Result<Vec<ChangesetRecord>> {
        Ok(self
            .working
            .changesets
            .values()
            .filter(|c| user_id.is_none_or(|u| c.user_id == u))
            .filter(|c| state.is_none_or(|s| c.state == s))
            .cloned()
            .collect())
    }

    async fn changeset_create(
        &mut self,
        user_id: i64,
        at: NaiveDateTime,
    ) -> anyhow::Result<ChangesetRecord> {
        let id = self.working.next_id();
        let record = ChangesetRecord {
            id,
            user_id,
            state: ChangesetState::Open,
            created_at: at,
            applied_at: None,
        };
        self.working.changesets.insert(id, record.clone());
        Ok(record)
    }

    async fn changeset_lock(&mut self, id: i64) -> anyhow::Result<Option<ChangesetRecord>> {
        // The whole state is already held exclusively
        Ok(self.working.changesets.get(&id).cloned())
    }

    async fn changeset_update_state(
        &mut self,
        id: i64,
        state: ChangesetState,
        applied_at: Option<NaiveDateTime>,
    ) -> anyhow::Result<()> {
        let changeset = self
            .working
            .changesets
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("Changeset {} not found", id))?;
        changeset.state = state;
        if applied_at.is_some() {
            changeset.applied_at = applied_at;
        }
        Ok(())
    }

    async fn change_create(
        &mut self,
        changeset_id: i64,
        change_type: ChangeType,
        kind: ChangeKind,
        at: NaiveDateTime,
    ) -> anyhow::Result<ChangeRecord> {
        let id = self.working.next_id();
        let record = ChangeRecord {
            id,
            changeset_id,
            change_type,
            kind,
            created_at: at,
        };
        self.working.changes.insert(id, record.clone());
        Ok(record)
    }

    async fn change_find(&self, id: i64) -> anyhow::Result<Option<ChangeRecord>> {
        Ok(self.working.changes.get(&id).cloned())
    }

    async fn change_list(&self, changeset_id: i64) -> anyhow::Result<Vec<ChangeRecord>> {
        Ok(self
            .working
            .changes
            .values()
            .filter(|c| c.changeset_id == changeset_id)
            .cloned()
            .collect())
    }

    async fn change_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(self.working.changes.remove(&id).is_some())
    }

    async fn change_delete_by_changeset(&mut self, changeset_id: i64) -> anyhow::Result<u64> {
        let before = self.working.changes.len();
        self.working
            .changes
            .retain(|_, c| c.changeset_id != changeset_id);
        Ok((before - self.working.changes.len()) as u64)
    }

    async fn action_create(
        &mut self,
        changeset_id: i64,
        action_type: ActionType,
        comment: Option<&str>,
        user_id: i64,
        at: NaiveDateTime,
    ) -> anyhow::Result<ChangesetActionRecord> {
        let id = self.working.next_id();
        let record = ChangesetActionRecord {
            id,
            changeset_id,
            action_type,
            comment: comment.map(str::to_string),
            user_id,
            created_at: at,
        };
        self.working.actions.insert(id, record.clone());
        Ok(record)
    }

    async fn action_list(&self, changeset_id: i64) -> anyhow::Result<Vec<ChangesetActionRecord>> {
        Ok(self
            .working
            .actions
            .values()
            .filter(|a| a.changeset_id == changeset_id)
            .cloned()
            .collect())
    }
}

// ============================================================================
// EntityPersistence implementation
// ============================================================================

#[async_trait]
impl EntityPersistence for MemoryTransaction {
    async fn service_find(&self, id: i64) -> anyhow::Result<Option<ServiceRecord>> {
        Ok(self.working.services.get(&id).cloned())
    }

    async fn service_find_by_name(&self, name: &str) -> anyhow::Result<Option<ServiceRecord>> {
        Ok(self
            .working
            .services
            .values()
            .find(|s| s.name == name && !s.validity.has_ended())
            .cloned())
    }

    async fn service_create(
        &mut self,
        name: &str,
        service_type_id: i64,
        description: &str,
    ) -> anyhow::Result<ServiceRecord> {
        let id = self.working.next_id();
        let record = ServiceRecord {
            id,
            name: name.to_string(),
            service_type_id,
            description: description.to_string(),
            validity: Validity::default(),
        };
        self.working.services.insert(id, record.clone());
        Ok(record)
    }

    async fn service_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(self.working.services.remove(&id).is_some())
    }

    async fn service_version_find(
        &self,
        id: i64,
    ) -> anyhow::Result<Option<ServiceVersionRecord>> {
        Ok(self.working.service_versions.get(&id).cloned())
    }

    async fn service_version_create(
        &mut self,
        service_id: i64,
        version: i32,
    ) -> anyhow::Result<ServiceVersionRecord> {
        let id = self.working.next_id();
        let record = ServiceVersionRecord {
            id,
            service_id,
            version,
            published: false,
            validity: Validity::default(),
        };
        self.working.service_versions.insert(id, record.clone());
        Ok(record)
    }

    async fn service_version_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(self.working.service_versions.remove(&id).is_some())
    }

    async fn service_version_max(
        &self,
        service_id: i64,
        live_only: bool,
    ) -> anyhow::Result<Option<i32>> {
        Ok(self
            .working
            .service_versions
            .values()
            .filter(|v| v.service_id == service_id)
            .filter(|v| !live_only || v.validity.is_live())
            .map(|v| v.version)
            .max())
    }

    async fn service_version_set_published(
        &mut self,
        id: i64,
        published: bool,
    ) -> anyhow::Result<bool> {
        match self.working.service_versions.get_mut(&id) {
            Some(version) => {
                version.published = published;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn feature_find(&self, id: i64) -> anyhow::Result<Option<FeatureRecord>> {
        Ok(self.working.features.get(&id).cloned())
    }

    async fn feature_find_by_name(&self, name: &str) -> anyhow::Result<Option<FeatureRecord>> {
        Ok(self
            .working
            .features
            .values()
            .find(|f| f.name == name && !f.validity.has_ended())
            .cloned())
    }

    async fn feature_create(
        &mut self,
        name: &str,
        description: &str,
    ) -> anyhow::Result<FeatureRecord> {
        let id = self.working.next_id();
        let record = FeatureRecord {
            id,
            name: name.to_string(),
            description: description.to_string(),
            validity: Validity::default(),
        };
        self.working.features.insert(id, record.clone());
        Ok(record)
    }

    async fn feature_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(self.working.features.remove(&id).is_some())
    }

    async fn feature_version_find(
        &self,
        id: i64,
    ) -> anyhow::Result<Option<FeatureVersionRecord>> {
        Ok(self.working.feature_versions.get(&id).cloned())
    }

    async fn feature_version_create(
        &mut self,
        feature_id: i64,
        version: i32,
    ) -> anyhow::Result<FeatureVersionRecord> {
        let id = self.working.next_id();
        let record = FeatureVersionRecord {
            id,
            feature_id,
            version,
            validity: Validity::default(),
        };
        self.working.feature_versions.insert(id, record.clone());
        Ok(record)
    }

    async fn feature_version_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(self.working.feature_versions.remove(&id).is_some())
    }

    async fn feature_version_max(
        &self,
        feature_id: i64,
        live_only: bool,
    ) -> anyhow::Result<Option<i32>> {
        Ok(self
            .working
            .feature_versions
            .values()
            .filter(|v| v.feature_id == feature_id)
            .filter(|v| !live_only || v.validity.is_live())
            .map(|v| v.version)
            .max())
    }

    async fn link_find(&self, id: i64) -> anyhow::Result<Option<LinkRecord>> {
        Ok(self.working.links.get(&id).cloned())
    }

    async fn link_create(
        &mut self,
        feature_version_id: i64,
        service_version_id: i64,
    ) -> anyhow::Result<LinkRecord> {
        let id = self.working.next_id();
        let record = LinkRecord {
            id,
            feature_version_id,
            service_version_id,
            validity: Validity::default(),
        };
        self.working.links.insert(id, record.clone());
        Ok(record)
    }

    async fn link_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(self.working.links.remove(&id).is_some())
    }

    async fn link_find_live(
        &self,
        feature_id: i64,
        service_version_id: i64,
    ) -> anyhow::Result<Option<LinkRecord>> {
        Ok(self
            .working
            .links
            .values()
            .filter(|l| l.validity.is_live() && l.service_version_id == service_version_id)
            .find(|l| self.working.feature_of_version(l.feature_version_id) == Some(feature_id))
            .cloned())
    }

    async fn link_list_by_feature_version(
        &self,
        feature_version_id: i64,
    ) -> anyhow::Result<Vec<LinkRecord>> {
        Ok(self
            .working
            .links
            .values()
            .filter(|l| l.feature_version_id == feature_version_id)
            .cloned()
            .collect())
    }

    async fn link_services_for_feature(&self, feature_id: i64) -> anyhow::Result<Vec<i64>> {
        let mut services: Vec<i64> = self
            .working
            .links
            .values()
            .filter(|l| !l.validity.has_ended())
            .filter(|l| self.working.feature_of_version(l.feature_version_id) == Some(feature_id))
            .filter_map(|l| self.working.service_versions.get(&l.service_version_id))
            .map(|sv| sv.service_id)
            .collect();
        services.sort_unstable();
        services.dedup();
        Ok(services)
    }

    async fn key_find(&self, id: i64) -> anyhow::Result<Option<KeyRecord>> {
        Ok(self.working.keys.get(&id).cloned())
    }

    async fn key_create(
        &mut self,
        feature_version_id: i64,
        name: &str,
        description: &str,
    ) -> anyhow::Result<KeyRecord> {
        let id = self.working.next_id();
        let record = KeyRecord {
            id,
            feature_version_id,
            name: name.to_string(),
            description: description.to_string(),
            validators: None,
            validators_updated_at: None,
            validity: Validity::default(),
        };
        self.working.keys.insert(id, record.clone());
        Ok(record)
    }

    async fn key_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(self.working.keys.remove(&id).is_some())
    }

    async fn key_find_live_by_name(
        &self,
        feature_version_id: i64,
        name: &str,
    ) -> anyhow::Result<Option<KeyRecord>> {
        Ok(self
            .working
            .keys
            .values()
            .find(|k| {
                k.feature_version_id == feature_version_id
                    && k.name == name
                    && k.validity.is_live()
            })
            .cloned())
    }

    async fn key_update_validators(
        &mut self,
        id: i64,
        validators: Option<&str>,
        at: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        match self.working.keys.get_mut(&id) {
            Some(key) => {
                key.validators = validators.map(str::to_string);
                key.validators_updated_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn value_find(&self, id: i64) -> anyhow::Result<Option<VariationValueRecord>> {
        Ok(self.working.values.get(&id).cloned())
    }

    async fn value_create(
        &mut self,
        key_id: i64,
        variation_context_id: i64,
        data: &str,
    ) -> anyhow::Result<VariationValueRecord> {
        let id = self.working.next_id();
        let record = VariationValueRecord {
            id,
            key_id,
            variation_context_id,
            data: data.to_string(),
            validity: Validity::default(),
        };
        self.working.values.insert(id, record.clone());
        Ok(record)
    }

    async fn value_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(self.working.values.remove(&id).is_some())
    }

    async fn value_find_live(
        &self,
        key_id: i64,
        variation_context_id: i64,
    ) -> anyhow::Result<Option<VariationValueRecord>> {
        Ok(self
            .working
            .values
            .values()
            .find(|v| {
                v.key_id == key_id
                    && v.variation_context_id == variation_context_id
                    && v.validity.is_live()
            })
            .cloned())
    }

    async fn value_list_live(&self, key_id: i64) -> anyhow::Result<Vec<VariationValueRecord>> {
        Ok(self
            .working
            .values
            .values()
            .filter(|v| v.key_id == key_id && v.validity.is_live())
            .cloned()
            .collect())
    }

    async fn start_validity(
        &mut self,
        entity: VersionedEntity,
        id: i64,
        at: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        self.record_validity_write()?;
        match self.working.validity_mut(entity, id) {
            Some(validity) => {
                validity.valid_from = Some(at);
                validity.valid_to = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn end_validity(
        &mut self,
        entity: VersionedEntity,
        id: i64,
        at: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        self.record_validity_write()?;
        match self.working.validity_mut(entity, id) {
            Some(validity) => {
                validity.valid_to = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ============================================================================
// VariationPersistence implementation
// ============================================================================

#[async_trait]
impl VariationPersistence for MemoryTransaction {
    async fn property_list(&self) -> anyhow::Result<Vec<VariationPropertyRecord>> {
        Ok(self.working.properties.values().cloned().collect())
    }

    async fn property_create(
        &mut self,
        name: &str,
        description: &str,
    ) -> anyhow::Result<VariationPropertyRecord> {
        if self.working.properties.values().any(|p| p.name == name) {
            anyhow::bail!("Variation property '{}' already exists", name);
        }
        let id = self.working.next_id();
        let record = VariationPropertyRecord {
            id,
            name: name.to_string(),
            description: description.to_string(),
        };
        self.working.properties.insert(id, record.clone());
        Ok(record)
    }

    async fn property_value_list(&self) -> anyhow::Result<Vec<VariationPropertyValueRecord>> {
        Ok(self.working.property_values.values().cloned().collect())
    }

    async fn property_value_create(
        &mut self,
        property_id: i64,
        value: &str,
        parent_id: Option<i64>,
        sort_order: i32,
    ) -> anyhow::Result<VariationPropertyValueRecord> {
        let id = self.working.next_id();
        let record = VariationPropertyValueRecord {
            id,
            property_id,
            value: value.to_string(),
            parent_id,
            sort_order,
        };
        self.working.property_values.insert(id, record.clone());
        Ok(record)
    }

    async fn service_type_list(&self) -> anyhow::Result<Vec<ServiceTypeRecord>> {
        Ok(self.working.service_types.values().cloned().collect())
    }

    async fn service_type_create(&mut self, name: &str) -> anyhow::Result<ServiceTypeRecord> {
        if self.working.service_types.values().any(|t| t.name == name) {
            anyhow::bail!("Service type '{}' already exists", name);
        }
        let id = self.working.next_id();
        let record = ServiceTypeRecord {
            id,
            name: name.to_string(),
        };
        self.working.service_types.insert(id, record.clone());
        Ok(record)
    }

    async fn service_type_property_list(&self) -> anyhow::Result<Vec<ServiceTypePropertyRecord>> {
        Ok(self.working.service_type_properties.clone())
    }

    async fn service_type_property_upsert(
        &mut self,
        service_type_id: i64,
        property_id: i64,
        priority: i32,
    ) -> anyhow::Result<ServiceTypePropertyRecord> {
        let record = ServiceTypePropertyRecord {
            service_type_id,
            property_id,
            priority,
        };
        match self
            .working
            .service_type_properties
            .iter_mut()
            .find(|r| r.service_type_id == service_type_id && r.property_id == property_id)
        {
            Some(existing) => existing.priority = priority,
            None => self.working.service_type_properties.push(record.clone()),
        }
        Ok(record)
    }

    async fn context_find(&self, value_ids: &[i64]) -> anyhow::Result<Option<i64>> {
        Ok(self
            .working
            .contexts
            .iter()
            .find(|(_, members)| members.as_slice() == value_ids)
            .map(|(id, _)| *id))
    }

    async fn context_create(&mut self, value_ids: &[i64]) -> anyhow::Result<i64> {
        let id = self.working.next_id();
        self.working.contexts.insert(id, value_ids.to_vec());
        Ok(id)
    }

    async fn context_values(&self, context_id: i64) -> anyhow::Result<Vec<i64>> {
        self.working
            .contexts
            .get(&context_id)
            .cloned()
            .ok_or_else(|| {
                anyhow::Error::new(TesseraError::not_found(format!(
                    "variation context {}",
                    context_id
                )))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> NaiveDateTime {
        chrono::DateTime::from_timestamp(secs, 0)
            .unwrap()
            .naive_utc()
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let svc = MemoryPersistService::new();

        let mut tx = svc.begin().await.unwrap();
        let changeset = tx.changeset_create(7, at(0)).await.unwrap();
        tx.commit().await.unwrap();

        let tx = svc.begin().await.unwrap();
        let found = tx.changeset_find(changeset.id).await.unwrap().unwrap();
        assert_eq!(found.user_id, 7);
        assert_eq!(found.state, ChangesetState::Open);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let svc = MemoryPersistService::new();

        let mut tx = svc.begin().await.unwrap();
        let feature = tx.feature_create("checkout", "").await.unwrap();
        tx.rollback().await.unwrap();

        let tx = svc.begin().await.unwrap();
        assert!(tx.feature_find(feature.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drop_without_commit_discards_writes() {
        let svc = MemoryPersistService::new();
        {
            let mut tx = svc.begin().await.unwrap();
            tx.service_type_create("web").await.unwrap();
        }
        let tx = svc.begin().await.unwrap();
        assert!(tx.service_type_list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_default_context_is_seeded() {
        let svc = MemoryPersistService::new();
        let tx = svc.begin().await.unwrap();
        assert_eq!(
            tx.context_find(&[]).await.unwrap(),
            Some(DEFAULT_VARIATION_CONTEXT_ID)
        );
        assert!(
            tx.context_values(DEFAULT_VARIATION_CONTEXT_ID)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_validity_windows() {
        let svc = MemoryPersistService::new();
        let mut tx = svc.begin().await.unwrap();
        let feature = tx.feature_create("search", "").await.unwrap();
        let fv = tx.feature_version_create(feature.id, 1).await.unwrap();
        assert_eq!(tx.feature_version_max(feature.id, true).await.unwrap(), None);
        assert_eq!(
            tx.feature_version_max(feature.id, false).await.unwrap(),
            Some(1)
        );

        assert!(
            tx.start_validity(VersionedEntity::FeatureVersion, fv.id, at(10))
                .await
                .unwrap()
        );
        assert_eq!(
            tx.feature_version_max(feature.id, true).await.unwrap(),
            Some(1)
        );

        assert!(
            tx.end_validity(VersionedEntity::FeatureVersion, fv.id, at(20))
                .await
                .unwrap()
        );
        let ended = tx.feature_version_find(fv.id).await.unwrap().unwrap();
        assert!(ended.validity.has_ended());
        assert!(
            !tx.start_validity(VersionedEntity::Key, 9999, at(30))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let svc = MemoryPersistService::new();
        svc.fail_after_validity_writes(1).await;

        let mut tx = svc.begin().await.unwrap();
        let feature = tx.feature_create("f", "").await.unwrap();
        assert!(
            tx.start_validity(VersionedEntity::Feature, feature.id, at(1))
                .await
                .is_ok()
        );
        assert!(
            tx.end_validity(VersionedEntity::Feature, feature.id, at(2))
                .await
                .is_err()
        );
        tx.rollback().await.unwrap();

        let mut tx = svc.begin().await.unwrap();
        let feature = tx.feature_create("f", "").await.unwrap();
        for secs in 0..3 {
            assert!(
                tx.start_validity(VersionedEntity::Feature, feature.id, at(secs))
                    .await
                    .is_ok()
            );
        }
    }

    #[tokio::test]
    async fn test_link_lookups_follow_feature() {
        let svc = MemoryPersistService::new();
        let mut tx = svc.begin().await.unwrap();
        let service = tx.service_create("api", 1, "").await.unwrap();
        let sv = tx.service_version_create(service.id, 1).await.unwrap();
        let feature = tx.feature_create("f", "").await.unwrap();
        let fv1 = tx.feature_version_create(feature.id, 1).await.unwrap();
        let fv2 = tx.feature_version_create(feature.id, 2).await.unwrap();

        let link = tx.link_create(fv1.id, sv.id).await.unwrap();
        assert!(tx.link_find_live(feature.id, sv.id).await.unwrap().is_none());
        assert_eq!(
            tx.link_services_for_feature(feature.id).await.unwrap(),
            vec![service.id]
        );

        tx.start_validity(VersionedEntity::Link, link.id, at(5))
            .await
            .unwrap();
        let live = tx.link_find_live(feature.id, sv.id).await.unwrap().unwrap();
        assert_eq!(live.id, link.id);
        assert!(
            tx.link_list_by_feature_version(fv2.id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_service_type_property_upsert_replaces_priority() {
        let svc = MemoryPersistService::new();
        let mut tx = svc.begin().await.unwrap();
        let st = tx.service_type_create("web").await.unwrap();
        let prop = tx.property_create("env", "").await.unwrap();
        tx.service_type_property_upsert(st.id, prop.id, 5)
            .await
            .unwrap();
        tx.service_type_property_upsert(st.id, prop.id, 1)
            .await
            .unwrap();

        let links = tx.service_type_property_list().await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].priority, 1);
    }
}

//! Authoring operations
//!
//! Entity mutations made through a changeset. Rows are written pending and a
//! change is recorded in the caller's open changeset (created on demand); the
//! rows only become live when the changeset is applied.

use std::sync::Arc;

use tracing::info;

use tessera_common::validation::validate_request;
use tessera_common::{
    DEFAULT_VARIATION_CONTEXT_ID, PermissionLevel, Result, TesseraError, UserContext,
};
use tessera_persistence::{
    ChangeKind, ChangeType, FeatureVersionRecord, KeyRecord, LinkRecord, PersistenceService,
    PersistenceTransaction, ServiceVersionRecord, VariationValueRecord, commit_or_rollback,
};
use tessera_variation::{HierarchyCache, find_variation_context_id, resolve_variation_context};

use crate::model::{
    Authored, NewFeatureRequest, NewKeyRequest, NewServiceRequest, SetValueRequest,
};
use crate::service::{ensure_open_changeset, now};

pub struct AuthoringService {
    persistence: Arc<dyn PersistenceService>,
    hierarchy: Arc<HierarchyCache>,
}

impl AuthoringService {
    pub fn new(persistence: Arc<dyn PersistenceService>, hierarchy: Arc<HierarchyCache>) -> Self {
        Self {
            persistence,
            hierarchy,
        }
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    /// New service with its first version
    pub async fn create_service(
        &self,
        user: &UserContext,
        request: NewServiceRequest,
    ) -> Result<Authored<ServiceVersionRecord>> {
        if !user.is_global_admin {
            return Err(TesseraError::PermissionDenied(
                "only global administrators can create services".to_string(),
            ));
        }
        validate_request(&request)?;

        let mut tx = self.persistence.begin().await?;
        let result = async {
            if !tx
                .service_type_list()
                .await?
                .iter()
                .any(|st| st.id == request.service_type_id)
            {
                return Err(TesseraError::not_found(format!(
                    "service type {}",
                    request.service_type_id
                )));
            }
            if tx.service_find_by_name(&request.name).await?.is_some() {
                return Err(TesseraError::InvalidInput(format!(
                    "service '{}' already exists",
                    request.name
                )));
            }

            let changeset = ensure_open_changeset(tx.as_mut(), user).await?;
            let service = tx
                .service_create(&request.name, request.service_type_id, &request.description)
                .await?;
            let version = tx.service_version_create(service.id, 1).await?;
            record(
                tx.as_mut(),
                changeset.id,
                ChangeType::Create,
                ChangeKind::ServiceVersion {
                    service_version_id: version.id,
                },
            )
            .await?;
            Ok::<_, TesseraError>(Authored {
                changeset_id: changeset.id,
                record: version,
            })
        }
        .await;

        let authored = commit_or_rollback(tx, result).await?;
        info!(
            "User {} created service '{}' in changeset {}",
            user.id, request.name, authored.changeset_id
        );
        Ok(authored)
    }

    pub async fn create_service_version(
        &self,
        user: &UserContext,
        service_id: i64,
    ) -> Result<Authored<ServiceVersionRecord>> {
        require_service_level(user, service_id, PermissionLevel::Admin)?;

        let mut tx = self.persistence.begin().await?;
        let result = async {
            let service = tx
                .service_find(service_id)
                .await?
                .ok_or_else(|| TesseraError::not_found(format!("service {}", service_id)))?;
            if service.validity.has_ended() {
                return Err(TesseraError::InvalidOperation(format!(
                    "service {} has been deleted",
                    service_id
                )));
            }

            let changeset = ensure_open_changeset(tx.as_mut(), user).await?;
            let next = next_service_version(tx.as_ref(), changeset.id, service_id).await?;
            let version = tx.service_version_create(service_id, next).await?;
            record(
                tx.as_mut(),
                changeset.id,
                ChangeType::Create,
                ChangeKind::ServiceVersion {
                    service_version_id: version.id,
                },
            )
            .await?;
            Ok::<_, TesseraError>(Authored {
                changeset_id: changeset.id,
                record: version,
            })
        }
        .await;

        commit_or_rollback(tx, result).await
    }

    /// Mark a live service version published; takes effect immediately
    pub async fn publish_service_version(
        &self,
        user: &UserContext,
        service_version_id: i64,
    ) -> Result<ServiceVersionRecord> {
        let mut tx = self.persistence.begin().await?;
        let result = async {
            let version = tx
                .service_version_find(service_version_id)
                .await?
                .ok_or_else(|| {
                    TesseraError::not_found(format!("service version {}", service_version_id))
                })?;
            require_service_level(user, version.service_id, PermissionLevel::Admin)?;
            if !version.validity.is_live() {
                return Err(TesseraError::InvalidOperation(format!(
                    "service version {} is not live",
                    service_version_id
                )));
            }
            if !version.published {
                tx.service_version_set_published(service_version_id, true)
                    .await?;
            }
            Ok::<_, TesseraError>(ServiceVersionRecord {
                published: true,
                ..version
            })
        }
        .await;

        let version = commit_or_rollback(tx, result).await?;
        info!(
            "User {} published version {} of service {}",
            user.id, version.version, version.service_id
        );
        Ok(version)
    }

    // ------------------------------------------------------------------
    // Features
    // ------------------------------------------------------------------

    /// New feature with its first version
    pub async fn create_feature(
        &self,
        user: &UserContext,
        request: NewFeatureRequest,
    ) -> Result<Authored<FeatureVersionRecord>> {
        validate_request(&request)?;

        let mut tx = self.persistence.begin().await?;
        let result = async {
            if tx.feature_find_by_name(&request.name).await?.is_some() {
                return Err(TesseraError::InvalidInput(format!(
                    "feature '{}' already exists",
                    request.name
                )));
            }

            let changeset = ensure_open_changeset(tx.as_mut(), user).await?;
            let feature = tx
                .feature_create(&request.name, &request.description)
                .await?;
            let version = tx.feature_version_create(feature.id, 1).await?;
            record(
                tx.as_mut(),
                changeset.id,
                ChangeType::Create,
                ChangeKind::FeatureVersion {
                    feature_version_id: version.id,
                },
            )
            .await?;
            Ok::<_, TesseraError>(Authored {
                changeset_id: changeset.id,
                record: version,
            })
        }
        .await;

        let authored = commit_or_rollback(tx, result).await?;
        info!(
            "User {} created feature '{}' in changeset {}",
            user.id, request.name, authored.changeset_id
        );
        Ok(authored)
    }

    pub async fn create_feature_version(
        &self,
        user: &UserContext,
        feature_id: i64,
    ) -> Result<Authored<FeatureVersionRecord>> {
        require_feature_level(user, feature_id, PermissionLevel::Write)?;

        let mut tx = self.persistence.begin().await?;
        let result = async {
            let feature = tx
                .feature_find(feature_id)
                .await?
                .ok_or_else(|| TesseraError::not_found(format!("feature {}", feature_id)))?;
            if feature.validity.has_ended() {
                return Err(TesseraError::InvalidOperation(format!(
                    "feature {} has been deleted",
                    feature_id
                )));
            }

            let changeset = ensure_open_changeset(tx.as_mut(), user).await?;
            let next = next_feature_version(tx.as_ref(), changeset.id, feature_id).await?;
            let version = tx.feature_version_create(feature_id, next).await?;
            record(
                tx.as_mut(),
                changeset.id,
                ChangeType::Create,
                ChangeKind::FeatureVersion {
                    feature_version_id: version.id,
                },
            )
            .await?;
            Ok::<_, TesseraError>(Authored {
                changeset_id: changeset.id,
                record: version,
            })
        }
        .await;

        commit_or_rollback(tx, result).await
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    pub async fn link_feature(
        &self,
        user: &UserContext,
        feature_version_id: i64,
        service_version_id: i64,
    ) -> Result<Authored<LinkRecord>> {
        let mut tx = self.persistence.begin().await?;
        let result = async {
            let feature_version = find_feature_version(tx.as_ref(), feature_version_id).await?;
            let service_version = tx
                .service_version_find(service_version_id)
                .await?
                .ok_or_else(|| {
                    TesseraError::not_found(format!("service version {}", service_version_id))
                })?;
            require_feature_level(user, feature_version.feature_id, PermissionLevel::Write)?;
            require_service_level(user, service_version.service_id, PermissionLevel::Write)?;

            if let Some(existing) = tx
                .link_find_live(feature_version.feature_id, service_version_id)
                .await?
            {
                return Err(TesseraError::InvalidOperation(format!(
                    "feature {} is already linked to service version {} by link {}",
                    feature_version.feature_id, service_version_id, existing.id
                )));
            }

            let changeset = ensure_open_changeset(tx.as_mut(), user).await?;
            let link = tx
                .link_create(feature_version_id, service_version_id)
                .await?;
            record(
                tx.as_mut(),
                changeset.id,
                ChangeType::Create,
                ChangeKind::Link { link_id: link.id },
            )
            .await?;
            Ok::<_, TesseraError>(Authored {
                changeset_id: changeset.id,
                record: link,
            })
        }
        .await;

        commit_or_rollback(tx, result).await
    }

    pub async fn unlink_feature(
        &self,
        user: &UserContext,
        link_id: i64,
    ) -> Result<Authored<LinkRecord>> {
        let mut tx = self.persistence.begin().await?;
        let result = async {
            let link = tx
                .link_find(link_id)
                .await?
                .ok_or_else(|| TesseraError::not_found(format!("link {}", link_id)))?;
            let feature_version = find_feature_version(tx.as_ref(), link.feature_version_id).await?;
            require_feature_level(user, feature_version.feature_id, PermissionLevel::Write)?;
            if !link.validity.is_live() {
                return Err(TesseraError::InvalidOperation(format!(
                    "link {} is not live",
                    link_id
                )));
            }

            let changeset = ensure_open_changeset(tx.as_mut(), user).await?;
            record(
                tx.as_mut(),
                changeset.id,
                ChangeType::Delete,
                ChangeKind::Link { link_id },
            )
            .await?;
            Ok::<_, TesseraError>(Authored {
                changeset_id: changeset.id,
                record: link,
            })
        }
        .await;

        commit_or_rollback(tx, result).await
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    /// New key with its default value
    pub async fn create_key(
        &self,
        user: &UserContext,
        request: NewKeyRequest,
    ) -> Result<Authored<KeyRecord>> {
        validate_request(&request)?;

        let mut tx = self.persistence.begin().await?;
        let result = async {
            let feature_version =
                find_feature_version(tx.as_ref(), request.feature_version_id).await?;
            require_feature_level(user, feature_version.feature_id, PermissionLevel::Write)?;
            if feature_version.validity.has_ended() {
                return Err(TesseraError::InvalidOperation(format!(
                    "feature version {} has been deleted",
                    feature_version.id
                )));
            }
            if tx
                .key_find_live_by_name(feature_version.id, &request.name)
                .await?
                .is_some()
            {
                return Err(TesseraError::InvalidInput(format!(
                    "key '{}' already exists in feature version {}",
                    request.name, feature_version.id
                )));
            }

            let changeset = ensure_open_changeset(tx.as_mut(), user).await?;
            let key = tx
                .key_create(feature_version.id, &request.name, &request.description)
                .await?;
            let value = tx
                .value_create(key.id, DEFAULT_VARIATION_CONTEXT_ID, &request.default_value)
                .await?;
            record(
                tx.as_mut(),
                changeset.id,
                ChangeType::Create,
                ChangeKind::Key { key_id: key.id },
            )
            .await?;
            record(
                tx.as_mut(),
                changeset.id,
                ChangeType::Create,
                ChangeKind::VariationValue {
                    key_id: key.id,
                    variation_context_id: DEFAULT_VARIATION_CONTEXT_ID,
                    old_variation_value_id: None,
                    new_variation_value_id: Some(value.id),
                },
            )
            .await?;
            Ok::<_, TesseraError>(Authored {
                changeset_id: changeset.id,
                record: key,
            })
        }
        .await;

        let authored = commit_or_rollback(tx, result).await?;
        info!(
            "User {} created key '{}' in changeset {}",
            user.id, authored.record.name, authored.changeset_id
        );
        Ok(authored)
    }

    pub async fn delete_key(&self, user: &UserContext, key_id: i64) -> Result<Authored<KeyRecord>> {
        let mut tx = self.persistence.begin().await?;
        let result = async {
            let key = find_key(tx.as_ref(), key_id).await?;
            require_key_write(tx.as_ref(), user, &key).await?;
            if !key.validity.is_live() {
                return Err(TesseraError::InvalidOperation(format!(
                    "key {} is not live",
                    key_id
                )));
            }

            let changeset = ensure_open_changeset(tx.as_mut(), user).await?;
            record(
                tx.as_mut(),
                changeset.id,
                ChangeType::Delete,
                ChangeKind::Key { key_id },
            )
            .await?;
            Ok::<_, TesseraError>(Authored {
                changeset_id: changeset.id,
                record: key,
            })
        }
        .await;

        commit_or_rollback(tx, result).await
    }

    /// Replace a key's validator definitions in place.
    ///
    /// Validators are descriptive, so the edit bypasses the changeset; pending
    /// value changes recorded before it are reported as conflicting.
    pub async fn update_key_validators(
        &self,
        user: &UserContext,
        key_id: i64,
        validators: Option<&str>,
    ) -> Result<KeyRecord> {
        if let Some(validators) = validators {
            serde_json::from_str::<serde_json::Value>(validators).map_err(|e| {
                TesseraError::InvalidInput(format!("validators are not valid JSON: {}", e))
            })?;
        }

        let mut tx = self.persistence.begin().await?;
        let result = async {
            let key = find_key(tx.as_ref(), key_id).await?;
            require_key_write(tx.as_ref(), user, &key).await?;
            let at = now();
            tx.key_update_validators(key_id, validators, at).await?;
            Ok::<_, TesseraError>(KeyRecord {
                validators: validators.map(str::to_string),
                validators_updated_at: Some(at),
                ..key
            })
        }
        .await;

        let key = commit_or_rollback(tx, result).await?;
        info!("User {} updated validators of key {}", user.id, key.id);
        Ok(key)
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    /// Create or replace the value of a key in the context named by a variation map
    pub async fn set_value(
        &self,
        user: &UserContext,
        request: SetValueRequest,
    ) -> Result<Authored<VariationValueRecord>> {
        validate_request(&request)?;
        let snapshot = self
            .hierarchy
            .current_or_refresh(self.persistence.as_ref())
            .await?;

        let mut tx = self.persistence.begin().await?;
        let result = async {
            let key = find_key(tx.as_ref(), request.key_id).await?;
            if key.validity.has_ended() {
                return Err(TesseraError::InvalidOperation(format!(
                    "key {} has been deleted",
                    key.id
                )));
            }

            let context_id = match require_key_write(tx.as_ref(), user, &key).await {
                Ok(()) => {
                    resolve_variation_context(
                        tx.as_mut(),
                        &snapshot.hierarchy,
                        request.service_type_id,
                        &request.variation,
                    )
                    .await?
                }
                Err(denied) => {
                    // Variation grants only exist on contexts already in use
                    let ids = snapshot
                        .hierarchy
                        .variation_map_to_ids(request.service_type_id, &request.variation)?;
                    let Some(context_id) = find_variation_context_id(tx.as_ref(), &ids).await?
                    else {
                        return Err(denied);
                    };
                    if !has_variation_write(tx.as_ref(), user, &key, context_id).await? {
                        return Err(denied);
                    }
                    context_id
                }
            };
            let changeset = ensure_open_changeset(tx.as_mut(), user).await?;
            reject_pending_variation(tx.as_ref(), changeset.id, key.id, context_id).await?;

            let live = tx.value_find_live(key.id, context_id).await?;
            let value = tx.value_create(key.id, context_id, &request.data).await?;
            let change_type = if live.is_some() {
                ChangeType::Update
            } else {
                ChangeType::Create
            };
            record(
                tx.as_mut(),
                changeset.id,
                change_type,
                ChangeKind::VariationValue {
                    key_id: key.id,
                    variation_context_id: context_id,
                    old_variation_value_id: live.map(|v| v.id),
                    new_variation_value_id: Some(value.id),
                },
            )
            .await?;
            Ok::<_, TesseraError>(Authored {
                changeset_id: changeset.id,
                record: value,
            })
        }
        .await;

        commit_or_rollback(tx, result).await
    }

    /// Remove a live value from its context; the default value stays
    pub async fn delete_value(
        &self,
        user: &UserContext,
        value_id: i64,
    ) -> Result<Authored<VariationValueRecord>> {
        let mut tx = self.persistence.begin().await?;
        let result = async {
            let value = tx
                .value_find(value_id)
                .await?
                .ok_or_else(|| TesseraError::not_found(format!("variation value {}", value_id)))?;
            let key = find_key(tx.as_ref(), value.key_id).await?;
            if let Err(denied) = require_key_write(tx.as_ref(), user, &key).await
                && !has_variation_write(tx.as_ref(), user, &key, value.variation_context_id)
                    .await?
            {
                return Err(denied);
            }
            if value.variation_context_id == DEFAULT_VARIATION_CONTEXT_ID {
                return Err(TesseraError::InvalidOperation(
                    "the default value of a key cannot be deleted".to_string(),
                ));
            }
            if !value.validity.is_live() {
                return Err(TesseraError::InvalidOperation(format!(
                    "variation value {} is not live",
                    value_id
                )));
            }

            let changeset = ensure_open_changeset(tx.as_mut(), user).await?;
            reject_pending_variation(
                tx.as_ref(),
                changeset.id,
                value.key_id,
                value.variation_context_id,
            )
            .await?;
            record(
                tx.as_mut(),
                changeset.id,
                ChangeType::Delete,
                ChangeKind::VariationValue {
                    key_id: value.key_id,
                    variation_context_id: value.variation_context_id,
                    old_variation_value_id: Some(value.id),
                    new_variation_value_id: None,
                },
            )
            .await?;
            Ok::<_, TesseraError>(Authored {
                changeset_id: changeset.id,
                record: value,
            })
        }
        .await;

        commit_or_rollback(tx, result).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn record(
    tx: &mut dyn PersistenceTransaction,
    changeset_id: i64,
    change_type: ChangeType,
    kind: ChangeKind,
) -> Result<()> {
    tx.change_create(changeset_id, change_type, kind, now())
        .await?;
    Ok(())
}

fn require_service_level(user: &UserContext, service_id: i64, level: PermissionLevel) -> Result<()> {
    if user.has_service_level(service_id, level) {
        Ok(())
    } else {
        Err(TesseraError::PermissionDenied(format!(
            "user {} lacks {} on service {}",
            user.id, level, service_id
        )))
    }
}

fn require_feature_level(user: &UserContext, feature_id: i64, level: PermissionLevel) -> Result<()> {
    if user.has_feature_level(feature_id, level) {
        Ok(())
    } else {
        Err(TesseraError::PermissionDenied(format!(
            "user {} lacks {} on feature {}",
            user.id, level, feature_id
        )))
    }
}

/// Write on the key itself or on its feature
async fn require_key_write(
    tx: &dyn PersistenceTransaction,
    user: &UserContext,
    key: &KeyRecord,
) -> Result<()> {
    if user.has_key_level(key.id, PermissionLevel::Write) {
        return Ok(());
    }
    let feature_version = find_feature_version(tx, key.feature_version_id).await?;
    require_feature_level(user, feature_version.feature_id, PermissionLevel::Write)
}

/// Write on a variation context in every service the key's feature is linked to
async fn has_variation_write(
    tx: &dyn PersistenceTransaction,
    user: &UserContext,
    key: &KeyRecord,
    variation_context_id: i64,
) -> Result<bool> {
    let feature_version = find_feature_version(tx, key.feature_version_id).await?;
    let services = tx
        .link_services_for_feature(feature_version.feature_id)
        .await?;
    Ok(!services.is_empty()
        && services.iter().all(|service_id| {
            user.has_variation_level(*service_id, variation_context_id, PermissionLevel::Write)
        }))
}

async fn find_feature_version(
    tx: &dyn PersistenceTransaction,
    id: i64,
) -> Result<FeatureVersionRecord> {
    tx.feature_version_find(id)
        .await?
        .ok_or_else(|| TesseraError::not_found(format!("feature version {}", id)))
}

async fn find_key(tx: &dyn PersistenceTransaction, id: i64) -> Result<KeyRecord> {
    tx.key_find(id)
        .await?
        .ok_or_else(|| TesseraError::not_found(format!("key {}", id)))
}

/// `DuplicateVariation` when the changeset already holds a change for the key in this context
async fn reject_pending_variation(
    tx: &dyn PersistenceTransaction,
    changeset_id: i64,
    key_id: i64,
    context_id: i64,
) -> Result<()> {
    let pending = tx.change_list(changeset_id).await?.into_iter().any(|c| {
        matches!(
            c.kind,
            ChangeKind::VariationValue { key_id: k, variation_context_id: ctx, .. }
                if k == key_id && ctx == context_id
        )
    });
    if pending {
        return Err(TesseraError::DuplicateVariation(format!(
            "key {} already has a pending value in variation context {}",
            key_id, context_id
        )));
    }
    Ok(())
}

/// Next version number: one past the latest live version or the latest one
/// created in the same changeset
async fn next_feature_version(
    tx: &dyn PersistenceTransaction,
    changeset_id: i64,
    feature_id: i64,
) -> Result<i32> {
    let mut next = tx.feature_version_max(feature_id, true).await?.unwrap_or(0) + 1;
    for change in tx.change_list(changeset_id).await? {
        if let ChangeKind::FeatureVersion { feature_version_id } = change.kind
            && change.change_type == ChangeType::Create
            && let Some(version) = tx.feature_version_find(feature_version_id).await?
            && version.feature_id == feature_id
        {
            next = next.max(version.version + 1);
        }
    }
    Ok(next)
}

async fn next_service_version(
    tx: &dyn PersistenceTransaction,
    changeset_id: i64,
    service_id: i64,
) -> Result<i32> {
    let mut next = tx.service_version_max(service_id, true).await?.unwrap_or(0) + 1;
    for change in tx.change_list(changeset_id).await? {
        if let ChangeKind::ServiceVersion { service_version_id } = change.kind
            && change.change_type == ChangeType::Create
            && let Some(version) = tx.service_version_find(service_version_id).await?
            && version.service_id == service_id
        {
            next = next.max(version.version + 1);
        }
    }
    Ok(next)
}

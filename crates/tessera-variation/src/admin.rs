//! Variation administration
//!
//! Properties, property values and service-type priorities are managed by
//! global administrators outside the changeset workflow. Every mutation is
//! checked by building the hierarchy inside its own transaction, and the
//! shared cache is swapped to the new hierarchy before the call returns.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use validator::Validate;

use tessera_common::validation::{validate_name, validate_property_value, validate_request};
use tessera_common::{Result, TesseraError, UserContext};
use tessera_persistence::{
    PersistenceService, ServiceTypePropertyRecord, ServiceTypeRecord, VariationPropertyRecord,
    VariationPropertyValueRecord, commit_or_rollback,
};

use crate::cache::{HierarchyCache, HierarchySnapshot};
use crate::hierarchy::VariationHierarchy;

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewPropertyRequest {
    #[validate(custom(function = "validate_name"))]
    pub name: String,
    #[validate(length(max = 1024))]
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewPropertyValueRequest {
    pub property_id: i64,
    #[validate(custom(function = "validate_property_value"))]
    pub value: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub sort_order: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewServiceTypeRequest {
    #[validate(custom(function = "validate_name"))]
    pub name: String,
}

pub struct VariationAdminService {
    persistence: Arc<dyn PersistenceService>,
    cache: Arc<HierarchyCache>,
}

impl VariationAdminService {
    pub fn new(persistence: Arc<dyn PersistenceService>, cache: Arc<HierarchyCache>) -> Self {
        Self { persistence, cache }
    }

    /// Current hierarchy snapshot, rebuilt when stale
    pub async fn hierarchy(&self) -> Result<Arc<HierarchySnapshot>> {
        self.cache
            .current_or_refresh(self.persistence.as_ref())
            .await
    }

    pub async fn create_property(
        &self,
        user: &UserContext,
        request: NewPropertyRequest,
    ) -> Result<VariationPropertyRecord> {
        require_global_admin(user)?;
        validate_request(&request)?;

        let mut tx = self.persistence.begin().await?;
        let result = async {
            let existing = tx.property_list().await?;
            if existing.iter().any(|p| p.name == request.name) {
                return Err(TesseraError::InvalidInput(format!(
                    "variation property '{}' already exists",
                    request.name
                )));
            }
            let property = tx
                .property_create(&request.name, &request.description)
                .await?;
            let hierarchy = VariationHierarchy::load(tx.as_ref()).await?;
            Ok::<_, TesseraError>((property, hierarchy))
        }
        .await;

        let (property, hierarchy) = commit_or_rollback(tx, result).await?;
        self.cache.install(hierarchy);
        tracing::info!("Created variation property {} ({})", property.name, property.id);
        Ok(property)
    }

    pub async fn create_property_value(
        &self,
        user: &UserContext,
        request: NewPropertyValueRequest,
    ) -> Result<VariationPropertyValueRecord> {
        require_global_admin(user)?;
        validate_request(&request)?;

        let mut tx = self.persistence.begin().await?;
        let result = async {
            let properties = tx.property_list().await?;
            if !properties.iter().any(|p| p.id == request.property_id) {
                return Err(TesseraError::not_found(format!(
                    "variation property {}",
                    request.property_id
                )));
            }

            let values = tx.property_value_list().await?;
            if let Some(parent_id) = request.parent_id {
                let parent = values
                    .iter()
                    .find(|v| v.id == parent_id)
                    .ok_or_else(|| TesseraError::not_found(format!("variation value {}", parent_id)))?;
                if parent.property_id != request.property_id {
                    return Err(TesseraError::InvalidInput(format!(
                        "parent value {} belongs to another property",
                        parent_id
                    )));
                }
            }
            if values
                .iter()
                .any(|v| v.property_id == request.property_id && v.value == request.value)
            {
                return Err(TesseraError::InvalidInput(format!(
                    "value '{}' already exists for property {}",
                    request.value, request.property_id
                )));
            }

            let value = tx
                .property_value_create(
                    request.property_id,
                    &request.value,
                    request.parent_id,
                    request.sort_order,
                )
                .await?;
            let hierarchy = VariationHierarchy::load(tx.as_ref()).await?;
            Ok::<_, TesseraError>((value, hierarchy))
        }
        .await;

        let (value, hierarchy) = commit_or_rollback(tx, result).await?;
        self.cache.install(hierarchy);
        tracing::info!(
            "Created variation value '{}' ({}) for property {}",
            value.value,
            value.id,
            value.property_id
        );
        Ok(value)
    }

    pub async fn create_service_type(
        &self,
        user: &UserContext,
        request: NewServiceTypeRequest,
    ) -> Result<ServiceTypeRecord> {
        require_global_admin(user)?;
        validate_request(&request)?;

        let mut tx = self.persistence.begin().await?;
        let result = async {
            let existing = tx.service_type_list().await?;
            if existing.iter().any(|t| t.name == request.name) {
                return Err(TesseraError::InvalidInput(format!(
                    "service type '{}' already exists",
                    request.name
                )));
            }
            let service_type = tx.service_type_create(&request.name).await?;
            let hierarchy = VariationHierarchy::load(tx.as_ref()).await?;
            Ok::<_, TesseraError>((service_type, hierarchy))
        }
        .await;

        let (service_type, hierarchy) = commit_or_rollback(tx, result).await?;
        self.cache.install(hierarchy);
        tracing::info!("Created service type {} ({})", service_type.name, service_type.id);
        Ok(service_type)
    }

    /// Make a property relevant to a service type; lower priority ranks higher
    pub async fn set_service_type_property(
        &self,
        user: &UserContext,
        service_type_id: i64,
        property_id: i64,
        priority: i32,
    ) -> Result<ServiceTypePropertyRecord> {
        require_global_admin(user)?;

        let mut tx = self.persistence.begin().await?;
        let result = async {
            if !tx
                .service_type_list()
                .await?
                .iter()
                .any(|t| t.id == service_type_id)
            {
                return Err(TesseraError::not_found(format!(
                    "service type {}",
                    service_type_id
                )));
            }
            if !tx.property_list().await?.iter().any(|p| p.id == property_id) {
                return Err(TesseraError::not_found(format!(
                    "variation property {}",
                    property_id
                )));
            }
            let link = tx
                .service_type_property_upsert(service_type_id, property_id, priority)
                .await?;
            let hierarchy = VariationHierarchy::load(tx.as_ref()).await?;
            Ok::<_, TesseraError>((link, hierarchy))
        }
        .await;

        let (link, hierarchy) = commit_or_rollback(tx, result).await?;
        self.cache.install(hierarchy);
        tracing::info!(
            "Attached property {} to service type {} with priority {}",
            property_id,
            service_type_id,
            priority
        );
        Ok(link)
    }
}

fn require_global_admin(user: &UserContext) -> Result<()> {
    if user.is_global_admin {
        return Ok(());
    }
    tracing::warn!("User {} is not allowed to manage variations", user.id);
    Err(TesseraError::PermissionDenied(
        "only global administrators can manage variations".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use tessera_common::StaticPermissions;
    use tessera_persistence::MemoryPersistService;

    use crate::cache::HierarchyOptions;

    fn setup() -> (VariationAdminService, Arc<HierarchyCache>) {
        let persistence: Arc<dyn PersistenceService> = Arc::new(MemoryPersistService::new());
        let cache = Arc::new(HierarchyCache::new(HierarchyOptions::default()));
        (VariationAdminService::new(persistence, cache.clone()), cache)
    }

    fn property(name: &str) -> NewPropertyRequest {
        NewPropertyRequest {
            name: name.to_string(),
            description: String::new(),
        }
    }

    fn value(property_id: i64, text: &str, parent_id: Option<i64>) -> NewPropertyValueRequest {
        NewPropertyValueRequest {
            property_id,
            value: text.to_string(),
            parent_id,
            sort_order: 0,
        }
    }

    #[tokio::test]
    async fn test_non_admin_is_rejected() {
        let (admin, _) = setup();
        let user = UserContext::new(5, Arc::new(StaticPermissions::new()));
        assert!(matches!(
            admin.create_property(&user, property("env")).await,
            Err(TesseraError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_mutations_refresh_cache() {
        let (admin, cache) = setup();
        let root = UserContext::global_admin(1);

        let env = admin.create_property(&root, property("env")).await.unwrap();
        let web = admin
            .create_service_type(&root, NewServiceTypeRequest { name: "web".to_string() })
            .await
            .unwrap();
        admin
            .set_service_type_property(&root, web.id, env.id, 1)
            .await
            .unwrap();
        let qa = admin
            .create_property_value(&root, value(env.id, "qa", None))
            .await
            .unwrap();
        let before = cache.snapshot().unwrap();

        let qa1 = admin
            .create_property_value(&root, value(env.id, "qa1", Some(qa.id)))
            .await
            .unwrap();
        let after = cache.snapshot().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));

        let variation = HashMap::from([(env.id, "qa1".to_string())]);
        assert_eq!(
            after
                .hierarchy
                .variation_map_to_ids(web.id, &variation)
                .unwrap(),
            vec![qa1.id]
        );
        assert!(before.hierarchy.variation_map_to_ids(web.id, &variation).is_err());
        assert_eq!(after.hierarchy.get_parents(env.id, "qa1"), vec!["qa"]);
    }

    #[tokio::test]
    async fn test_invalid_values_are_rejected() {
        let (admin, _) = setup();
        let root = UserContext::global_admin(1);
        let env = admin.create_property(&root, property("env")).await.unwrap();
        let region = admin.create_property(&root, property("region")).await.unwrap();
        let eu = admin
            .create_property_value(&root, value(region.id, "eu", None))
            .await
            .unwrap();

        assert!(matches!(
            admin.create_property_value(&root, value(env.id, "any", None)).await,
            Err(TesseraError::InvalidInput(_))
        ));
        assert!(matches!(
            admin.create_property_value(&root, value(env.id, "qa", Some(eu.id))).await,
            Err(TesseraError::InvalidInput(_))
        ));
        assert!(matches!(
            admin.create_property_value(&root, value(region.id, "eu", None)).await,
            Err(TesseraError::InvalidInput(_))
        ));
        assert!(matches!(
            admin.create_property_value(&root, value(999, "x", None)).await,
            Err(TesseraError::RecordNotFound(_))
        ));
        assert!(matches!(
            admin.create_property(&root, property("env")).await,
            Err(TesseraError::InvalidInput(_))
        ));
    }
}

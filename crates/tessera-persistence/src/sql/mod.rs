//! SQL-based persistence backend (MySQL/PostgreSQL via SeaORM)
//!
//! Every unit of work is a serializable `DatabaseTransaction`. The changeset
//! row is read with `SELECT ... FOR UPDATE` while it is being applied or
//! discarded.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sea_orm::{prelude::Expr, *};

use tessera_common::{DEFAULT_VARIATION_CONTEXT_ID, TesseraError};

use crate::entity::{
    changeset, changeset_action, changeset_change, config_key, feature, feature_version,
    feature_version_service_version, service, service_type, service_type_variation_property,
    service_version, variation_context, variation_context_variation_property_value,
    variation_property, variation_property_value, variation_value,
};
use crate::model::*;
use crate::traits::*;

/// External database persistence service
///
/// Wraps a SeaORM `DatabaseConnection` and hands out serializable
/// transactions implementing all persistence traits.
pub struct ExternalDbPersistService {
    db: DatabaseConnection,
}

impl ExternalDbPersistService {
    /// Create a new ExternalDbPersistService with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Get a reference to the underlying database connection
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl PersistenceService for ExternalDbPersistService {
    async fn begin(&self) -> anyhow::Result<Box<dyn PersistenceTransaction>> {
        let tx = self
            .db
            .begin_with_config(Some(IsolationLevel::Serializable), None)
            .await?;
        Ok(Box::new(SqlTransaction { tx }))
    }

    fn storage_mode(&self) -> StorageMode {
        StorageMode::ExternalDb
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        // Execute a simple query to verify connectivity
        changeset::Entity::find()
            .select_only()
            .column_as(Expr::cust("1"), "health")
            .into_tuple::<i32>()
            .one(&self.db)
            .await?;
        Ok(())
    }
}

/// Serializable database transaction
pub struct SqlTransaction {
    tx: DatabaseTransaction,
}

#[async_trait]
impl PersistenceTransaction for SqlTransaction {
    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ============================================================================
// Model conversions
// ============================================================================

fn validity(valid_from: Option<NaiveDateTime>, valid_to: Option<NaiveDateTime>) -> Validity {
    Validity {
        valid_from,
        valid_to,
    }
}

fn parse_enum<T: std::str::FromStr<Err = String>>(value: &str) -> anyhow::Result<T> {
    value.parse::<T>().map_err(anyhow::Error::msg)
}

fn changeset_from_model(m: changeset::Model) -> anyhow::Result<ChangesetRecord> {
    Ok(ChangesetRecord {
        id: m.id,
        user_id: m.user_id,
        state: parse_enum(&m.state)?,
        created_at: m.created_at,
        applied_at: m.applied_at,
    })
}

fn action_from_model(m: changeset_action::Model) -> anyhow::Result<ChangesetActionRecord> {
    Ok(ChangesetActionRecord {
        id: m.id,
        changeset_id: m.changeset_id,
        action_type: parse_enum(&m.r#type)?,
        comment: m.comment,
        user_id: m.user_id,
        created_at: m.created_at,
    })
}

fn change_from_model(m: changeset_change::Model) -> anyhow::Result<ChangeRecord> {
    let missing = |column: &str| {
        anyhow::anyhow!(
            "Change {} of kind {} has no {} column value",
            m.id,
            m.kind,
            column
        )
    };
    let kind = match m.kind.as_str() {
        "SERVICE_VERSION" => ChangeKind::ServiceVersion {
            service_version_id: m
                .service_version_id
                .ok_or_else(|| missing("service_version_id"))?,
        },
        "FEATURE_VERSION" => ChangeKind::FeatureVersion {
            feature_version_id: m
                .feature_version_id
                .ok_or_else(|| missing("feature_version_id"))?,
        },
        "LINK" => ChangeKind::Link {
            link_id: m.link_id.ok_or_else(|| missing("link_id"))?,
        },
        "KEY" => ChangeKind::Key {
            key_id: m.key_id.ok_or_else(|| missing("key_id"))?,
        },
        "VARIATION_VALUE" => ChangeKind::VariationValue {
            key_id: m.key_id.ok_or_else(|| missing("key_id"))?,
            variation_context_id: m
                .variation_context_id
                .ok_or_else(|| missing("variation_context_id"))?,
            old_variation_value_id: m.old_variation_value_id,
            new_variation_value_id: m.new_variation_value_id,
        },
        other => anyhow::bail!("Change {} has unknown kind {}", m.id, other),
    };
    Ok(ChangeRecord {
        id: m.id,
        changeset_id: m.changeset_id,
        change_type: parse_enum(&m.r#type)?,
        kind,
        created_at: m.created_at,
    })
}

fn change_active_model(
    changeset_id: i64,
    change_type: ChangeType,
    kind: ChangeKind,
    at: NaiveDateTime,
) -> changeset_change::ActiveModel {
    let mut model = changeset_change::ActiveModel {
        id: NotSet,
        changeset_id: Set(changeset_id),
        kind: Set(kind.tag().to_string()),
        r#type: Set(change_type.as_str().to_string()),
        service_version_id: Set(None),
        feature_version_id: Set(None),
        key_id: Set(None),
        variation_context_id: Set(None),
        old_variation_value_id: Set(None),
        new_variation_value_id: Set(None),
        link_id: Set(None),
        created_at: Set(at),
    };
    match kind {
        ChangeKind::ServiceVersion { service_version_id } => {
            model.service_version_id = Set(Some(service_version_id));
        }
        ChangeKind::FeatureVersion { feature_version_id } => {
            model.feature_version_id = Set(Some(feature_version_id));
        }
        ChangeKind::Link { link_id } => {
            model.link_id = Set(Some(link_id));
        }
        ChangeKind::Key { key_id } => {
            model.key_id = Set(Some(key_id));
        }
        ChangeKind::VariationValue {
            key_id,
            variation_context_id,
            old_variation_value_id,
            new_variation_value_id,
        } => {
            model.key_id = Set(Some(key_id));
            model.variation_context_id = Set(Some(variation_context_id));
            model.old_variation_value_id = Set(old_variation_value_id);
            model.new_variation_value_id = Set(new_variation_value_id);
        }
    }
    model
}

impl From<service::Model> for ServiceRecord {
    fn from(m: service::Model) -> Self {
        Self {
            id: m.id,
            name: m.name,
            service_type_id: m.service_type_id,
            description: m.description,
            validity: validity(m.valid_from, m.valid_to),
        }
    }
}

impl From<service_version::Model> for ServiceVersionRecord {
    fn from(m: service_version::Model) -> Self {
        Self {
            id: m.id,
            service_id: m.service_id,
            version: m.version,
            published: m.published,
            validity: validity(m.valid_from, m.valid_to),
        }
    }
}

impl From<feature::Model> for FeatureRecord {
    fn from(m: feature::Model) -> Self {
        Self {
            id: m.id,
            name: m.name,
            description: m.description,
            validity: validity(m.valid_from, m.valid_to),
        }
    }
}

impl From<feature_version::Model> for FeatureVersionRecord {
    fn from(m: feature_version::Model) -> Self {
        Self {
            id: m.id,
            feature_id: m.feature_id,
            version: m.version,
            validity: validity(m.valid_from, m.valid_to),
        }
    }
}

impl From<feature_version_service_version::Model> for LinkRecord {
    fn from(m: feature_version_service_version::Model) -> Self {
        Self {
            id: m.id,
            feature_version_id: m.feature_version_id,
            service_version_id: m.service_version_id,
            validity: validity(m.valid_from, m.valid_to),
        }
    }
}

impl From<config_key::Model> for KeyRecord {
    fn from(m: config_key::Model) -> Self {
        Self {
            id: m.id,
            feature_version_id: m.feature_version_id,
            name: m.name,
            description: m.description,
            validators: m.validators,
            validators_updated_at: m.validators_updated_at,
            validity: validity(m.valid_from, m.valid_to),
        }
    }
}

impl From<variation_value::Model> for VariationValueRecord {
    fn from(m: variation_value::Model) -> Self {
        Self {
            id: m.id,
            key_id: m.key_id,
            variation_context_id: m.variation_context_id,
            data: m.data,
            validity: validity(m.valid_from, m.valid_to),
        }
    }
}

impl From<variation_property::Model> for VariationPropertyRecord {
    fn from(m: variation_property::Model) -> Self {
        Self {
            id: m.id,
            name: m.name,
            description: m.description,
        }
    }
}

impl From<variation_property_value::Model> for VariationPropertyValueRecord {
    fn from(m: variation_property_value::Model) -> Self {
        Self {
            id: m.id,
            property_id: m.variation_property_id,
            value: m.value,
            parent_id: m.parent_id,
            sort_order: m.sort_order,
        }
    }
}

impl From<service_type::Model> for ServiceTypeRecord {
    fn from(m: service_type::Model) -> Self {
        Self {
            id: m.id,
            name: m.name,
        }
    }
}

impl From<service_type_variation_property::Model> for ServiceTypePropertyRecord {
    fn from(m: service_type_variation_property::Model) -> Self {
        Self {
            service_type_id: m.service_type_id,
            property_id: m.variation_property_id,
            priority: m.priority,
        }
    }
}

/// Update columns of a single row by id, evaluating to whether a row matched
macro_rules! update_columns {
    ($conn:expr, $entity:ident, $id:expr, $( $column:ident = $value:expr ),+ $(,)?) => {
        $entity::Entity::update_many()
            $( .col_expr($entity::Column::$column, Expr::value($value)) )+
            .filter($entity::Column::Id.eq($id))
            .exec($conn)
            .await?
            .rows_affected
            > 0
    };
}

/// Delete a single row by id, evaluating to whether a row was removed
macro_rules! delete_by_id {
    ($conn:expr, $entity:ident, $id:expr) => {
        $entity::Entity::delete_by_id($id)
            .exec($conn)
            .await?
            .rows_affected
            > 0
    };
}

// ============================================================================
// ChangesetPersistence implementation
// ============================================================================

#[async_trait]
impl ChangesetPersistence for SqlTransaction {
    async fn changeset_find(&self, id: i64) -> anyhow::Result<Option<ChangesetRecord>> {
        changeset::Entity::find_by_id(id)
            .one(&self.tx)
            .await?
            .map(changeset_from_model)
            .transpose()
    }

    async fn changeset_find_open_by_user(
        &self,
        user_id: i64,
    ) -> anyhow::Result<Option<ChangesetRecord>> {
        changeset::Entity::find()
            .filter(changeset::Column::UserId.eq(user_id))
            .filter(changeset::Column::State.eq(ChangesetState::Open.as_str()))
            .one(&self.tx)
            .await?
            .map(changeset_from_model)
            .transpose()
    }

    async fn changeset_list(
        &self,
        user_id: Option<i64>,
        state: Option<ChangesetState>,
    ) -> anyhow::Result<Vec<ChangesetRecord>> {
        let mut query = changeset::Entity::find().order_by_asc(changeset::Column::Id);
        if let Some(user_id) = user_id {
            query = query.filter(changeset::Column::UserId.eq(user_id));
        }
        if let Some(state) = state {
            query = query.filter(changeset::Column::State.eq(state.as_str()));
        }
        query
            .all(&self.tx)
            .await?
            .into_iter()
            .map(changeset_from_model)
            .collect()
    }

    async fn changeset_create(
        &mut self,
        user_id: i64,
        at: NaiveDateTime,
    ) -> anyhow::Result<ChangesetRecord> {
        let model = changeset::ActiveModel {
            id: NotSet,
            user_id: Set(user_id),
            state: Set(ChangesetState::Open.as_str().to_string()),
            created_at: Set(at),
            applied_at: Set(None),
        }
        .insert(&self.tx)
        .await?;
        changeset_from_model(model)
    }

    async fn changeset_lock(&mut self, id: i64) -> anyhow::Result<Option<ChangesetRecord>> {
        changeset::Entity::find_by_id(id)
            .lock_exclusive()
            .one(&self.tx)
            .await?
            .map(changeset_from_model)
            .transpose()
    }

    async fn changeset_update_state(
        &mut self,
        id: i64,
        state: ChangesetState,
        applied_at: Option<NaiveDateTime>,
    ) -> anyhow::Result<()> {
        let updated = match applied_at {
            Some(applied_at) => update_columns!(
                &self.tx,
                changeset,
                id,
                State = state.as_str(),
                AppliedAt = Some(applied_at),
            ),
            None => update_columns!(&self.tx, changeset, id, State = state.as_str()),
        };
        if !updated {
            anyhow::bail!("Changeset {} not found", id);
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
        let model = change_active_model(changeset_id, change_type, kind, at)
            .insert(&self.tx)
            .await?;
        change_from_model(model)
    }

    async fn change_find(&self, id: i64) -> anyhow::Result<Option<ChangeRecord>> {
        changeset_change::Entity::find_by_id(id)
            .one(&self.tx)
            .await?
            .map(change_from_model)
            .transpose()
    }

    async fn change_list(&self, changeset_id: i64) -> anyhow::Result<Vec<ChangeRecord>> {
        changeset_change::Entity::find()
            .filter(changeset_change::Column::ChangesetId.eq(changeset_id))
            .order_by_asc(changeset_change::Column::Id)
            .all(&self.tx)
            .await?
            .into_iter()
            .map(change_from_model)
            .collect()
    }

    async fn change_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(delete_by_id!(&self.tx, changeset_change, id))
    }

    async fn change_delete_by_changeset(&mut self, changeset_id: i64) -> anyhow::Result<u64> {
        let result = changeset_change::Entity::delete_many()
            .filter(changeset_change::Column::ChangesetId.eq(changeset_id))
            .exec(&self.tx)
            .await?;
        Ok(result.rows_affected)
    }

    async fn action_create(
        &mut self,
        changeset_id: i64,
        action_type: ActionType,
        comment: Option<&str>,
        user_id: i64,
        at: NaiveDateTime,
    ) -> anyhow::Result<ChangesetActionRecord> {
        let model = changeset_action::ActiveModel {
            id: NotSet,
            changeset_id: Set(changeset_id),
            r#type: Set(action_type.as_str().to_string()),
            comment: Set(comment.map(str::to_string)),
            user_id: Set(user_id),
            created_at: Set(at),
        }
        .insert(&self.tx)
        .await?;
        action_from_model(model)
    }

    async fn action_list(&self, changeset_id: i64) -> anyhow::Result<Vec<ChangesetActionRecord>> {
        changeset_action::Entity::find()
            .filter(changeset_action::Column::ChangesetId.eq(changeset_id))
            .order_by_asc(changeset_action::Column::Id)
            .all(&self.tx)
            .await?
            .into_iter()
            .map(action_from_model)
            .collect()
    }
}

// ============================================================================
// EntityPersistence implementation
// ============================================================================

impl SqlTransaction {
    /// Sub-select of the version ids of a feature
    fn feature_version_ids(feature_id: i64) -> sea_orm::sea_query::SelectStatement {
        feature_version::Entity::find()
            .select_only()
            .column(feature_version::Column::Id)
            .filter(feature_version::Column::FeatureId.eq(feature_id))
            .into_query()
    }
}

#[async_trait]
impl EntityPersistence for SqlTransaction {
    async fn service_find(&self, id: i64) -> anyhow::Result<Option<ServiceRecord>> {
        Ok(service::Entity::find_by_id(id)
            .one(&self.tx)
            .await?
            .map(Into::into))
    }

    async fn service_find_by_name(&self, name: &str) -> anyhow::Result<Option<ServiceRecord>> {
        Ok(service::Entity::find()
            .filter(service::Column::Name.eq(name))
            .filter(service::Column::ValidTo.is_null())
            .one(&self.tx)
            .await?
            .map(Into::into))
    }

    async fn service_create(
        &mut self,
        name: &str,
        service_type_id: i64,
        description: &str,
    ) -> anyhow::Result<ServiceRecord> {
        let model = service::ActiveModel {
            id: NotSet,
            name: Set(name.to_string()),
            service_type_id: Set(service_type_id),
            description: Set(description.to_string()),
            valid_from: Set(None),
            valid_to: Set(None),
        }
        .insert(&self.tx)
        .await?;
        Ok(model.into())
    }

    async fn service_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(delete_by_id!(&self.tx, service, id))
    }

    async fn service_version_find(
        &self,
        id: i64,
    ) -> anyhow::Result<Option<ServiceVersionRecord>> {
        Ok(service_version::Entity::find_by_id(id)
            .one(&self.tx)
            .await?
            .map(Into::into))
    }

    async fn service_version_create(
        &mut self,
        service_id: i64,
        version: i32,
    ) -> anyhow::Result<ServiceVersionRecord> {
        let model = service_version::ActiveModel {
            id: NotSet,
            service_id: Set(service_id),
            version: Set(version),
            published: Set(false),
            valid_from: Set(None),
            valid_to: Set(None),
        }
        .insert(&self.tx)
        .await?;
        Ok(model.into())
    }

    async fn service_version_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(delete_by_id!(&self.tx, service_version, id))
    }

    async fn service_version_max(
        &self,
        service_id: i64,
        live_only: bool,
    ) -> anyhow::Result<Option<i32>> {
        let mut query = service_version::Entity::find()
            .select_only()
            .column_as(service_version::Column::Version.max(), "max_version")
            .filter(service_version::Column::ServiceId.eq(service_id));
        if live_only {
            query = query
                .filter(service_version::Column::ValidFrom.is_not_null())
                .filter(service_version::Column::ValidTo.is_null());
        }
        let max = query.into_tuple::<Option<i32>>().one(&self.tx).await?;
        Ok(max.flatten())
    }

    async fn service_version_set_published(
        &mut self,
        id: i64,
        published: bool,
    ) -> anyhow::Result<bool> {
        Ok(update_columns!(
            &self.tx,
            service_version,
            id,
            Published = published
        ))
    }

    async fn feature_find(&self, id: i64) -> anyhow::Result<Option<FeatureRecord>> {
        Ok(feature::Entity::find_by_id(id)
            .one(&self.tx)
            .await?
            .map(Into::into))
    }

    async fn feature_find_by_name(&self, name: &str) -> anyhow::Result<Option<FeatureRecord>> {
        Ok(feature::Entity::find()
            .filter(feature::Column::Name.eq(name))
            .filter(feature::Column::ValidTo.is_null())
            .one(&self.tx)
            .await?
            .map(Into::into))
    }

    async fn feature_create(
        &mut self,
        name: &str,
        description: &str,
    ) -> anyhow::Result<FeatureRecord> {
        let model = feature::ActiveModel {
            id: NotSet,
            name: Set(name.to_string()),
            description: Set(description.to_string()),
            valid_from: Set(None),
            valid_to: Set(None),
        }
        .insert(&self.tx)
        .await?;
        Ok(model.into())
    }

    async fn feature_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(delete_by_id!(&self.tx, feature, id))
    }

    async fn feature_version_find(
        &self,
        id: i64,
    ) -> anyhow::Result<Option<FeatureVersionRecord>> {
        Ok(feature_version::Entity::find_by_id(id)
            .one(&self.tx)
            .await?
            .map(Into::into))
    }

    async fn feature_version_create(
        &mut self,
        feature_id: i64,
        version: i32,
    ) -> anyhow::Result<FeatureVersionRecord> {
        let model = feature_version::ActiveModel {
            id: NotSet,
            feature_id: Set(feature_id),
            version: Set(version),
            valid_from: Set(None),
            valid_to: Set(None),
        }
        .insert(&self.tx)
        .await?;
        Ok(model.into())
    }

    async fn feature_version_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(delete_by_id!(&self.tx, feature_version, id))
    }

    async fn feature_version_max(
        &self,
        feature_id: i64,
        live_only: bool,
    ) -> anyhow::Result<Option<i32>> {
        let mut query = feature_version::Entity::find()
            .select_only()
            .column_as(feature_version::Column::Version.max(), "max_version")
            .filter(feature_version::Column::FeatureId.eq(feature_id));
        if live_only {
            query = query
                .filter(feature_version::Column::ValidFrom.is_not_null())
                .filter(feature_version::Column::ValidTo.is_null());
        }
        let max = query.into_tuple::<Option<i32>>().one(&self.tx).await?;
        Ok(max.flatten())
    }

    async fn link_find(&self, id: i64) -> anyhow::Result<Option<LinkRecord>> {
        Ok(feature_version_service_version::Entity::find_by_id(id)
            .one(&self.tx)
            .await?
            .map(Into::into))
    }

    async fn link_create(
        &mut self,
        feature_version_id: i64,
        service_version_id: i64,
    ) -> anyhow::Result<LinkRecord> {
        let model = feature_version_service_version::ActiveModel {
            id: NotSet,
            feature_version_id: Set(feature_version_id),
            service_version_id: Set(service_version_id),
            valid_from: Set(None),
            valid_to: Set(None),
        }
        .insert(&self.tx)
        .await?;
        Ok(model.into())
    }

    async fn link_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(delete_by_id!(&self.tx, feature_version_service_version, id))
    }

    async fn link_find_live(
        &self,
        feature_id: i64,
        service_version_id: i64,
    ) -> anyhow::Result<Option<LinkRecord>> {
        use feature_version_service_version::Column;

        Ok(feature_version_service_version::Entity::find()
            .filter(Column::ServiceVersionId.eq(service_version_id))
            .filter(Column::FeatureVersionId.in_subquery(Self::feature_version_ids(feature_id)))
            .filter(Column::ValidFrom.is_not_null())
            .filter(Column::ValidTo.is_null())
            .one(&self.tx)
            .await?
            .map(Into::into))
    }

    async fn link_list_by_feature_version(
        &self,
        feature_version_id: i64,
    ) -> anyhow::Result<Vec<LinkRecord>> {
        Ok(feature_version_service_version::Entity::find()
            .filter(
                feature_version_service_version::Column::FeatureVersionId.eq(feature_version_id),
            )
            .order_by_asc(feature_version_service_version::Column::Id)
            .all(&self.tx)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn link_services_for_feature(&self, feature_id: i64) -> anyhow::Result<Vec<i64>> {
        use feature_version_service_version::Column;

        let service_version_ids: Vec<i64> = feature_version_service_version::Entity::find()
            .select_only()
            .column(Column::ServiceVersionId)
            .filter(Column::FeatureVersionId.in_subquery(Self::feature_version_ids(feature_id)))
            .filter(Column::ValidTo.is_null())
            .into_tuple()
            .all(&self.tx)
            .await?;
        if service_version_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut services: Vec<i64> = service_version::Entity::find()
            .select_only()
            .column(service_version::Column::ServiceId)
            .filter(service_version::Column::Id.is_in(service_version_ids))
            .into_tuple()
            .all(&self.tx)
            .await?;
        services.sort_unstable();
        services.dedup();
        Ok(services)
    }

    async fn key_find(&self, id: i64) -> anyhow::Result<Option<KeyRecord>> {
        Ok(config_key::Entity::find_by_id(id)
            .one(&self.tx)
            .await?
            .map(Into::into))
    }

    async fn key_create(
        &mut self,
        feature_version_id: i64,
        name: &str,
        description: &str,
    ) -> anyhow::Result<KeyRecord> {
        let model = config_key::ActiveModel {
            id: NotSet,
            feature_version_id: Set(feature_version_id),
            name: Set(name.to_string()),
            description: Set(description.to_string()),
            validators: Set(None),
            validators_updated_at: Set(None),
            valid_from: Set(None),
            valid_to: Set(None),
        }
        .insert(&self.tx)
        .await?;
        Ok(model.into())
    }

    async fn key_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(delete_by_id!(&self.tx, config_key, id))
    }

    async fn key_find_live_by_name(
        &self,
        feature_version_id: i64,
        name: &str,
    ) -> anyhow::Result<Option<KeyRecord>> {
        Ok(config_key::Entity::find()
            .filter(config_key::Column::FeatureVersionId.eq(feature_version_id))
            .filter(config_key::Column::Name.eq(name))
            .filter(config_key::Column::ValidFrom.is_not_null())
            .filter(config_key::Column::ValidTo.is_null())
            .one(&self.tx)
            .await?
            .map(Into::into))
    }

    async fn key_update_validators(
        &mut self,
        id: i64,
        validators: Option<&str>,
        at: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        Ok(update_columns!(
            &self.tx,
            config_key,
            id,
            Validators = validators.map(str::to_string),
            ValidatorsUpdatedAt = Some(at),
        ))
    }

    async fn value_find(&self, id: i64) -> anyhow::Result<Option<VariationValueRecord>> {
        Ok(variation_value::Entity::find_by_id(id)
            .one(&self.tx)
            .await?
            .map(Into::into))
    }

    async fn value_create(
        &mut self,
        key_id: i64,
        variation_context_id: i64,
        data: &str,
    ) -> anyhow::Result<VariationValueRecord> {
        let model = variation_value::ActiveModel {
            id: NotSet,
            key_id: Set(key_id),
            variation_context_id: Set(variation_context_id),
            data: Set(data.to_string()),
            valid_from: Set(None),
            valid_to: Set(None),
        }
        .insert(&self.tx)
        .await?;
        Ok(model.into())
    }

    async fn value_delete(&mut self, id: i64) -> anyhow::Result<bool> {
        Ok(delete_by_id!(&self.tx, variation_value, id))
    }

    async fn value_find_live(
        &self,
        key_id: i64,
        variation_context_id: i64,
    ) -> anyhow::Result<Option<VariationValueRecord>> {
        Ok(variation_value::Entity::find()
            .filter(variation_value::Column::KeyId.eq(key_id))
            .filter(variation_value::Column::VariationContextId.eq(variation_context_id))
            .filter(variation_value::Column::ValidFrom.is_not_null())
            .filter(variation_value::Column::ValidTo.is_null())
            .one(&self.tx)
            .await?
            .map(Into::into))
    }

    async fn value_list_live(&self, key_id: i64) -> anyhow::Result<Vec<VariationValueRecord>> {
        Ok(variation_value::Entity::find()
            .filter(variation_value::Column::KeyId.eq(key_id))
            .filter(variation_value::Column::ValidFrom.is_not_null())
            .filter(variation_value::Column::ValidTo.is_null())
            .order_by_asc(variation_value::Column::Id)
            .all(&self.tx)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn start_validity(
        &mut self,
        entity: VersionedEntity,
        id: i64,
        at: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        let from = Some(at);
        let to: Option<NaiveDateTime> = None;
        let tx = &self.tx;
        let updated = match entity {
            VersionedEntity::Service => {
                update_columns!(tx, service, id, ValidFrom = from, ValidTo = to)
            }
            VersionedEntity::ServiceVersion => {
                update_columns!(tx, service_version, id, ValidFrom = from, ValidTo = to)
            }
            VersionedEntity::Feature => {
                update_columns!(tx, feature, id, ValidFrom = from, ValidTo = to)
            }
            VersionedEntity::FeatureVersion => {
                update_columns!(tx, feature_version, id, ValidFrom = from, ValidTo = to)
            }
            VersionedEntity::Link => update_columns!(
                tx,
                feature_version_service_version,
                id,
                ValidFrom = from,
                ValidTo = to
            ),
            VersionedEntity::Key => {
                update_columns!(tx, config_key, id, ValidFrom = from, ValidTo = to)
            }
            VersionedEntity::VariationValue => {
                update_columns!(tx, variation_value, id, ValidFrom = from, ValidTo = to)
            }
        };
        Ok(updated)
    }

    async fn end_validity(
        &mut self,
        entity: VersionedEntity,
        id: i64,
        at: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        let to = Some(at);
        let tx = &self.tx;
        let updated = match entity {
            VersionedEntity::Service => update_columns!(tx, service, id, ValidTo = to),
            VersionedEntity::ServiceVersion => {
                update_columns!(tx, service_version, id, ValidTo = to)
            }
            VersionedEntity::Feature => update_columns!(tx, feature, id, ValidTo = to),
            VersionedEntity::FeatureVersion => {
                update_columns!(tx, feature_version, id, ValidTo = to)
            }
            VersionedEntity::Link => {
                update_columns!(tx, feature_version_service_version, id, ValidTo = to)
            }
            VersionedEntity::Key => update_columns!(tx, config_key, id, ValidTo = to),
            VersionedEntity::VariationValue => {
                update_columns!(tx, variation_value, id, ValidTo = to)
            }
        };
        Ok(updated)
    }
}

// ============================================================================
// VariationPersistence implementation
// ============================================================================

impl SqlTransaction {
    /// Value ids of a context, ascending
    async fn context_members(&self, context_id: i64) -> anyhow::Result<Vec<i64>> {
        use variation_context_variation_property_value::Column;

        Ok(variation_context_variation_property_value::Entity::find()
            .select_only()
            .column(Column::VariationPropertyValueId)
            .filter(Column::VariationContextId.eq(context_id))
            .order_by_asc(Column::VariationPropertyValueId)
            .into_tuple()
            .all(&self.tx)
            .await?)
    }
}

#[async_trait]
impl VariationPersistence for SqlTransaction {
    async fn property_list(&self) -> anyhow::Result<Vec<VariationPropertyRecord>> {
        Ok(variation_property::Entity::find()
            .order_by_asc(variation_property::Column::Id)
            .all(&self.tx)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn property_create(
        &mut self,
        name: &str,
        description: &str,
    ) -> anyhow::Result<VariationPropertyRecord> {
        let model = variation_property::ActiveModel {
            id: NotSet,
            name: Set(name.to_string()),
            description: Set(description.to_string()),
        }
        .insert(&self.tx)
        .await?;
        Ok(model.into())
    }

    async fn property_value_list(&self) -> anyhow::Result<Vec<VariationPropertyValueRecord>> {
        Ok(variation_property_value::Entity::find()
            .order_by_asc(variation_property_value::Column::Id)
            .all(&self.tx)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn property_value_create(
        &mut self,
        property_id: i64,
        value: &str,
        parent_id: Option<i64>,
        sort_order: i32,
    ) -> anyhow::Result<VariationPropertyValueRecord> {
        let model = variation_property_value::ActiveModel {
            id: NotSet,
            variation_property_id: Set(property_id),
            value: Set(value.to_string()),
            parent_id: Set(parent_id),
            sort_order: Set(sort_order),
        }
        .insert(&self.tx)
        .await?;
        Ok(model.into())
    }

    async fn service_type_list(&self) -> anyhow::Result<Vec<ServiceTypeRecord>> {
        Ok(service_type::Entity::find()
            .order_by_asc(service_type::Column::Id)
            .all(&self.tx)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn service_type_create(&mut self, name: &str) -> anyhow::Result<ServiceTypeRecord> {
        let model = service_type::ActiveModel {
            id: NotSet,
            name: Set(name.to_string()),
        }
        .insert(&self.tx)
        .await?;
        Ok(model.into())
    }

    async fn service_type_property_list(&self) -> anyhow::Result<Vec<ServiceTypePropertyRecord>> {
        Ok(service_type_variation_property::Entity::find()
            .all(&self.tx)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn service_type_property_upsert(
        &mut self,
        service_type_id: i64,
        property_id: i64,
        priority: i32,
    ) -> anyhow::Result<ServiceTypePropertyRecord> {
        use service_type_variation_property::Column;

        let existing = service_type_variation_property::Entity::find()
            .filter(Column::ServiceTypeId.eq(service_type_id))
            .filter(Column::VariationPropertyId.eq(property_id))
            .one(&self.tx)
            .await?;

        let model = match existing {
            Some(entity) => {
                let mut active: service_type_variation_property::ActiveModel = entity.into();
                active.priority = Set(priority);
                active.update(&self.tx).await?
            }
            None => {
                service_type_variation_property::ActiveModel {
                    service_type_id: Set(service_type_id),
                    variation_property_id: Set(property_id),
                    priority: Set(priority),
                }
                .insert(&self.tx)
                .await?
            }
        };
        Ok(model.into())
    }

    async fn context_find(&self, value_ids: &[i64]) -> anyhow::Result<Option<i64>> {
        use variation_context_variation_property_value::Column;

        let Some(first) = value_ids.first() else {
            return Ok(Some(DEFAULT_VARIATION_CONTEXT_ID));
        };

        let candidates: Vec<i64> = variation_context_variation_property_value::Entity::find()
            .select_only()
            .column(Column::VariationContextId)
            .filter(Column::VariationPropertyValueId.eq(*first))
            .into_tuple()
            .all(&self.tx)
            .await?;

        for context_id in candidates {
            if self.context_members(context_id).await? == value_ids {
                return Ok(Some(context_id));
            }
        }
        Ok(None)
    }

    async fn context_create(&mut self, value_ids: &[i64]) -> anyhow::Result<i64> {
        let context = variation_context::ActiveModel {
            id: NotSet,
            created_at: Set(chrono::Utc::now().naive_utc()),
        }
        .insert(&self.tx)
        .await?;

        if !value_ids.is_empty() {
            let members: Vec<variation_context_variation_property_value::ActiveModel> = value_ids
                .iter()
                .map(
                    |value_id| variation_context_variation_property_value::ActiveModel {
                        variation_context_id: Set(context.id),
                        variation_property_value_id: Set(*value_id),
                    },
                )
                .collect();
            variation_context_variation_property_value::Entity::insert_many(members)
                .exec(&self.tx)
                .await?;
        }
        Ok(context.id)
    }

    async fn context_values(&self, context_id: i64) -> anyhow::Result<Vec<i64>> {
        if context_id != DEFAULT_VARIATION_CONTEXT_ID
            && variation_context::Entity::find_by_id(context_id)
                .one(&self.tx)
                .await?
                .is_none()
        {
            return Err(anyhow::Error::new(TesseraError::not_found(format!(
                "variation context {}",
                context_id
            ))));
        }
        self.context_members(context_id).await
    }
}

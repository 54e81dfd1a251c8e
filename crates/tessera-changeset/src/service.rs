//! Changeset service
//!
//! Owns the changeset lifecycle: opening a changeset for a user, the state
//! transitions with their guards, apply (turning pending rows live by opening
//! and closing validity windows), discard (removing the rows pending changes
//! introduced) and the read side used by reviewers.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{NaiveDateTime, TimeDelta, Utc};
use tracing::{debug, info, instrument, warn};

use tessera_common::validation::validate_comment;
use tessera_common::{
    DEFAULT_VARIATION_CONTEXT_ID, PermissionLevel, Result, TesseraError, UserContext,
};
use tessera_persistence::{
    ActionType, ChangeKind, ChangeRecord, ChangeType, ChangesetActionRecord, ChangesetRecord,
    ChangesetState, PersistenceService, PersistenceTransaction, Validity, VersionedEntity,
    commit_or_rollback,
};

use crate::conflict::detect_conflicts;
use crate::model::{ChangeView, ChangesetOptions};
use crate::pending::load_pending_changes;
use crate::state::{Transition, check_transition};

pub(crate) fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Changeset lifecycle operations
pub struct ChangesetService {
    persistence: Arc<dyn PersistenceService>,
    options: ChangesetOptions,
}

impl ChangesetService {
    pub fn new(persistence: Arc<dyn PersistenceService>, options: ChangesetOptions) -> Self {
        Self {
            persistence,
            options,
        }
    }

    pub fn options(&self) -> &ChangesetOptions {
        &self.options
    }

    /// The caller's open changeset, created when there is none.
    ///
    /// Returns the caller's context with `open_changeset_id` pointing at it.
    pub async fn ensure_changeset_for_user(&self, user: &UserContext) -> Result<UserContext> {
        let mut tx = self.persistence.begin().await?;
        let result = ensure_open_changeset(tx.as_mut(), user).await;
        let changeset = commit_or_rollback(tx, result).await?;
        Ok(user.with_open_changeset(Some(changeset.id)))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_changeset(&self, id: i64) -> Result<ChangesetRecord> {
        let tx = self.persistence.begin().await?;
        let result = find_changeset(tx.as_ref(), id).await;
        commit_or_rollback(tx, result).await
    }

    pub async fn list_changesets(
        &self,
        user_id: Option<i64>,
        state: Option<ChangesetState>,
    ) -> Result<Vec<ChangesetRecord>> {
        let tx = self.persistence.begin().await?;
        let result = tx
            .changeset_list(user_id, state)
            .await
            .map_err(TesseraError::from);
        commit_or_rollback(tx, result).await
    }

    pub async fn list_changes(&self, id: i64) -> Result<Vec<ChangeRecord>> {
        let tx = self.persistence.begin().await?;
        let result = async {
            find_changeset(tx.as_ref(), id).await?;
            Ok::<_, TesseraError>(tx.change_list(id).await?)
        }
        .await;
        commit_or_rollback(tx, result).await
    }

    pub async fn list_actions(&self, id: i64) -> Result<Vec<ChangesetActionRecord>> {
        let tx = self.persistence.begin().await?;
        let result = async {
            find_changeset(tx.as_ref(), id).await?;
            Ok::<_, TesseraError>(tx.action_list(id).await?)
        }
        .await;
        commit_or_rollback(tx, result).await
    }

    /// Pending changes of a changeset, each with its first conflict against the live state
    pub async fn changes_with_conflicts(&self, id: i64) -> Result<Vec<ChangeView>> {
        let tx = self.persistence.begin().await?;
        let result = async {
            find_changeset(tx.as_ref(), id).await?;
            let changes = tx.change_list(id).await?;
            let pending = load_pending_changes(tx.as_ref(), changes).await?;
            let conflicts = detect_conflicts(&pending);
            Ok::<_, TesseraError>(
                pending
                    .into_iter()
                    .zip(conflicts)
                    .map(|(p, conflict)| ChangeView {
                        change: p.change,
                        conflict,
                    })
                    .collect::<Vec<_>>(),
            )
        }
        .await;
        commit_or_rollback(tx, result).await
    }

    pub async fn can_be_applied_by(&self, user: &UserContext, id: i64) -> Result<bool> {
        let tx = self.persistence.begin().await?;
        let result = async {
            let changeset = find_changeset(tx.as_ref(), id).await?;
            let changes = tx.change_list(id).await?;
            can_apply(tx.as_ref(), user, &changeset, &changes).await
        }
        .await;
        commit_or_rollback(tx, result).await
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    pub async fn commit(
        &self,
        user: &UserContext,
        id: i64,
        comment: Option<&str>,
    ) -> Result<ChangesetRecord> {
        self.transition(user, id, Transition::Commit, comment).await
    }

    pub async fn reopen(
        &self,
        user: &UserContext,
        id: i64,
        comment: Option<&str>,
    ) -> Result<ChangesetRecord> {
        self.transition(user, id, Transition::Reopen, comment).await
    }

    pub async fn stash(
        &self,
        user: &UserContext,
        id: i64,
        comment: Option<&str>,
    ) -> Result<ChangesetRecord> {
        self.transition(user, id, Transition::Stash, comment).await
    }

    /// Make every pending change of a changeset live in one transaction
    #[instrument(skip(self, user, comment), fields(user_id = user.id))]
    pub async fn apply(
        &self,
        user: &UserContext,
        id: i64,
        comment: Option<&str>,
    ) -> Result<ChangesetRecord> {
        self.check_comment(comment)?;
        let mut tx = self.persistence.begin().await?;
        let result = apply_changeset(tx.as_mut(), user, id, comment).await;
        let changeset = commit_or_rollback(tx, result).await?;
        info!("Applied changeset {} for user {}", changeset.id, user.id);
        Ok(changeset)
    }

    /// Drop every pending change of a changeset and the rows they introduced
    #[instrument(skip(self, user, comment), fields(user_id = user.id))]
    pub async fn discard(
        &self,
        user: &UserContext,
        id: i64,
        comment: Option<&str>,
    ) -> Result<ChangesetRecord> {
        self.check_comment(comment)?;
        let mut tx = self.persistence.begin().await?;
        let result = discard_changeset(tx.as_mut(), user, id, comment).await;
        let changeset = commit_or_rollback(tx, result).await?;
        info!("Discarded changeset {} for user {}", changeset.id, user.id);
        Ok(changeset)
    }

    /// Drop one pending change and the rows it introduced
    pub async fn discard_change(&self, user: &UserContext, change_id: i64) -> Result<()> {
        let mut tx = self.persistence.begin().await?;
        let result = discard_single_change(tx.as_mut(), user, change_id).await;
        commit_or_rollback(tx, result).await?;
        info!("Discarded change {} for user {}", change_id, user.id);
        Ok(())
    }

    /// Append a free-text audit action without changing state
    pub async fn comment(
        &self,
        user: &UserContext,
        id: i64,
        comment: &str,
    ) -> Result<ChangesetActionRecord> {
        validate_comment(comment, self.options.max_comment_length)?;
        let mut tx = self.persistence.begin().await?;
        let result = async {
            find_changeset(tx.as_ref(), id).await?;
            Ok::<_, TesseraError>(
                tx.action_create(id, ActionType::Comment, Some(comment), user.id, now())
                    .await?,
            )
        }
        .await;
        commit_or_rollback(tx, result).await
    }

    async fn transition(
        &self,
        user: &UserContext,
        id: i64,
        transition: Transition,
        comment: Option<&str>,
    ) -> Result<ChangesetRecord> {
        self.check_comment(comment)?;
        let mut tx = self.persistence.begin().await?;
        let result = transition_changeset(tx.as_mut(), user, id, transition, comment).await;
        let changeset = commit_or_rollback(tx, result).await?;
        info!(
            "Changeset {} moved to {} by user {} ({})",
            changeset.id, changeset.state, user.id, transition
        );
        Ok(changeset)
    }

    fn check_comment(&self, comment: Option<&str>) -> Result<()> {
        match comment {
            Some(comment) => validate_comment(comment, self.options.max_comment_length),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Unit-of-work bodies
// ============================================================================

/// Open changeset of `user`, created with a `Create` action when there is none
pub(crate) async fn ensure_open_changeset(
    tx: &mut dyn PersistenceTransaction,
    user: &UserContext,
) -> Result<ChangesetRecord> {
    if let Some(id) = user.open_changeset_id
        && let Some(changeset) = tx.changeset_find(id).await?
        && changeset.state == ChangesetState::Open
        && changeset.user_id == user.id
    {
        return Ok(changeset);
    }

    if let Some(changeset) = tx.changeset_find_open_by_user(user.id).await? {
        return Ok(changeset);
    }

    let at = now();
    let changeset = tx.changeset_create(user.id, at).await?;
    tx.action_create(changeset.id, ActionType::Create, None, user.id, at)
        .await?;
    debug!("Opened changeset {} for user {}", changeset.id, user.id);
    Ok(changeset)
}

async fn find_changeset(tx: &dyn PersistenceTransaction, id: i64) -> Result<ChangesetRecord> {
    tx.changeset_find(id)
        .await?
        .ok_or_else(|| TesseraError::not_found(format!("changeset {}", id)))
}

async fn lock_changeset(tx: &mut dyn PersistenceTransaction, id: i64) -> Result<ChangesetRecord> {
    tx.changeset_lock(id)
        .await?
        .ok_or_else(|| TesseraError::not_found(format!("changeset {}", id)))
}

fn require_owner(user: &UserContext, changeset: &ChangesetRecord) -> Result<()> {
    if changeset.user_id == user.id {
        return Ok(());
    }
    warn!(
        "User {} rejected on changeset {} owned by user {}",
        user.id, changeset.id, changeset.user_id
    );
    Err(TesseraError::PermissionDenied(format!(
        "changeset {} belongs to user {}",
        changeset.id, changeset.user_id
    )))
}

async fn transition_changeset(
    tx: &mut dyn PersistenceTransaction,
    user: &UserContext,
    id: i64,
    transition: Transition,
    comment: Option<&str>,
) -> Result<ChangesetRecord> {
    let changeset = lock_changeset(tx, id).await?;
    let target = check_transition(changeset.state, transition)?;
    require_owner(user, &changeset)?;

    if transition == Transition::Reopen
        && let Some(open) = tx.changeset_find_open_by_user(changeset.user_id).await?
        && open.id != changeset.id
    {
        return Err(TesseraError::InvalidOperation(format!(
            "user {} already has open changeset {}",
            changeset.user_id, open.id
        )));
    }

    tx.changeset_update_state(id, target, None).await?;
    tx.action_create(id, transition.action(), comment, user.id, now())
        .await?;
    Ok(ChangesetRecord {
        state: target,
        ..changeset
    })
}

async fn apply_changeset(
    tx: &mut dyn PersistenceTransaction,
    user: &UserContext,
    id: i64,
    comment: Option<&str>,
) -> Result<ChangesetRecord> {
    let changeset = lock_changeset(tx, id).await?;
    check_transition(changeset.state, Transition::Apply)?;
    let changes = tx.change_list(id).await?;
    if !can_apply(tx, user, &changeset, &changes).await? {
        warn!("User {} may not apply changeset {}", user.id, id);
        return Err(TesseraError::PermissionDenied(format!(
            "user {} cannot apply changeset {}",
            user.id, id
        )));
    }

    let pending = load_pending_changes(&*tx, changes.clone()).await?;
    let first_conflict = changes
        .iter()
        .zip(detect_conflicts(&pending))
        .find_map(|(change, conflict)| conflict.map(|conflict| (change.id, conflict)));
    if let Some((change_id, conflict)) = first_conflict {
        warn!(
            "Changeset {} not applied: change {} conflicts ({})",
            id, change_id, conflict
        );
        return Err(TesseraError::InvalidOperation(format!(
            "change {} of changeset {} conflicts with the live state: {}",
            change_id, id, conflict
        )));
    }

    let start = now();
    let end = start - TimeDelta::microseconds(1);
    for change in &changes {
        apply_change(tx, change, start, end).await?;
        debug!(
            "Applied {} {} change {}",
            change.change_type,
            change.kind.tag(),
            change.id
        );
    }

    tx.changeset_update_state(id, ChangesetState::Applied, Some(start))
        .await?;
    tx.action_create(id, ActionType::Apply, comment, user.id, start)
        .await?;
    Ok(ChangesetRecord {
        state: ChangesetState::Applied,
        applied_at: Some(start),
        ..changeset
    })
}

async fn apply_change(
    tx: &mut dyn PersistenceTransaction,
    change: &ChangeRecord,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<()> {
    match (change.kind, change.change_type) {
        (
            ChangeKind::VariationValue {
                old_variation_value_id,
                new_variation_value_id,
                ..
            },
            _,
        ) => {
            if let Some(old) = old_variation_value_id {
                end_validity(tx, VersionedEntity::VariationValue, old, end).await?;
            }
            if let Some(new) = new_variation_value_id {
                start_validity(tx, VersionedEntity::VariationValue, new, start).await?;
            }
        }
        (ChangeKind::Key { key_id }, ChangeType::Create) => {
            start_validity(tx, VersionedEntity::Key, key_id, start).await?;
        }
        (ChangeKind::Key { key_id }, ChangeType::Delete) => {
            end_validity(tx, VersionedEntity::Key, key_id, end).await?;
        }
        (ChangeKind::Link { link_id }, ChangeType::Create) => {
            start_validity(tx, VersionedEntity::Link, link_id, start).await?;
        }
        (ChangeKind::Link { link_id }, ChangeType::Delete) => {
            end_validity(tx, VersionedEntity::Link, link_id, end).await?;
        }
        (ChangeKind::FeatureVersion { feature_version_id }, ChangeType::Create) => {
            start_validity(tx, VersionedEntity::FeatureVersion, feature_version_id, start)
                .await?;
            let version = tx
                .feature_version_find(feature_version_id)
                .await?
                .ok_or_else(|| {
                    TesseraError::not_found(format!("feature version {}", feature_version_id))
                })?;
            if version.version == 1
                && let Some(feature) = tx.feature_find(version.feature_id).await?
                && feature.validity.is_pending()
            {
                start_validity(tx, VersionedEntity::Feature, feature.id, start).await?;
            }
        }
        (ChangeKind::FeatureVersion { feature_version_id }, ChangeType::Delete) => {
            end_validity(tx, VersionedEntity::FeatureVersion, feature_version_id, end).await?;
        }
        (ChangeKind::ServiceVersion { service_version_id }, ChangeType::Create) => {
            start_validity(tx, VersionedEntity::ServiceVersion, service_version_id, start)
                .await?;
            let version = tx
                .service_version_find(service_version_id)
                .await?
                .ok_or_else(|| {
                    TesseraError::not_found(format!("service version {}", service_version_id))
                })?;
            if version.version == 1
                && let Some(service) = tx.service_find(version.service_id).await?
                && service.validity.is_pending()
            {
                start_validity(tx, VersionedEntity::Service, service.id, start).await?;
            }
        }
        (ChangeKind::ServiceVersion { service_version_id }, ChangeType::Delete) => {
            end_validity(tx, VersionedEntity::ServiceVersion, service_version_id, end).await?;
        }
        // Non-value updates carry no pending rows
        (_, ChangeType::Update) => {}
    }
    Ok(())
}

async fn start_validity(
    tx: &mut dyn PersistenceTransaction,
    entity: VersionedEntity,
    id: i64,
    at: NaiveDateTime,
) -> Result<()> {
    if tx.start_validity(entity, id, at).await? {
        Ok(())
    } else {
        Err(TesseraError::not_found(format!("{} {}", entity, id)))
    }
}

/// Closes a live row; a row that already ended keeps its `valid_to`
async fn end_validity(
    tx: &mut dyn PersistenceTransaction,
    entity: VersionedEntity,
    id: i64,
    at: NaiveDateTime,
) -> Result<()> {
    let validity = find_validity(tx, entity, id)
        .await?
        .ok_or_else(|| TesseraError::not_found(format!("{} {}", entity, id)))?;
    if validity.has_ended() {
        return Err(TesseraError::InvalidOperation(format!(
            "{} {} has already ended",
            entity, id
        )));
    }
    if tx.end_validity(entity, id, at).await? {
        Ok(())
    } else {
        Err(TesseraError::not_found(format!("{} {}", entity, id)))
    }
}

async fn find_validity(
    tx: &dyn PersistenceTransaction,
    entity: VersionedEntity,
    id: i64,
) -> Result<Option<Validity>> {
    let validity = match entity {
        VersionedEntity::Service => tx.service_find(id).await?.map(|r| r.validity),
        VersionedEntity::ServiceVersion => tx.service_version_find(id).await?.map(|r| r.validity),
        VersionedEntity::Feature => tx.feature_find(id).await?.map(|r| r.validity),
        VersionedEntity::FeatureVersion => tx.feature_version_find(id).await?.map(|r| r.validity),
        VersionedEntity::Link => tx.link_find(id).await?.map(|r| r.validity),
        VersionedEntity::Key => tx.key_find(id).await?.map(|r| r.validity),
        VersionedEntity::VariationValue => tx.value_find(id).await?.map(|r| r.validity),
    };
    Ok(validity)
}

async fn discard_changeset(
    tx: &mut dyn PersistenceTransaction,
    user: &UserContext,
    id: i64,
    comment: Option<&str>,
) -> Result<ChangesetRecord> {
    let changeset = lock_changeset(tx, id).await?;
    check_transition(changeset.state, Transition::Discard)?;
    require_owner(user, &changeset)?;

    let changes = tx.change_list(id).await?;
    for change in changes.iter().rev() {
        remove_introduced_rows(tx, change).await?;
    }
    let removed = tx.change_delete_by_changeset(id).await?;
    debug!("Removed {} pending changes of changeset {}", removed, id);

    tx.changeset_update_state(id, ChangesetState::Discarded, None)
        .await?;
    tx.action_create(id, ActionType::Discard, comment, user.id, now())
        .await?;
    Ok(ChangesetRecord {
        state: ChangesetState::Discarded,
        ..changeset
    })
}

async fn discard_single_change(
    tx: &mut dyn PersistenceTransaction,
    user: &UserContext,
    change_id: i64,
) -> Result<()> {
    let change = tx
        .change_find(change_id)
        .await?
        .ok_or_else(|| TesseraError::not_found(format!("change {}", change_id)))?;
    let changeset = lock_changeset(tx, change.changeset_id).await?;
    check_transition(changeset.state, Transition::Discard)?;
    require_owner(user, &changeset)?;

    let siblings: Vec<ChangeRecord> = tx
        .change_list(changeset.id)
        .await?
        .into_iter()
        .filter(|other| other.id != change.id)
        .collect();

    match (change.kind, change.change_type) {
        (
            ChangeKind::VariationValue {
                variation_context_id,
                ..
            },
            ChangeType::Create,
        ) if variation_context_id == DEFAULT_VARIATION_CONTEXT_ID => {
            return Err(TesseraError::InvalidOperation(
                "the default value of a key can only be discarded with the key".to_string(),
            ));
        }
        (ChangeKind::Key { key_id }, ChangeType::Create) => {
            for sibling in siblings.iter().rev() {
                if matches!(sibling.kind, ChangeKind::VariationValue { key_id: k, .. } if k == key_id)
                {
                    remove_introduced_rows(tx, sibling).await?;
                    tx.change_delete(sibling.id).await?;
                }
            }
        }
        (ChangeKind::FeatureVersion { feature_version_id }, ChangeType::Create) => {
            for sibling in &siblings {
                if in_feature_version(tx, sibling, feature_version_id).await? {
                    return Err(TesseraError::InvalidOperation(format!(
                        "change {} depends on feature version {}",
                        sibling.id, feature_version_id
                    )));
                }
            }
        }
        (ChangeKind::ServiceVersion { service_version_id }, ChangeType::Create) => {
            for sibling in &siblings {
                if let ChangeKind::Link { link_id } = sibling.kind
                    && let Some(link) = tx.link_find(link_id).await?
                    && link.service_version_id == service_version_id
                {
                    return Err(TesseraError::InvalidOperation(format!(
                        "change {} depends on service version {}",
                        sibling.id, service_version_id
                    )));
                }
            }
        }
        _ => {}
    }

    remove_introduced_rows(tx, &change).await?;
    tx.change_delete(change.id).await?;
    Ok(())
}

/// Whether a change touches a row inside the given feature version
async fn in_feature_version(
    tx: &dyn PersistenceTransaction,
    change: &ChangeRecord,
    feature_version_id: i64,
) -> Result<bool> {
    if let Some(key_id) = change.kind.key_id() {
        return Ok(tx
            .key_find(key_id)
            .await?
            .is_some_and(|key| key.feature_version_id == feature_version_id));
    }
    if let ChangeKind::Link { link_id } = change.kind {
        return Ok(tx
            .link_find(link_id)
            .await?
            .is_some_and(|link| link.feature_version_id == feature_version_id));
    }
    Ok(false)
}

/// Delete the pending row a change introduced: the new value of a value change, or the row of a `Create`
async fn remove_introduced_rows(
    tx: &mut dyn PersistenceTransaction,
    change: &ChangeRecord,
) -> Result<()> {
    // Value updates introduce a pending row as well
    if let ChangeKind::VariationValue {
        new_variation_value_id,
        ..
    } = change.kind
    {
        let Some(id) = new_variation_value_id else {
            return Ok(());
        };
        match tx.value_find(id).await? {
            Some(value) if value.validity.is_pending() => {
                tx.value_delete(id).await?;
            }
            Some(_) => warn!("Value {} of change {} is no longer pending", id, change.id),
            None => warn!(
                "Pending {} {} of change {} was already removed",
                VersionedEntity::VariationValue,
                id,
                change.id
            ),
        }
        return Ok(());
    }
    if change.change_type != ChangeType::Create {
        return Ok(());
    }

    let (entity, id, removed) = match change.kind {
        ChangeKind::VariationValue { .. } => return Ok(()),
        ChangeKind::Key { key_id } => (VersionedEntity::Key, key_id, tx.key_delete(key_id).await?),
        ChangeKind::Link { link_id } => {
            (VersionedEntity::Link, link_id, tx.link_delete(link_id).await?)
        }
        ChangeKind::FeatureVersion { feature_version_id } => {
            let version = tx.feature_version_find(feature_version_id).await?;
            let removed = tx.feature_version_delete(feature_version_id).await?;
            if let Some(version) = version
                && version.version == 1
                && let Some(feature) = tx.feature_find(version.feature_id).await?
                && feature.validity.is_pending()
            {
                tx.feature_delete(feature.id).await?;
            }
            (VersionedEntity::FeatureVersion, feature_version_id, removed)
        }
        ChangeKind::ServiceVersion { service_version_id } => {
            let version = tx.service_version_find(service_version_id).await?;
            let removed = tx.service_version_delete(service_version_id).await?;
            if let Some(version) = version
                && version.version == 1
                && let Some(service) = tx.service_find(version.service_id).await?
                && service.validity.is_pending()
            {
                tx.service_delete(service.id).await?;
            }
            (VersionedEntity::ServiceVersion, service_version_id, removed)
        }
    };

    if !removed {
        warn!(
            "Pending {} {} of change {} was already removed",
            entity, id, change.id
        );
    }
    Ok(())
}

// ============================================================================
// Apply permission
// ============================================================================

async fn can_apply(
    tx: &dyn PersistenceTransaction,
    user: &UserContext,
    changeset: &ChangesetRecord,
    changes: &[ChangeRecord],
) -> Result<bool> {
    match changeset.state {
        ChangesetState::Committed => {}
        ChangesetState::Open if changeset.user_id == user.id => {}
        _ => return Ok(false),
    }
    if user.is_global_admin {
        return Ok(true);
    }

    let services = touched_services(tx, changes).await?;
    Ok(services
        .into_iter()
        .all(|service_id| user.has_service_level(service_id, PermissionLevel::Admin)))
}

/// Union of the services each change is scoped to
async fn touched_services(
    tx: &dyn PersistenceTransaction,
    changes: &[ChangeRecord],
) -> Result<BTreeSet<i64>> {
    let mut services = BTreeSet::new();
    for change in changes {
        services.extend(services_for_change(tx, &change.kind).await?);
    }
    Ok(services)
}

async fn services_for_change(
    tx: &dyn PersistenceTransaction,
    kind: &ChangeKind,
) -> Result<Vec<i64>> {
    match *kind {
        ChangeKind::ServiceVersion { service_version_id } => {
            Ok(vec![service_of_version(tx, service_version_id).await?])
        }
        ChangeKind::FeatureVersion { feature_version_id } => {
            services_for_feature_version(tx, feature_version_id).await
        }
        ChangeKind::Link { link_id } => {
            let link = tx
                .link_find(link_id)
                .await?
                .ok_or_else(|| TesseraError::not_found(format!("link {}", link_id)))?;
            Ok(vec![service_of_version(tx, link.service_version_id).await?])
        }
        ChangeKind::Key { key_id } | ChangeKind::VariationValue { key_id, .. } => {
            let key = tx
                .key_find(key_id)
                .await?
                .ok_or_else(|| TesseraError::not_found(format!("key {}", key_id)))?;
            services_for_feature_version(tx, key.feature_version_id).await
        }
    }
}

async fn service_of_version(tx: &dyn PersistenceTransaction, service_version_id: i64) -> Result<i64> {
    tx.service_version_find(service_version_id)
        .await?
        .map(|sv| sv.service_id)
        .ok_or_else(|| TesseraError::not_found(format!("service version {}", service_version_id)))
}

async fn services_for_feature_version(
    tx: &dyn PersistenceTransaction,
    feature_version_id: i64,
) -> Result<Vec<i64>> {
    let version = tx
        .feature_version_find(feature_version_id)
        .await?
        .ok_or_else(|| TesseraError::not_found(format!("feature version {}", feature_version_id)))?;
    Ok(tx.link_services_for_feature(version.feature_id).await?)
}

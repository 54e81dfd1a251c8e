//! Loading pending changes together with the live state they are checked against

use tessera_common::Result;
use tessera_persistence::{ChangeKind, ChangeRecord, KeyRecord, PersistenceTransaction};

use crate::conflict::{
    KeySnapshot, LinkSnapshot, PendingChange, ValueSnapshot, VersionSnapshot,
};

/// Snapshot every change of a changeset, keeping storage order
pub async fn load_pending_changes(
    tx: &dyn PersistenceTransaction,
    changes: Vec<ChangeRecord>,
) -> Result<Vec<PendingChange>> {
    let mut pending = Vec::with_capacity(changes.len());
    for change in changes {
        pending.push(load_pending_change(tx, change).await?);
    }
    Ok(pending)
}

async fn load_pending_change(
    tx: &dyn PersistenceTransaction,
    change: ChangeRecord,
) -> Result<PendingChange> {
    let kind = change.kind;
    let mut pending = PendingChange::new(change);

    match kind {
        ChangeKind::VariationValue {
            key_id,
            variation_context_id,
            old_variation_value_id,
            new_variation_value_id,
        } => {
            if let Some(key) = tx.key_find(key_id).await? {
                pending.key = Some(key_snapshot(tx, &key).await?);
            }
            if let Some(id) = old_variation_value_id {
                pending.old_value =
                    value_snapshot(tx, id, key_id, variation_context_id).await?;
            }
            if let Some(id) = new_variation_value_id {
                pending.new_value =
                    value_snapshot(tx, id, key_id, variation_context_id).await?;
            }
        }
        ChangeKind::Key { key_id } => {
            if let Some(key) = tx.key_find(key_id).await? {
                pending.key = Some(key_snapshot(tx, &key).await?);
            }
        }
        ChangeKind::Link { link_id } => {
            pending.link = link_snapshot(tx, link_id).await?;
        }
        ChangeKind::FeatureVersion { feature_version_id } => {
            if let Some(fv) = tx.feature_version_find(feature_version_id).await? {
                pending.version = Some(VersionSnapshot {
                    parent_id: fv.feature_id,
                    version: fv.version,
                    max_live: tx.feature_version_max(fv.feature_id, true).await?,
                    published: linked_to_published(tx, fv.id).await?,
                });
            }
        }
        ChangeKind::ServiceVersion { service_version_id } => {
            if let Some(sv) = tx.service_version_find(service_version_id).await? {
                pending.version = Some(VersionSnapshot {
                    parent_id: sv.service_id,
                    version: sv.version,
                    max_live: tx.service_version_max(sv.service_id, true).await?,
                    published: sv.published,
                });
            }
        }
    }

    Ok(pending)
}

async fn key_snapshot(tx: &dyn PersistenceTransaction, key: &KeyRecord) -> Result<KeySnapshot> {
    let feature_version_ended = tx
        .feature_version_find(key.feature_version_id)
        .await?
        .is_none_or(|fv| fv.validity.has_ended());
    let live_duplicate = tx
        .key_find_live_by_name(key.feature_version_id, &key.name)
        .await?
        .is_some_and(|other| other.id != key.id);

    Ok(KeySnapshot {
        id: key.id,
        name: key.name.clone(),
        feature_version_id: key.feature_version_id,
        live: key.validity.is_live(),
        ended: key.validity.has_ended(),
        feature_version_ended,
        validators_updated_at: key.validators_updated_at,
        live_duplicate,
        in_published_service_version: linked_to_published(tx, key.feature_version_id).await?,
    })
}

async fn value_snapshot(
    tx: &dyn PersistenceTransaction,
    value_id: i64,
    key_id: i64,
    variation_context_id: i64,
) -> Result<Option<ValueSnapshot>> {
    let Some(value) = tx.value_find(value_id).await? else {
        return Ok(None);
    };
    let live_in_context = tx
        .value_find_live(key_id, variation_context_id)
        .await?
        .is_some_and(|other| other.id != value.id);

    Ok(Some(ValueSnapshot {
        id: value.id,
        ended: value.validity.has_ended(),
        live_in_context,
    }))
}

async fn link_snapshot(
    tx: &dyn PersistenceTransaction,
    link_id: i64,
) -> Result<Option<LinkSnapshot>> {
    let Some(link) = tx.link_find(link_id).await? else {
        return Ok(None);
    };
    let Some(fv) = tx.feature_version_find(link.feature_version_id).await? else {
        return Ok(None);
    };
    let live_duplicate = tx
        .link_find_live(fv.feature_id, link.service_version_id)
        .await?
        .is_some_and(|other| other.id != link.id);
    let service_version_published = tx
        .service_version_find(link.service_version_id)
        .await?
        .is_some_and(|sv| sv.published);

    Ok(Some(LinkSnapshot {
        id: link.id,
        feature_id: fv.feature_id,
        service_version_id: link.service_version_id,
        ended: link.validity.has_ended(),
        live_duplicate,
        service_version_published,
    }))
}

/// Whether a feature version is linked, through a link that has not ended,
/// to a published service version
async fn linked_to_published(
    tx: &dyn PersistenceTransaction,
    feature_version_id: i64,
) -> Result<bool> {
    for link in tx.link_list_by_feature_version(feature_version_id).await? {
        if link.validity.has_ended() {
            continue;
        }
        if let Some(sv) = tx.service_version_find(link.service_version_id).await?
            && sv.published
        {
            return Ok(true);
        }
    }
    Ok(false)
}

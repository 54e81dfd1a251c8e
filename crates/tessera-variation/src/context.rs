//! Variation context resolution
//!
//! A variation context is the canonical identity of a set of property
//! values. Any set-equal collection of value ids resolves to the same
//! context row, created on first use. The empty set is the default context.

use std::collections::HashMap;

use tessera_common::{DEFAULT_VARIATION_CONTEXT_ID, Result};
use tessera_persistence::PersistenceTransaction;

use crate::hierarchy::VariationHierarchy;

/// Sorted, deduplicated form of a value id collection
pub fn canonicalize(value_ids: &[i64]) -> Vec<i64> {
    let mut ids = value_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Existing context for a value set, without creating one
pub async fn find_variation_context_id(
    tx: &dyn PersistenceTransaction,
    value_ids: &[i64],
) -> Result<Option<i64>> {
    let ids = canonicalize(value_ids);
    if ids.is_empty() {
        return Ok(Some(DEFAULT_VARIATION_CONTEXT_ID));
    }
    Ok(tx.context_find(&ids).await?)
}

/// Context for a value set, created on first use
pub async fn get_variation_context_id(
    tx: &mut dyn PersistenceTransaction,
    value_ids: &[i64],
) -> Result<i64> {
    let ids = canonicalize(value_ids);
    if ids.is_empty() {
        return Ok(DEFAULT_VARIATION_CONTEXT_ID);
    }
    if let Some(id) = tx.context_find(&ids).await? {
        return Ok(id);
    }
    let id = tx.context_create(&ids).await?;
    tracing::debug!("Created variation context {} for values {:?}", id, ids);
    Ok(id)
}

/// Value ids making up a context, ascending
pub async fn get_variation_context_values(
    tx: &dyn PersistenceTransaction,
    context_id: i64,
) -> Result<Vec<i64>> {
    if context_id == DEFAULT_VARIATION_CONTEXT_ID {
        return Ok(Vec::new());
    }
    Ok(tx.context_values(context_id).await?)
}

/// Resolve a `{property id: value text}` map straight to a context id
pub async fn resolve_variation_context(
    tx: &mut dyn PersistenceTransaction,
    hierarchy: &VariationHierarchy,
    service_type_id: i64,
    variation: &HashMap<i64, String>,
) -> Result<i64> {
    let ids = hierarchy.variation_map_to_ids(service_type_id, variation)?;
    get_variation_context_id(tx, &ids).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tessera_common::TesseraError;
    use tessera_persistence::{MemoryPersistService, PersistenceService};

    #[tokio::test]
    async fn test_empty_set_is_default_context() {
        let svc = MemoryPersistService::new();
        let mut tx = svc.begin().await.unwrap();
        assert_eq!(
            get_variation_context_id(tx.as_mut(), &[]).await.unwrap(),
            DEFAULT_VARIATION_CONTEXT_ID
        );
        assert!(
            get_variation_context_values(tx.as_ref(), DEFAULT_VARIATION_CONTEXT_ID)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_context_created_once() {
        let svc = MemoryPersistService::new();
        let mut tx = svc.begin().await.unwrap();

        assert_eq!(find_variation_context_id(tx.as_ref(), &[3, 5]).await.unwrap(), None);
        let first = get_variation_context_id(tx.as_mut(), &[5, 3]).await.unwrap();
        let second = get_variation_context_id(tx.as_mut(), &[3, 5, 3]).await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first, DEFAULT_VARIATION_CONTEXT_ID);
        assert_eq!(
            get_variation_context_values(tx.as_ref(), first).await.unwrap(),
            vec![3, 5]
        );

        let other = get_variation_context_id(tx.as_mut(), &[3]).await.unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn test_unknown_context_is_not_found() {
        let svc = MemoryPersistService::new();
        let tx = svc.begin().await.unwrap();
        assert!(matches!(
            get_variation_context_values(tx.as_ref(), 777).await,
            Err(TesseraError::RecordNotFound(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_set_equal_ids_share_a_context(
            ids in prop::collection::vec(1i64..20, 0..6),
            seed in any::<u64>(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let svc = MemoryPersistService::new();
                let mut tx = svc.begin().await.unwrap();

                let mut shuffled = ids.clone();
                shuffled.rotate_left((seed as usize) % ids.len().max(1));
                shuffled.reverse();
                shuffled.extend(ids.iter().take(2));

                let a = get_variation_context_id(tx.as_mut(), &ids).await.unwrap();
                let b = get_variation_context_id(tx.as_mut(), &shuffled).await.unwrap();
                assert_eq!(a, b);
            });
        }
    }
}

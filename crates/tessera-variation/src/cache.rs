//! Shared variation hierarchy cache
//!
//! Readers get an immutable snapshot through an atomic pointer swap and keep
//! using it for as long as they hold it. Admin mutations install a rebuilt
//! snapshot before returning; otherwise a snapshot older than the configured
//! TTL is rebuilt on the next `current_or_refresh`. Readers holding an older
//! snapshot may therefore observe data up to one TTL stale.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tokio::sync::Mutex;

use tessera_common::Result;
use tessera_persistence::PersistenceService;

use crate::hierarchy::VariationHierarchy;

/// Default staleness tolerance for cached snapshots
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct HierarchyOptions {
    pub cache_ttl: Duration,
}

impl Default for HierarchyOptions {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// A built hierarchy and the moment it was built
#[derive(Debug)]
pub struct HierarchySnapshot {
    pub hierarchy: VariationHierarchy,
    pub built_at: Instant,
}

impl HierarchySnapshot {
    pub fn age(&self) -> Duration {
        self.built_at.elapsed()
    }
}

pub struct HierarchyCache {
    current: ArcSwapOption<HierarchySnapshot>,
    ttl: Duration,
    refresh_lock: Mutex<()>,
}

impl HierarchyCache {
    pub fn new(options: HierarchyOptions) -> Self {
        Self {
            current: ArcSwapOption::empty(),
            ttl: options.cache_ttl,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Current snapshot, whatever its age
    pub fn snapshot(&self) -> Option<Arc<HierarchySnapshot>> {
        self.current.load_full()
    }

    /// Drop the current snapshot; the next `current_or_refresh` rebuilds
    pub fn invalidate(&self) {
        self.current.store(None);
    }

    /// Publish an already built hierarchy
    pub fn install(&self, hierarchy: VariationHierarchy) -> Arc<HierarchySnapshot> {
        let snapshot = Arc::new(HierarchySnapshot {
            hierarchy,
            built_at: Instant::now(),
        });
        self.current.store(Some(snapshot.clone()));
        snapshot
    }

    /// Rebuild from storage and publish
    pub async fn refresh(
        &self,
        persistence: &dyn PersistenceService,
    ) -> Result<Arc<HierarchySnapshot>> {
        let _guard = self.refresh_lock.lock().await;
        self.rebuild(persistence).await
    }

    /// Current snapshot, rebuilt first if missing or older than the TTL
    pub async fn current_or_refresh(
        &self,
        persistence: &dyn PersistenceService,
    ) -> Result<Arc<HierarchySnapshot>> {
        if let Some(snapshot) = self.fresh() {
            return Ok(snapshot);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have rebuilt while we waited
        if let Some(snapshot) = self.fresh() {
            return Ok(snapshot);
        }
        self.rebuild(persistence).await
    }

    fn fresh(&self) -> Option<Arc<HierarchySnapshot>> {
        self.current
            .load_full()
            .filter(|snapshot| snapshot.age() < self.ttl)
    }

    async fn rebuild(&self, persistence: &dyn PersistenceService) -> Result<Arc<HierarchySnapshot>> {
        let tx = persistence.begin().await?;
        let hierarchy = VariationHierarchy::load(tx.as_ref()).await;
        tx.rollback().await?;
        let snapshot = self.install(hierarchy?);
        tracing::debug!("Rebuilt variation hierarchy snapshot");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_persistence::MemoryPersistService;

    async fn seed(svc: &MemoryPersistService) -> i64 {
        let mut tx = svc.begin().await.unwrap();
        let st = tx.service_type_create("web").await.unwrap();
        let env = tx.property_create("env", "").await.unwrap();
        tx.property_value_create(env.id, "prod", None, 0)
            .await
            .unwrap();
        tx.service_type_property_upsert(st.id, env.id, 1)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        st.id
    }

    #[tokio::test]
    async fn test_current_or_refresh_builds_once() {
        let svc = MemoryPersistService::new();
        let st = seed(&svc).await;
        let cache = HierarchyCache::new(HierarchyOptions::default());
        assert!(cache.snapshot().is_none());

        let first = cache.current_or_refresh(&svc).await.unwrap();
        assert_eq!(first.hierarchy.get_properties(st).unwrap().len(), 1);

        let second = cache.current_or_refresh(&svc).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let svc = MemoryPersistService::new();
        seed(&svc).await;
        let cache = HierarchyCache::new(HierarchyOptions::default());

        let first = cache.current_or_refresh(&svc).await.unwrap();
        cache.invalidate();
        assert!(cache.snapshot().is_none());
        let second = cache.current_or_refresh(&svc).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_expired_snapshot_is_rebuilt() {
        let svc = MemoryPersistService::new();
        seed(&svc).await;
        let cache = HierarchyCache::new(HierarchyOptions {
            cache_ttl: Duration::ZERO,
        });

        let first = cache.current_or_refresh(&svc).await.unwrap();
        let second = cache.current_or_refresh(&svc).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_held_snapshot_survives_swap() {
        let svc = MemoryPersistService::new();
        let st = seed(&svc).await;
        let cache = HierarchyCache::new(HierarchyOptions::default());
        let held = cache.current_or_refresh(&svc).await.unwrap();

        cache.install(VariationHierarchy::default());
        assert_eq!(held.hierarchy.get_properties(st).unwrap().len(), 1);
        let current = cache.snapshot().unwrap();
        assert!(current.hierarchy.get_properties(st).is_err());
    }
}

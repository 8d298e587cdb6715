use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::coordinator::Coordinator;
use super::key::ResourceKey;

/// Recency order of the coordinators that currently hold stored content.
#[derive(Debug)]
pub(crate) struct CacheIndex {
    lru: LruCache<ResourceKey, Arc<Coordinator>>,
}

impl CacheIndex {
    pub(crate) fn new(capacity: NonZeroUsize) -> Self {
        Self {
            lru: LruCache::new(capacity),
        }
    }

    /// Inserts or promotes `coordinator`. Returns the coordinators pushed
    /// out: the least recently used one when full, or a stale instance
    /// registered under the same key.
    pub(crate) fn insert(&mut self, coordinator: &Arc<Coordinator>) -> Option<Arc<Coordinator>> {
        let key = coordinator.key();
        if let Some(existing) = self.lru.get(key)
            && Arc::ptr_eq(existing, coordinator)
        {
            return None;
        }
        self.lru
            .push(key.clone(), coordinator.clone())
            .map(|(_, evicted)| evicted)
    }

    /// Marks `coordinator` as just used. False when it no longer holds a
    /// slot, in which case its entries must not be served.
    pub(crate) fn touch(&mut self, coordinator: &Coordinator) -> bool {
        self.lru
            .get(coordinator.key())
            .is_some_and(|c| std::ptr::eq(c.as_ref(), coordinator))
    }

    pub(crate) fn pop_lru(&mut self) -> Option<Arc<Coordinator>> {
        self.lru.pop_lru().map(|(_, coordinator)| coordinator)
    }

    pub(crate) fn remove(&mut self, key: &ResourceKey) -> Option<Arc<Coordinator>> {
        self.lru.pop(key)
    }

    pub(crate) fn contains(&self, coordinator: &Coordinator) -> bool {
        self.lru
            .peek(coordinator.key())
            .is_some_and(|c| std::ptr::eq(c.as_ref(), coordinator))
    }

    pub(crate) fn clear(&mut self) -> Vec<Arc<Coordinator>> {
        let mut drained = Vec::with_capacity(self.lru.len());
        while let Some((_, coordinator)) = self.lru.pop_lru() {
            drained.push(coordinator);
        }
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.lru.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(path: &str) -> Arc<Coordinator> {
        Arc::new(Coordinator::new(ResourceKey::new("h", path)))
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut index = CacheIndex::new(NonZeroUsize::new(2).unwrap());
        let a = coordinator("/a");
        let b = coordinator("/b");
        let c = coordinator("/c");
        assert!(index.insert(&a).is_none());
        assert!(index.insert(&b).is_none());
        assert!(index.insert(&a).is_none());

        let evicted = index.insert(&c).expect("eviction");
        assert!(Arc::ptr_eq(&evicted, &b));
        assert!(index.contains(&a));
        assert!(!index.contains(&b));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn touch_refreshes_recency() {
        let mut index = CacheIndex::new(NonZeroUsize::new(2).unwrap());
        let a = coordinator("/a");
        let b = coordinator("/b");
        index.insert(&a);
        index.insert(&b);
        assert!(index.touch(&a));

        let evicted = index.insert(&coordinator("/c")).expect("eviction");
        assert!(Arc::ptr_eq(&evicted, &b));
        assert!(!index.touch(&b));
        assert!(index.touch(&a));
    }

    #[test]
    fn touch_rejects_stale_instance() {
        let mut index = CacheIndex::new(NonZeroUsize::new(2).unwrap());
        let current = coordinator("/a");
        index.insert(&current);
        assert!(!index.touch(&coordinator("/a")));
        assert!(index.touch(&current));
    }

    #[test]
    fn replacing_instance_returns_old_one() {
        let mut index = CacheIndex::new(NonZeroUsize::new(4).unwrap());
        let old = coordinator("/a");
        let new = coordinator("/a");
        index.insert(&old);
        let displaced = index.insert(&new).expect("displaced");
        assert!(Arc::ptr_eq(&displaced, &old));
        assert!(index.contains(&new));
        assert!(!index.contains(&old));
    }

    #[test]
    fn clear_drains_everything() {
        let mut index = CacheIndex::new(NonZeroUsize::new(4).unwrap());
        index.insert(&coordinator("/a"));
        index.insert(&coordinator("/b"));
        assert_eq!(index.clear().len(), 2);
        assert_eq!(index.len(), 0);
        assert!(index.clear().is_empty());
        assert!(index.pop_lru().is_none());
    }
}

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Result, anyhow};
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

mod admission;
mod capture;
pub mod clock;
pub mod content;
mod coordinator;
pub mod entry;
pub mod freshness;
mod index;
pub mod key;
mod serve;

pub use admission::CacheSkipReason;
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{CacheOutcome, Coordinator, KILL_BACKOFF};
pub use freshness::{DefaultFreshness, FreshnessResolver, NoDefaultFreshness, PathMaxAgeRules};
pub use key::ResourceKey;

use admission::AdmissionPolicy;
use index::CacheIndex;
use serve::ServeOptions;

use crate::logging::CacheEventBuilder;
use crate::metrics;
use crate::protocol::{CacheRequest, DispatchError, Handler, Response};
use crate::settings::Settings;
use crate::store::{BlockStore, FileBlockStore, MemoryBlockStore};

/// Most coordinators dropped for disk space in a single activation.
const MAX_DISK_EVICTIONS: usize = 64;
/// Coordinators remembered per cached resource, including uncacheable ones.
const LOOKUP_FACTOR: usize = 4;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_entry_size: u64,
    pub disk_size: u64,
    pub enable_range: bool,
    pub rewrite_vary_as_private: bool,
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_entry_size: 1024 * 1024,
            disk_size: 64 * 1024 * 1024,
            enable_range: true,
            rewrite_vary_as_private: false,
            enabled: true,
        }
    }
}

/// Shared handle to the response cache. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ResponseCache {
    state: Arc<CacheState>,
}

#[derive(Debug)]
pub(crate) struct CacheState {
    config: CacheConfig,
    store: Arc<dyn BlockStore>,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn FreshnessResolver>,
    lookup: Mutex<LruCache<ResourceKey, Arc<Coordinator>>>,
    index: Mutex<CacheIndex>,
    enabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    next_token: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub resources: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub bytes_in_use: u64,
    pub disk_size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheItem {
    pub host: String,
    pub path: String,
    pub cacheable: bool,
    pub cached: bool,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ItemSort {
    #[default]
    Hits,
    Misses,
}

impl ResponseCache {
    pub fn new(config: CacheConfig, store: Arc<dyn BlockStore>) -> Result<Self> {
        Self::with_parts(
            config,
            store,
            Arc::new(SystemClock),
            Arc::new(NoDefaultFreshness),
        )
    }

    pub fn with_parts(
        config: CacheConfig,
        store: Arc<dyn BlockStore>,
        clock: Arc<dyn Clock>,
        resolver: Arc<dyn FreshnessResolver>,
    ) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.max_entries)
            .ok_or_else(|| anyhow!("cache max_entries must be greater than zero"))?;
        let lookup_capacity = NonZeroUsize::new(config.max_entries.saturating_mul(LOOKUP_FACTOR))
            .unwrap_or(capacity);
        let enabled = config.enabled;
        let state = Arc::new(CacheState {
            config,
            store,
            clock,
            resolver,
            lookup: Mutex::new(LruCache::new(lookup_capacity)),
            index: Mutex::new(CacheIndex::new(capacity)),
            enabled: AtomicBool::new(enabled),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            next_token: AtomicU64::new(1),
        });
        Ok(Self { state })
    }

    /// Builds the cache described by `settings`: a file-backed store under
    /// `cache_dir` when set, memory otherwise.
    pub fn open(settings: &Settings) -> Result<Self> {
        let (store, budget): (Arc<dyn BlockStore>, u64) = match &settings.cache_dir {
            Some(dir) => (
                Arc::new(FileBlockStore::open(
                    dir,
                    settings.block_size,
                    settings.enable_mmap,
                )?),
                settings.disk_size,
            ),
            None => (
                Arc::new(MemoryBlockStore::new(settings.block_size)),
                settings.memory_size,
            ),
        };
        let resolver = PathMaxAgeRules::new(&settings.max_age)?;
        info!(
            cache_dir = ?settings.cache_dir,
            budget,
            max_entries = settings.max_entries,
            max_age_rules = resolver.len(),
            "response cache ready"
        );
        let config = CacheConfig {
            max_entries: settings.max_entries,
            max_entry_size: settings.max_entry_size,
            disk_size: budget,
            enable_range: settings.enable_range,
            rewrite_vary_as_private: settings.rewrite_vary_as_private,
            enabled: settings.enabled,
        };
        Self::with_parts(config, store, Arc::new(SystemClock), Arc::new(resolver))
    }

    /// Serves `req` from the cache or through `next`, filling the cache when
    /// the response allows it.
    pub fn handle(
        &self,
        req: &CacheRequest,
        resp: &mut dyn Response,
        next: &dyn Handler,
    ) -> Result<CacheOutcome, DispatchError> {
        let started = Instant::now();
        let key = ResourceKey::new(req.host.clone(), req.path.clone());
        let coordinator = self.state.lookup_or_create(&key);
        let result = coordinator.handle(&self.state, req, resp, next);

        let elapsed = started.elapsed();
        let event = CacheEventBuilder::new(req)
            .status(resp.status())
            .content_length(resp.headers())
            .elapsed(elapsed);
        match &result {
            Ok(outcome) => {
                coordinator.record(*outcome);
                match outcome.tally() {
                    Some(true) => self.record_hit(),
                    Some(false) => self.record_miss(),
                    None => {}
                }
                metrics::record_cache_lookup(outcome.as_str());
                metrics::record_cache_duration(outcome.as_str(), elapsed);
                event.outcome(outcome.as_str()).log();
            }
            Err(err) => {
                event.outcome("error").error(err).log();
            }
        }
        result
    }

    pub fn lookup_or_create(&self, key: &ResourceKey) -> Arc<Coordinator> {
        self.state.lookup_or_create(key)
    }

    pub fn is_still_active(&self, coordinator: &Coordinator) -> bool {
        self.state.is_still_active(coordinator)
    }

    pub fn clear(&self) {
        self.state.clear();
    }

    pub fn clear_matching(&self, host: Option<&Regex>, path: Option<&Regex>) -> usize {
        self.state.clear_matching(host, path)
    }

    pub fn clear_expires(&self) {
        self.state.clear_expires();
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.set_enabled(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    pub fn record_hit(&self) {
        self.state.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.state.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        self.state.stats()
    }

    pub fn items(&self, sort: ItemSort) -> Vec<CacheItem> {
        self.state.items(sort)
    }
}

impl CacheState {
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!(enabled, "response cache toggled");
        }
        if !enabled {
            self.clear();
        }
    }

    pub(crate) fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn serve_options(&self) -> ServeOptions {
        ServeOptions {
            enable_range: self.config.enable_range,
        }
    }

    pub(crate) fn admission_policy(&self) -> AdmissionPolicy<'_> {
        AdmissionPolicy {
            max_entry_size: self.config.max_entry_size,
            rewrite_vary_as_private: self.config.rewrite_vary_as_private,
            resolver: self.resolver.as_ref(),
        }
    }

    fn lookup_or_create(&self, key: &ResourceKey) -> Arc<Coordinator> {
        let coordinator = Arc::new(Coordinator::new(key.clone()));
        let pushed_out = {
            let mut lookup = self.lookup.lock();
            if let Some(existing) = lookup.get(key) {
                return existing.clone();
            }
            lookup.push(key.clone(), coordinator.clone())
        };
        if let Some((_, old)) = pushed_out {
            self.retire(&old);
        }
        coordinator
    }

    /// Promotes `coordinator` in the LRU on use. False once it has been
    /// evicted or retired.
    pub(crate) fn touch(&self, coordinator: &Coordinator) -> bool {
        self.index.lock().touch(coordinator)
    }

    pub(crate) fn is_still_active(&self, coordinator: &Coordinator) -> bool {
        self.lookup
            .lock()
            .peek(coordinator.key())
            .is_some_and(|c| std::ptr::eq(c.as_ref(), coordinator))
    }

    /// Drops a coordinator that no longer has a lookup slot.
    fn retire(&self, coordinator: &Arc<Coordinator>) {
        {
            let mut index = self.index.lock();
            if index.contains(coordinator) {
                index.remove(coordinator.key());
            }
        }
        if coordinator.is_cached() {
            metrics::record_cache_eviction();
        }
        coordinator.evict();
    }

    /// Marks `coordinator` as holding content, evicting least recently used
    /// resources over the entry limit and while the store is over budget.
    pub(crate) fn activate(&self, coordinator: &Arc<Coordinator>) {
        if !self.is_still_active(coordinator) {
            debug!(resource = %coordinator.key(), "coordinator retired during fill");
            coordinator.evict();
            return;
        }
        let mut evicted = Vec::new();
        {
            let mut index = self.index.lock();
            if let Some(old) = index.insert(coordinator) {
                old.evict();
                evicted.push(old);
            }
            for _ in 0..MAX_DISK_EVICTIONS {
                if self.store.bytes_in_use() < self.config.disk_size {
                    break;
                }
                let Some(old) = index.pop_lru() else {
                    break;
                };
                old.evict();
                evicted.push(old);
            }
        }
        for old in &evicted {
            debug!(resource = %old.key(), "evicted from cache");
            metrics::record_cache_eviction();
        }
        self.update_gauges();
    }

    fn update_gauges(&self) {
        let block_size = self.store.block_size().max(1) as u64;
        metrics::set_cache_blocks_in_use(self.store.bytes_in_use() / block_size);
    }

    fn clear(&self) {
        let drained = self.lookup_drain(|_| true);
        let cached = self.index.lock().clear();
        for coordinator in drained.iter().chain(cached.iter()) {
            coordinator.evict();
        }
        if !drained.is_empty() {
            info!(resources = drained.len(), "response cache cleared");
        }
        self.update_gauges();
    }

    fn clear_matching(&self, host: Option<&Regex>, path: Option<&Regex>) -> usize {
        let drained = self.lookup_drain(|key| {
            host.is_none_or(|re| re.is_match(&key.host))
                && path.is_none_or(|re| re.is_match(&key.path))
        });
        for coordinator in &drained {
            self.retire(coordinator);
        }
        debug!(resources = drained.len(), "cleared matching resources");
        self.update_gauges();
        drained.len()
    }

    fn lookup_drain(&self, matches: impl Fn(&ResourceKey) -> bool) -> Vec<Arc<Coordinator>> {
        let mut lookup = self.lookup.lock();
        let keys: Vec<ResourceKey> = lookup
            .iter()
            .filter(|(key, _)| matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter().filter_map(|key| lookup.pop(key)).collect()
    }

    fn clear_expires(&self) {
        let coordinators: Vec<Arc<Coordinator>> =
            self.lookup.lock().iter().map(|(_, c)| c.clone()).collect();
        for coordinator in coordinators {
            coordinator.clear_expires();
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            enabled: self.is_enabled(),
            entries: self.index.lock().len(),
            resources: self.lookup.lock().len(),
            max_entries: self.config.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_in_use: self.store.bytes_in_use(),
            disk_size: self.config.disk_size,
        }
    }

    fn items(&self, sort: ItemSort) -> Vec<CacheItem> {
        let mut items: Vec<CacheItem> = self
            .lookup
            .lock()
            .iter()
            .map(|(key, c)| CacheItem {
                host: key.host.clone(),
                path: key.path.clone(),
                cacheable: c.is_cacheable(),
                cached: c.is_cached(),
                hits: c.hits(),
                misses: c.misses(),
            })
            .collect();
        match sort {
            ItemSort::Hits => items.sort_by(|a, b| b.hits.cmp(&a.hits)),
            ItemSort::Misses => items.sort_by(|a, b| b.misses.cmp(&a.misses)),
        }
        items
    }
}

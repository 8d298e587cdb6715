//! Per-resource state machine: serve, revalidate or fill.
//!
//! A coordinator owns the published variant set of one resource and a
//! single-flight token. At most one request fills at a time; everyone else
//! is served from whatever set is currently published, or passes through.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use http::header::{IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::{Method, StatusCode};
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::CacheState;
use super::admission::CacheSkipReason;
use super::capture::{CaptureConfig, CaptureResponse, CaptureResult};
use super::clock::to_millis;
use super::entry::{CacheEntry, VarySet};
use super::key::ResourceKey;
use super::serve::{ServeResult, serve_entry};
use crate::metrics;
use crate::protocol::{CacheRequest, DispatchError, Handler, Response, set_header};

/// Time an uncacheable resource stays out of the cache before it is tried again.
pub const KILL_BACKOFF: Duration = Duration::from_secs(60);
const KILL_BACKOFF_MS: u64 = KILL_BACKOFF.as_millis() as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    PartialHit,
    NotModified,
    /// Stale entry confirmed by the handler with a 304.
    Revalidated,
    Filled,
    Miss,
    Bypass,
    /// Serving failed after the response was committed.
    Aborted,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::PartialHit => "partial_hit",
            CacheOutcome::NotModified => "not_modified",
            CacheOutcome::Revalidated => "revalidated",
            CacheOutcome::Filled => "filled",
            CacheOutcome::Miss => "miss",
            CacheOutcome::Bypass => "bypass",
            CacheOutcome::Aborted => "aborted",
        }
    }

    /// `Some(true)` for a hit, `Some(false)` for a miss, `None` when the
    /// cache was not consulted.
    pub fn tally(&self) -> Option<bool> {
        match self {
            CacheOutcome::Bypass => None,
            outcome => Some(outcome.is_hit()),
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(
            self,
            CacheOutcome::Hit
                | CacheOutcome::PartialHit
                | CacheOutcome::NotModified
                | CacheOutcome::Revalidated
        )
    }
}

#[derive(Debug)]
pub struct Coordinator {
    key: ResourceKey,
    entries: RwLock<Arc<VarySet>>,
    active_filler: AtomicU64,
    cacheable: AtomicBool,
    last_check: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Holds the fill token; released on drop.
struct FillGuard<'a> {
    coordinator: &'a Coordinator,
    token: u64,
}

impl Drop for FillGuard<'_> {
    fn drop(&mut self) {
        let _ = self.coordinator.active_filler.compare_exchange(
            self.token,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl Coordinator {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            entries: RwLock::new(Arc::new(VarySet::default())),
            active_filler: AtomicU64::new(0),
            cacheable: AtomicBool::new(true),
            last_check: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn entry_set(&self) -> Arc<VarySet> {
        self.entries.read().clone()
    }

    pub fn is_cached(&self) -> bool {
        !self.entries.read().is_empty()
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable.load(Ordering::Acquire)
    }

    pub fn is_filling(&self) -> bool {
        self.active_filler.load(Ordering::Acquire) != 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub(crate) fn record(&self, outcome: CacheOutcome) {
        let counter = match outcome.tally() {
            Some(true) => &self.hits,
            Some(false) => &self.misses,
            None => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Replaces the set only if it is still `current`.
    fn publish(&self, current: &Arc<VarySet>, next: Arc<VarySet>) -> bool {
        let mut slot = self.entries.write();
        if !Arc::ptr_eq(&slot, current) {
            return false;
        }
        *slot = next;
        true
    }

    pub(crate) fn insert_entry(&self, entry: Arc<CacheEntry>) {
        loop {
            let current = self.entry_set();
            let (next, displaced) = current.with_entry(entry.clone());
            if self.publish(&current, Arc::new(next)) {
                for old in displaced {
                    old.invalidate();
                }
                return;
            }
        }
    }

    /// Drops every stored variant. Blocks are freed once readers finish.
    pub fn evict(&self) {
        let old = std::mem::take(&mut *self.entries.write());
        old.invalidate_all();
    }

    pub fn clear_expires(&self) {
        self.entry_set().clear_expires();
    }

    pub(crate) fn is_cacheable_at(&self, now_ms: u64) -> bool {
        self.is_cacheable()
            || self
                .last_check
                .load(Ordering::Acquire)
                .saturating_add(KILL_BACKOFF_MS)
                < now_ms
    }

    pub(crate) fn kill(&self, now: SystemTime, reason: CacheSkipReason) {
        debug!(resource = %self.key, reason = reason.as_str(), "caching disabled for resource");
        metrics::record_cache_kill(reason.as_str());
        self.cacheable.store(false, Ordering::Release);
        self.last_check.store(to_millis(now), Ordering::Release);
    }

    /// Disconnects say nothing about the resource; it is retried on the
    /// next request.
    pub(crate) fn kill_disconnect(&self) {
        debug!(resource = %self.key, "fill abandoned on client disconnect");
        self.cacheable.store(false, Ordering::Release);
        self.last_check.store(0, Ordering::Release);
    }

    fn try_claim(&self, token: u64) -> Option<FillGuard<'_>> {
        self.active_filler
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FillGuard {
                coordinator: self,
                token,
            })
    }

    fn find_entry(self: &Arc<Self>, state: &CacheState, req: &CacheRequest) -> Option<Arc<CacheEntry>> {
        let set = self.entry_set();
        if set.is_empty() || !state.touch(self) {
            return None;
        }
        set.find(&req.headers)
    }

    pub(crate) fn handle(
        self: &Arc<Self>,
        state: &CacheState,
        req: &CacheRequest,
        resp: &mut dyn Response,
        next: &dyn Handler,
    ) -> Result<CacheOutcome, DispatchError> {
        let now = state.clock.now();
        let now_ms = to_millis(now);

        if !state.is_enabled() {
            next.call(req, resp)?;
            return Ok(CacheOutcome::Bypass);
        }
        if req.method != Method::GET && req.method != Method::HEAD {
            self.kill(now, CacheSkipReason::Method);
            next.call(req, resp)?;
            return Ok(CacheOutcome::Bypass);
        }
        if !self.is_cacheable_at(now_ms) {
            trace!(resource = %self.key, "resource in backoff, bypassing cache");
            next.call(req, resp)?;
            return Ok(CacheOutcome::Bypass);
        }

        let options = state.serve_options();
        let entry = self.find_entry(state, req);
        if let Some(entry) = &entry
            && entry.is_fresh(now)
        {
            match serve_entry(entry, req, resp, options, now)? {
                ServeResult::Served(outcome) => return Ok(outcome),
                ServeResult::Rejected(reason) => {
                    debug!(resource = %self.key, %reason, "range not served from cache");
                    next.call(req, resp)?;
                    return Ok(CacheOutcome::Miss);
                }
                ServeResult::Unavailable => {}
            }
        }

        if req.is_head() {
            next.call(req, resp)?;
            return Ok(CacheOutcome::Miss);
        }

        let Some(_fill) = self.try_claim(state.next_token()) else {
            if let Some(entry) = &entry
                && let ServeResult::Served(outcome) = serve_entry(entry, req, resp, options, now)?
            {
                return Ok(outcome);
            }
            trace!(resource = %self.key, "fill in progress, passing through");
            next.call(req, resp)?;
            return Ok(CacheOutcome::Miss);
        };

        if !self.is_cacheable_at(now_ms) {
            next.call(req, resp)?;
            return Ok(CacheOutcome::Bypass);
        }
        self.last_check.store(now_ms, Ordering::Release);

        let stale = entry.filter(|e| e.is_not_modified_eligible(&req.headers));
        self.fill(state, req, resp, next, stale, now)
    }

    fn fill(
        self: &Arc<Self>,
        state: &CacheState,
        req: &CacheRequest,
        resp: &mut dyn Response,
        next: &dyn Handler,
        stale: Option<Arc<CacheEntry>>,
        now: SystemTime,
    ) -> Result<CacheOutcome, DispatchError> {
        let conditional = stale.as_deref().map(|entry| conditional_request(req, entry));
        let forwarded = conditional.as_ref().unwrap_or(req);

        let config = CaptureConfig {
            request: req,
            now,
            store: state.store.clone(),
            policy: state.admission_policy(),
        };
        let mut capture = CaptureResponse::new(resp, config);
        let result = next.call(forwarded, &mut capture);

        if let Err(err) = result {
            drop(capture);
            if err.is_disconnect() {
                self.kill_disconnect();
            } else {
                self.kill(now, CacheSkipReason::HandlerError);
            }
            return Err(err);
        }

        if let Some(entry) = stale
            && capture.status() == StatusCode::NOT_MODIFIED
            && !capture.is_committed()
        {
            drop(capture);
            entry.set_expires_at(now + entry.refresh_window());
            trace!(resource = %self.key, "stale entry revalidated");
            resp.reset();
            return match serve_entry(&entry, req, resp, state.serve_options(), now)? {
                ServeResult::Served(CacheOutcome::Hit | CacheOutcome::PartialHit) => {
                    Ok(CacheOutcome::Revalidated)
                }
                ServeResult::Served(outcome) => Ok(outcome),
                ServeResult::Rejected(_) | ServeResult::Unavailable => {
                    next.call(req, resp)?;
                    Ok(CacheOutcome::Miss)
                }
            };
        }

        match capture.finish() {
            CaptureResult::Stored(plan, content) => {
                let entry = Arc::new(CacheEntry::from_plan(*plan, content));
                let size = entry.content_length();
                self.insert_entry(entry);
                self.cacheable.store(true, Ordering::Release);
                state.activate(self);
                metrics::record_cache_store();
                debug!(resource = %self.key, bytes = size, "response stored");
                Ok(CacheOutcome::Filled)
            }
            CaptureResult::Skipped(reason) => {
                if reason.kills() {
                    self.kill(now, reason);
                }
                if reason.drops_entries() {
                    self.evict();
                }
                Ok(CacheOutcome::Miss)
            }
        }
    }
}

/// The request forwarded when revalidating: carries the entry's validators.
fn conditional_request(req: &CacheRequest, entry: &CacheEntry) -> CacheRequest {
    let mut forwarded = req.clone();
    if let Some(etag) = entry.etag() {
        set_header(&mut forwarded.headers, IF_NONE_MATCH, etag);
    }
    if let Some(last_modified) = entry.last_modified() {
        set_header(&mut forwarded.headers, IF_MODIFIED_SINCE, last_modified);
    }
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::tests::entry_for;
    use http::HeaderMap;

    #[test]
    fn fill_token_is_exclusive_and_released_on_drop() {
        let coordinator = Coordinator::new(ResourceKey::new("h", "/"));
        let first = coordinator.try_claim(1).expect("first claim");
        assert!(coordinator.try_claim(2).is_none());
        assert!(coordinator.is_filling());
        drop(first);
        assert!(!coordinator.is_filling());
        assert!(coordinator.try_claim(3).is_some());
    }

    #[test]
    fn kill_starts_backoff() {
        let coordinator = Coordinator::new(ResourceKey::new("h", "/"));
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        coordinator.kill(start, CacheSkipReason::CacheControl);
        let start_ms = to_millis(start);
        assert!(!coordinator.is_cacheable_at(start_ms + 59_000));
        assert!(coordinator.is_cacheable_at(start_ms + 60_001));
    }

    #[test]
    fn backoff_ends_strictly_after_sixty_seconds() {
        let coordinator = Coordinator::new(ResourceKey::new("h", "/"));
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(5_000);
        coordinator.kill(start, CacheSkipReason::Method);
        let start_ms = to_millis(start);
        assert!(!coordinator.is_cacheable_at(start_ms + 60_000));
        assert!(coordinator.is_cacheable_at(start_ms + 60_001));
    }

    #[test]
    fn disconnect_kill_is_immediately_retryable() {
        let coordinator = Coordinator::new(ResourceKey::new("h", "/"));
        coordinator.kill_disconnect();
        assert!(!coordinator.is_cacheable());
        assert!(coordinator.is_cacheable_at(to_millis(SystemTime::now())));
    }

    #[test]
    fn insert_replaces_variant_and_invalidates_old() {
        let coordinator = Coordinator::new(ResourceKey::new("h", "/"));
        let first = entry_for(&[], &HeaderMap::new(), b"one");
        coordinator.insert_entry(first.clone());
        let second = entry_for(&[], &HeaderMap::new(), b"two");
        coordinator.insert_entry(second.clone());

        assert_eq!(coordinator.entry_set().len(), 1);
        assert!(!first.is_valid());
        assert!(second.is_valid());

        coordinator.evict();
        assert!(!coordinator.is_cached());
        assert!(!second.is_valid());
    }

    #[test]
    fn conditional_request_carries_validators() {
        let entry = entry_for(&[], &HeaderMap::new(), b"x");
        let req = CacheRequest::get("h", "/");
        let forwarded = conditional_request(&req, &entry);
        assert_eq!(forwarded.header_str(IF_NONE_MATCH), Some("\"v1\""));
        assert!(req.header_str(IF_NONE_MATCH).is_none());
    }

    #[test]
    fn outcome_hit_classification() {
        assert!(CacheOutcome::Revalidated.is_hit());
        assert!(CacheOutcome::NotModified.is_hit());
        assert!(!CacheOutcome::Filled.is_hit());
        assert!(!CacheOutcome::Bypass.is_hit());
        assert_eq!(CacheOutcome::Bypass.tally(), None);
        assert_eq!(CacheOutcome::Aborted.tally(), Some(false));
        assert_eq!(CacheOutcome::PartialHit.tally(), Some(true));
    }
}

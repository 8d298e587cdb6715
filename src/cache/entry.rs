use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use http::HeaderMap;

use super::clock::{from_millis, to_millis};
use super::content::{Content, ContentGuard, ContentKind};
use super::key::VaryKey;

/// Most variants kept per resource.
pub const MAX_VARY_ENTRIES: usize = 8;

/// A stored response: headers, validators, freshness and sealed body.
#[derive(Debug)]
pub struct CacheEntry {
    pub(crate) headers: HeaderMap,
    pub(crate) content_type: Option<String>,
    pub(crate) char_encoding: Option<String>,
    pub(crate) mime_type: Option<String>,
    pub(crate) etag: Option<String>,
    pub(crate) last_modified: Option<String>,
    pub(crate) content_length: u64,
    pub(crate) allow_range: bool,
    pub(crate) vary: VaryKey,
    pub(crate) vary_cookies: bool,
    pub(crate) max_age: Option<Duration>,
    pub(crate) s_maxage: Option<Duration>,
    pub(crate) has_explicit_expires: bool,
    pub(crate) expires_header: Option<String>,
    pub(crate) expires_at: AtomicU64,
    pub(crate) valid: AtomicBool,
    pub(crate) content: Content,
}

impl CacheEntry {
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn char_encoding(&self) -> Option<&str> {
        self.char_encoding.as_deref()
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn allow_range(&self) -> bool {
        self.allow_range && self.content.kind() == ContentKind::Bytes
    }

    pub fn vary_cookies(&self) -> bool {
        self.vary_cookies
    }

    pub fn vary_fingerprint(&self) -> u64 {
        self.vary.fingerprint()
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    pub fn s_maxage(&self) -> Option<Duration> {
        self.s_maxage
    }

    pub fn has_explicit_expires(&self) -> bool {
        self.has_explicit_expires
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn acquire(&self) -> Option<ContentGuard> {
        if !self.is_valid() {
            return None;
        }
        self.content.acquire()
    }

    pub fn expires_at(&self) -> SystemTime {
        from_millis(self.expires_at.load(Ordering::Acquire))
    }

    pub fn set_expires_at(&self, at: SystemTime) {
        self.expires_at.store(to_millis(at), Ordering::Release);
    }

    /// Forces revalidation on the next request.
    pub fn clear_expires(&self) {
        self.expires_at.store(0, Ordering::Release);
    }

    pub fn is_fresh(&self, now: SystemTime) -> bool {
        to_millis(now) < self.expires_at.load(Ordering::Acquire)
    }

    /// Freshness window used when a revalidation succeeds.
    pub(crate) fn refresh_window(&self) -> Duration {
        self.s_maxage
            .or(self.max_age)
            .unwrap_or(super::admission::INTERNAL_REVALIDATE)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Marks the entry unusable and drops its hold on the content.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        self.content.invalidate();
    }

    pub fn matches_vary(&self, req_headers: &HeaderMap) -> bool {
        self.vary.matches(req_headers)
    }

    /// Whether a conditional exchange can be used for this entry and request.
    pub fn is_not_modified_eligible(&self, req_headers: &HeaderMap) -> bool {
        (self.etag.is_some() || self.last_modified.is_some())
            && !self.has_explicit_expires
            && !req_headers.contains_key(http::header::RANGE)
            && !req_headers.contains_key(http::header::IF_RANGE)
            && self.is_valid()
            && self.content.is_live()
    }
}

/// Variants of one resource keyed by `Vary` fingerprint, newest first.
///
/// Sets are immutable once published; updates build a new set.
#[derive(Debug, Default, Clone)]
pub struct VarySet {
    entries: Vec<Arc<CacheEntry>>,
}

impl VarySet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CacheEntry>> {
        self.entries.iter()
    }

    /// Finds the variant for this request. Cookie-varying entries are never
    /// handed to requests that carry a cookie.
    pub fn find(&self, req_headers: &HeaderMap) -> Option<Arc<CacheEntry>> {
        let has_cookie = req_headers.contains_key(http::header::COOKIE);
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.matches_vary(req_headers))?;
        if !entry.is_valid() || (entry.vary_cookies && has_cookie) {
            return None;
        }
        Some(entry.clone())
    }

    /// Returns a new set with `entry` replacing the variant with the same
    /// fingerprint, or prepended. Displaced entries are returned.
    pub fn with_entry(&self, entry: Arc<CacheEntry>) -> (VarySet, Vec<Arc<CacheEntry>>) {
        let fingerprint = entry.vary_fingerprint();
        let mut displaced = Vec::new();
        let mut entries = Vec::with_capacity(self.entries.len() + 1);
        entries.push(entry);
        for existing in &self.entries {
            if existing.vary_fingerprint() == fingerprint {
                displaced.push(existing.clone());
            } else {
                entries.push(existing.clone());
            }
        }
        while entries.len() > MAX_VARY_ENTRIES {
            if let Some(oldest) = entries.pop() {
                displaced.push(oldest);
            }
        }
        (VarySet { entries }, displaced)
    }

    pub fn invalidate_all(&self) {
        for entry in &self.entries {
            entry.invalidate();
        }
    }

    pub fn clear_expires(&self) {
        for entry in &self.entries {
            entry.clear_expires();
        }
    }
}

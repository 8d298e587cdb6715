use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::time::SystemTime;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tracing::{trace, warn};

use super::admission::{Admission, AdmissionPolicy, CacheSkipReason, StorePlan, plan_cache_write};
use super::clock::to_millis;
use super::content::{Content, ContentError, ContentWriter};
use super::entry::CacheEntry;
use crate::protocol::{BodySink, CacheRequest, Response};
use crate::store::BlockStore;

pub(crate) struct CaptureConfig<'a> {
    pub request: &'a CacheRequest,
    pub now: SystemTime,
    pub store: Arc<dyn BlockStore>,
    pub policy: AdmissionPolicy<'a>,
}

enum CaptureState {
    /// Nothing committed yet.
    Pending,
    Capturing {
        plan: Box<StorePlan>,
        writer: ContentWriter,
    },
    Skipped(CacheSkipReason),
}

pub(crate) enum CaptureResult {
    Stored(Box<StorePlan>, Content),
    Skipped(CacheSkipReason),
}

/// Response wrapper that forwards everything to the client response and
/// copies the body into a content writer while the response stays
/// cacheable.
pub(crate) struct CaptureResponse<'a> {
    inner: &'a mut dyn Response,
    config: CaptureConfig<'a>,
    state: CaptureState,
}

impl<'a> CaptureResponse<'a> {
    pub(crate) fn new(inner: &'a mut dyn Response, config: CaptureConfig<'a>) -> Self {
        Self {
            inner,
            config,
            state: CaptureState::Pending,
        }
    }

    /// Runs admission once, when the response commits.
    fn begin(&mut self) {
        if !matches!(self.state, CaptureState::Pending) {
            return;
        }
        let status = self.inner.status();
        let admission = plan_cache_write(
            self.config.request,
            status,
            self.inner.headers_mut(),
            self.config.now,
            self.config.policy,
        );
        self.state = match admission {
            Admission::Store(plan) => CaptureState::Capturing {
                plan,
                writer: ContentWriter::new(self.config.store.clone()),
            },
            Admission::Skip(reason) => {
                trace!(
                    reason = reason.as_str(),
                    status = status.as_u16(),
                    path = %self.config.request.path,
                    "response not admitted to cache"
                );
                CaptureState::Skipped(reason)
            }
        };
    }

    fn tee(&mut self, write: impl FnOnce(&mut ContentWriter) -> Result<(), ContentError>) {
        let CaptureState::Capturing { writer, .. } = &mut self.state else {
            return;
        };
        let result = write(writer).map(|()| writer.len());
        let reason = match result {
            Ok(len) if len >= self.config.policy.max_entry_size => CacheSkipReason::TooLarge,
            Ok(_) => return,
            Err(err) => {
                warn!(error = %err, path = %self.config.request.path, "failed to capture response body");
                if matches!(err, ContentError::Store(_)) {
                    crate::metrics::record_cache_store_error();
                }
                CacheSkipReason::StoreFailure
            }
        };
        self.state = CaptureState::Skipped(reason);
    }

    pub(crate) fn finish(mut self) -> CaptureResult {
        self.begin();
        let state = std::mem::replace(
            &mut self.state,
            CaptureState::Skipped(CacheSkipReason::HandlerKilled),
        );
        match state {
            CaptureState::Pending => CaptureResult::Skipped(CacheSkipReason::Status),
            CaptureState::Skipped(reason) => CaptureResult::Skipped(reason),
            CaptureState::Capturing { plan, writer } => {
                if writer.is_empty() {
                    return CaptureResult::Skipped(CacheSkipReason::Empty);
                }
                if writer.len() >= self.config.policy.max_entry_size {
                    return CaptureResult::Skipped(CacheSkipReason::TooLarge);
                }
                match writer.seal() {
                    Ok(content) => CaptureResult::Stored(plan, content),
                    Err(err) => {
                        warn!(error = %err, "failed to seal captured body");
                        crate::metrics::record_cache_store_error();
                        CaptureResult::Skipped(CacheSkipReason::StoreFailure)
                    }
                }
            }
        }
    }
}

impl BodySink for CaptureResponse<'_> {
    fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        self.begin();
        self.inner.write_body(data)?;
        self.tee(|writer| writer.write_bytes(data));
        Ok(())
    }

    fn write_shared(&mut self, data: Bytes) -> io::Result<()> {
        self.begin();
        self.tee(|writer| writer.write_bytes(&data));
        self.inner.write_shared(data)
    }

    fn supports_zero_copy(&self) -> bool {
        self.inner.supports_zero_copy()
    }

    fn write_text(&mut self, text: &str) -> io::Result<()> {
        self.begin();
        self.inner.write_text(text)?;
        self.tee(|writer| writer.write_str(text));
        Ok(())
    }
}

impl Response for CaptureResponse<'_> {
    fn status(&self) -> StatusCode {
        self.inner.status()
    }

    fn set_status(&mut self, status: StatusCode) {
        self.inner.set_status(status);
    }

    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn is_committed(&self) -> bool {
        self.inner.is_committed()
    }

    fn reset(&mut self) {
        if self.inner.is_committed() {
            return;
        }
        self.inner.reset();
        self.state = CaptureState::Pending;
    }

    fn close_connection(&mut self) {
        self.inner.close_connection();
    }

    fn kill_caching(&mut self) {
        self.state = CaptureState::Skipped(CacheSkipReason::HandlerKilled);
        self.inner.kill_caching();
    }
}

impl CacheEntry {
    pub(crate) fn from_plan(plan: StorePlan, content: Content) -> Self {
        CacheEntry {
            headers: plan.headers,
            content_type: plan.content_type,
            char_encoding: plan.char_encoding,
            mime_type: plan.mime_type,
            etag: plan.etag,
            last_modified: plan.last_modified,
            content_length: content.len(),
            allow_range: plan.allow_range,
            vary: plan.vary,
            vary_cookies: plan.vary_cookies,
            max_age: plan.max_age,
            s_maxage: plan.s_maxage,
            has_explicit_expires: plan.has_explicit_expires,
            expires_header: plan.expires_header,
            expires_at: AtomicU64::new(to_millis(plan.expires_at)),
            valid: AtomicBool::new(true),
            content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::freshness::NoDefaultFreshness;
    use crate::protocol::BufferedResponse;
    use crate::store::MemoryBlockStore;
    use http::HeaderValue;
    use std::time::{Duration, UNIX_EPOCH};

    fn config<'a>(req: &'a CacheRequest, store: &Arc<MemoryBlockStore>, max: u64) -> CaptureConfig<'a> {
        CaptureConfig {
            request: req,
            now: UNIX_EPOCH + Duration::from_secs(1_000),
            store: store.clone(),
            policy: AdmissionPolicy {
                max_entry_size: max,
                rewrite_vary_as_private: false,
                resolver: &NoDefaultFreshness,
            },
        }
    }

    fn cacheable(resp: &mut dyn Response) {
        resp.headers_mut()
            .insert("cache-control", HeaderValue::from_static("max-age=60"));
    }

    #[test]
    fn tees_body_into_content() {
        let store = Arc::new(MemoryBlockStore::new(8));
        let req = CacheRequest::get("h", "/a");
        let mut client = BufferedResponse::new();
        let mut capture = CaptureResponse::new(&mut client, config(&req, &store, 1024));
        cacheable(&mut capture);
        capture.write_body(b"hello ").unwrap();
        capture.write_body(b"world").unwrap();

        let CaptureResult::Stored(plan, content) = capture.finish() else {
            panic!("expected stored result");
        };
        let entry = CacheEntry::from_plan(*plan, content);
        assert_eq!(entry.content_length(), 11);
        assert_eq!(client.body(), b"hello world");
        assert!(client.header("expires").is_some());
    }

    #[test]
    fn oversized_body_is_dropped_but_still_delivered() {
        let store = Arc::new(MemoryBlockStore::new(8));
        let req = CacheRequest::get("h", "/a");
        let mut client = BufferedResponse::new();
        let mut capture = CaptureResponse::new(&mut client, config(&req, &store, 16));
        cacheable(&mut capture);
        capture.write_body(&[1u8; 10]).unwrap();
        capture.write_body(&[2u8; 10]).unwrap();
        assert!(matches!(
            capture.finish(),
            CaptureResult::Skipped(CacheSkipReason::TooLarge)
        ));
        assert_eq!(client.body().len(), 20);
        assert_eq!(store.allocated_blocks(), 0);
    }

    #[test]
    fn empty_body_is_skipped() {
        let store = Arc::new(MemoryBlockStore::new(8));
        let req = CacheRequest::get("h", "/a");
        let mut client = BufferedResponse::new();
        let mut capture = CaptureResponse::new(&mut client, config(&req, &store, 1024));
        cacheable(&mut capture);
        assert!(matches!(
            capture.finish(),
            CaptureResult::Skipped(CacheSkipReason::Empty)
        ));
    }

    #[test]
    fn handler_kill_discards_capture() {
        let store = Arc::new(MemoryBlockStore::new(8));
        let req = CacheRequest::get("h", "/a");
        let mut client = BufferedResponse::new();
        let mut capture = CaptureResponse::new(&mut client, config(&req, &store, 1024));
        cacheable(&mut capture);
        capture.write_body(b"partial").unwrap();
        capture.kill_caching();
        capture.write_body(b" more").unwrap();
        assert!(matches!(
            capture.finish(),
            CaptureResult::Skipped(CacheSkipReason::HandlerKilled)
        ));
        assert_eq!(store.allocated_blocks(), 0);
        assert_eq!(client.body(), b"partial more");
    }

    #[test]
    fn non_ok_status_is_not_captured() {
        let store = Arc::new(MemoryBlockStore::new(8));
        let req = CacheRequest::get("h", "/a");
        let mut client = BufferedResponse::new();
        let mut capture = CaptureResponse::new(&mut client, config(&req, &store, 1024));
        cacheable(&mut capture);
        capture.set_status(StatusCode::NOT_FOUND);
        capture.write_body(b"missing").unwrap();
        assert!(matches!(
            capture.finish(),
            CaptureResult::Skipped(CacheSkipReason::Status)
        ));
        assert_eq!(store.allocated_blocks(), 0);
    }

    #[test]
    fn text_writes_capture_characters() {
        let store = Arc::new(MemoryBlockStore::new(8));
        let req = CacheRequest::get("h", "/a");
        let mut client = BufferedResponse::new();
        let mut capture = CaptureResponse::new(&mut client, config(&req, &store, 1024));
        cacheable(&mut capture);
        capture.write_text("grüße").unwrap();
        let CaptureResult::Stored(_, content) = capture.finish() else {
            panic!("expected stored result");
        };
        let guard = content.acquire().unwrap();
        assert_eq!(guard.read_text().unwrap(), "grüße");
    }
}

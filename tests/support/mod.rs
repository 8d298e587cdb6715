#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use bytes::Bytes;
use http::{HeaderValue, StatusCode};
use tempfile::TempDir;

use cachegate::cache::{CacheConfig, ManualClock, NoDefaultFreshness, ResponseCache};
use cachegate::protocol::{BufferedResponse, CacheRequest, DispatchError, Handler, Response};
use cachegate::store::{BlockId, BlockStore, MemoryBlockStore, StoreError};

pub struct TestDirs {
    _temp: TempDir,
    pub cache_dir: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let cache_dir = temp.path().join("cache");
        Ok(Self {
            _temp: temp,
            cache_dir,
        })
    }
}

pub fn start_time() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

pub fn config(max_entries: usize) -> CacheConfig {
    CacheConfig {
        max_entries,
        max_entry_size: 64 * 1024,
        disk_size: 16 * 1024 * 1024,
        ..CacheConfig::default()
    }
}

/// Cache over `store` driven by a manual clock.
pub fn cache_with_clock(
    config: CacheConfig,
    store: Arc<dyn BlockStore>,
) -> (ResponseCache, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start_time()));
    let cache = ResponseCache::with_parts(config, store, clock.clone(), Arc::new(NoDefaultFreshness))
        .expect("cache");
    (cache, clock)
}

pub fn memory_cache(max_entries: usize) -> (ResponseCache, Arc<MemoryBlockStore>, Arc<ManualClock>) {
    let store = Arc::new(MemoryBlockStore::new(512));
    let (cache, clock) = cache_with_clock(config(max_entries), store.clone());
    (cache, store, clock)
}

/// Runs one request through the cache and returns the client response.
pub fn fetch(
    cache: &ResponseCache,
    req: &CacheRequest,
    handler: &dyn Handler,
) -> (cachegate::CacheOutcome, BufferedResponse) {
    let mut resp = BufferedResponse::new();
    let outcome = cache.handle(req, &mut resp, handler).expect("dispatch");
    (outcome, resp)
}

/// Handler that answers with a fixed response and records what it saw.
pub struct ScriptedHandler {
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    body: Mutex<Vec<u8>>,
    delay: Option<Duration>,
    honor_validators: bool,
    kill: bool,
    calls: AtomicUsize,
    seen: Mutex<Vec<CacheRequest>>,
}

impl ScriptedHandler {
    pub fn ok(body: &[u8]) -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: Mutex::new(body.to_vec()),
            delay: None,
            honor_validators: false,
            kill: false,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answers 304 when the request's `If-None-Match` equals the `etag`
    /// header this handler sends.
    pub fn honoring_validators(mut self) -> Self {
        self.honor_validators = true;
        self
    }

    /// Signals the response to stop caching after writing the body.
    pub fn killing(mut self) -> Self {
        self.kill = true;
        self
    }

    pub fn set_body(&self, body: &[u8]) {
        *self.body.lock().unwrap() = body.to_vec();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CacheRequest> {
        self.seen.lock().unwrap().last().cloned()
    }

    fn etag(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("etag"))
            .map(|(_, value)| value.as_str())
    }
}

impl Handler for ScriptedHandler {
    fn call(&self, req: &CacheRequest, resp: &mut dyn Response) -> Result<(), DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(req.clone());
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if self.honor_validators
            && let Some(etag) = self.etag()
            && req.header_str("if-none-match") == Some(etag)
        {
            resp.set_status(StatusCode::NOT_MODIFIED);
            return Ok(());
        }
        resp.set_status(self.status);
        for (name, value) in &self.headers {
            resp.headers_mut()
                .append(*name, HeaderValue::from_str(value).expect("header value"));
        }
        let body = self.body.lock().unwrap().clone();
        resp.write_body(&body)?;
        if self.kill {
            resp.kill_caching();
        }
        Ok(())
    }
}

/// Memory store whose operations can be made to fail.
#[derive(Debug)]
pub struct FlakyStore {
    inner: MemoryBlockStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new(block_size: usize) -> Self {
        Self {
            inner: MemoryBlockStore::new(block_size),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn allocated_blocks(&self) -> usize {
        self.inner.allocated_blocks()
    }

    fn io_error() -> StoreError {
        StoreError::Io(std::io::Error::other("injected failure"))
    }
}

impl BlockStore for FlakyStore {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn allocate(&self) -> Result<BlockId, StoreError> {
        self.inner.allocate()
    }

    fn write(&self, block: BlockId, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::io_error());
        }
        self.inner.write(block, offset, data)
    }

    fn read(&self, block: BlockId, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::io_error());
        }
        self.inner.read(block, offset, buf)
    }

    fn deallocate(&self, block: BlockId) {
        self.inner.deallocate(block)
    }

    fn flush(&self, blocks: &[BlockId]) -> Result<(), StoreError> {
        self.inner.flush(blocks)
    }

    fn is_flushed(&self, block: BlockId) -> bool {
        self.inner.is_flushed(block)
    }

    fn read_shared(&self, _block: BlockId, _offset: usize, _len: usize) -> Option<Bytes> {
        None
    }

    fn bytes_in_use(&self) -> u64 {
        self.inner.bytes_in_use()
    }
}

//! Request and response abstractions the dispatch layer implements so the
//! cache can sit in front of a handler.

pub mod cache_control;
pub mod conditional;
pub mod range;

use std::io;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;

/// Failure while dispatching a request through the cache.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The client went away while the response was being written.
    #[error("client disconnected: {0}")]
    Disconnect(#[from] io::Error),
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, DispatchError::Disconnect(_))
    }
}

#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub method: Method,
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
}

impl CacheRequest {
    pub fn new(method: Method, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            host: host.into(),
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::GET, host, path)
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Appends a header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn header_str(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }
}

/// Destination for response body bytes.
pub trait BodySink {
    fn write_body(&mut self, data: &[u8]) -> io::Result<()>;

    /// Writes a shared buffer without copying when the sink supports it.
    fn write_shared(&mut self, data: Bytes) -> io::Result<()> {
        self.write_body(&data)
    }

    fn supports_zero_copy(&self) -> bool {
        false
    }

    /// Writes character content. Sinks with a text channel override this.
    fn write_text(&mut self, text: &str) -> io::Result<()> {
        self.write_body(text.as_bytes())
    }
}

/// Response under construction. Status and headers may change until the
/// first body write commits them.
pub trait Response: BodySink {
    fn status(&self) -> StatusCode;

    fn set_status(&mut self, status: StatusCode);

    fn headers(&self) -> &HeaderMap;

    fn headers_mut(&mut self) -> &mut HeaderMap;

    fn is_committed(&self) -> bool;

    /// Discards status, headers and buffered body. Has no effect once the
    /// response is committed.
    fn reset(&mut self);

    /// Asks the transport to drop the connection after this response.
    fn close_connection(&mut self);

    /// Signals that this response must not be stored.
    fn kill_caching(&mut self) {}
}

pub trait Handler: Send + Sync {
    fn call(&self, req: &CacheRequest, resp: &mut dyn Response) -> Result<(), DispatchError>;
}

impl<F> Handler for F
where
    F: Fn(&CacheRequest, &mut dyn Response) -> Result<(), DispatchError> + Send + Sync,
{
    fn call(&self, req: &CacheRequest, resp: &mut dyn Response) -> Result<(), DispatchError> {
        self(req, resp)
    }
}

/// In-memory response that records everything written to it.
#[derive(Debug)]
pub struct BufferedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    committed: bool,
    closed: bool,
    zero_copy: bool,
    shared_writes: usize,
    fail_after: Option<usize>,
}

impl Default for BufferedResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
            committed: false,
            closed: false,
            zero_copy: false,
            shared_writes: 0,
            fail_after: None,
        }
    }

    /// Accepts shared buffers on the zero-copy path.
    pub fn with_zero_copy(mut self) -> Self {
        self.zero_copy = true;
        self
    }

    /// Fails body writes with `BrokenPipe` once `limit` bytes were accepted.
    pub fn failing_after(mut self, limit: usize) -> Self {
        self.fail_after = Some(limit);
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn shared_writes(&self) -> usize {
        self.shared_writes
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn accept(&mut self, data: &[u8]) -> io::Result<()> {
        if let Some(limit) = self.fail_after
            && self.body.len() + data.len() > limit
        {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "client connection closed",
            ));
        }
        self.committed = true;
        self.body.extend_from_slice(data);
        Ok(())
    }
}

impl BodySink for BufferedResponse {
    fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        self.accept(data)
    }

    fn write_shared(&mut self, data: Bytes) -> io::Result<()> {
        self.shared_writes += 1;
        self.accept(&data)
    }

    fn supports_zero_copy(&self) -> bool {
        self.zero_copy
    }
}

impl Response for BufferedResponse {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn set_status(&mut self, status: StatusCode) {
        if !self.committed {
            self.status = status;
        }
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn is_committed(&self) -> bool {
        self.committed
    }

    fn reset(&mut self) {
        if self.committed {
            return;
        }
        self.status = StatusCode::OK;
        self.headers.clear();
        self.body.clear();
    }

    fn close_connection(&mut self) {
        self.closed = true;
    }
}

/// Sets a header from a string, skipping values that are not valid header
/// text.
pub(crate) fn set_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_response_commits_on_first_write() {
        let mut resp = BufferedResponse::new();
        resp.set_status(StatusCode::NOT_FOUND);
        resp.reset();
        assert_eq!(resp.status(), StatusCode::OK);

        resp.write_body(b"hello").unwrap();
        assert!(resp.is_committed());
        resp.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        resp.reset();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), b"hello");
    }

    #[test]
    fn failing_response_reports_broken_pipe() {
        let mut resp = BufferedResponse::new().failing_after(4);
        resp.write_body(b"abcd").unwrap();
        let err = resp.write_body(b"e").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn io_errors_map_to_disconnect() {
        fn handler() -> Result<(), DispatchError> {
            Err(io::Error::from(io::ErrorKind::ConnectionReset))?;
            Ok(())
        }
        assert!(handler().unwrap_err().is_disconnect());
    }

    #[test]
    fn request_builder_skips_invalid_headers() {
        let req = CacheRequest::get("example.com", "/a")
            .with_header("accept", "text/html")
            .with_header("bad header", "x");
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.header_str("accept"), Some("text/html"));
    }
}

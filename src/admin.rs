//! Management endpoint: Prometheus metrics plus cache administration.
//!
//! Speaks just enough HTTP/1.1 to answer one request per connection.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, ensure};
use regex::Regex;
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    time::timeout,
};
use tracing::{debug, info};

use crate::cache::{CacheItem, CacheStats, ItemSort, ResponseCache};
use crate::metrics;

const ADMIN_MAX_REQUEST_BYTES: usize = 8192;
const ADMIN_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Eq)]
struct AdminResponse {
    status: u16,
    content_type: String,
    body: Vec<u8>,
}

impl AdminResponse {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json".to_string(),
                body,
            },
            Err(err) => Self::text(500, &format!("encoding failed: {err}")),
        }
    }

    fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain".to_string(),
            body: body.as_bytes().to_vec(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    stats: CacheStats,
    items: Vec<CacheItem>,
}

#[derive(Debug, Serialize)]
struct ActionReport {
    action: &'static str,
    enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    cleared: Option<usize>,
}

pub async fn serve(addr: SocketAddr, cache: ResponseCache) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "admin endpoint listening");
    serve_listener(listener, cache).await
}

pub async fn serve_listener(listener: TcpListener, cache: ResponseCache) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let cache = cache.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(stream, &cache).await {
                debug!(error = %err, peer = %peer, "admin handler error");
            }
        });
    }
}

async fn handle_stream<S>(stream: S, cache: &ResponseCache) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    handle_stream_with_limits(stream, cache, ADMIN_READ_TIMEOUT, ADMIN_MAX_REQUEST_BYTES).await
}

async fn handle_stream_with_limits<S>(
    stream: S,
    cache: &ResponseCache,
    read_timeout: Duration,
    max_bytes: usize,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    let mut total_bytes = 0usize;
    let bytes = read_line_with_limits(
        &mut reader,
        &mut request_line,
        read_timeout,
        max_bytes,
        &mut total_bytes,
        "reading admin request line",
    )
    .await?;
    if bytes == 0 {
        return Ok(());
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    // Headers are read and ignored; requests carry no body.
    loop {
        let mut line = String::new();
        let n = read_line_with_limits(
            &mut reader,
            &mut line,
            read_timeout,
            max_bytes,
            &mut total_bytes,
            "reading admin request headers",
        )
        .await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let response = route(cache, &method, &target);
    reader
        .get_mut()
        .write_all(&build_response(&response))
        .await?;
    reader.get_mut().shutdown().await?;
    Ok(())
}

fn route(cache: &ResponseCache, method: &str, target: &str) -> AdminResponse {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let params: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    let param = |name: &str| {
        params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
    };

    match (method, path) {
        ("GET", "/metrics") => AdminResponse {
            status: 200,
            content_type: metrics::content_type(),
            body: metrics::gather(),
        },
        ("GET", "/cache/status") => {
            let sort = match param("sort") {
                Some("misses") => ItemSort::Misses,
                _ => ItemSort::Hits,
            };
            let report = StatusReport {
                stats: cache.stats(),
                items: cache.items(sort),
            };
            AdminResponse::json(200, &report)
        }
        ("POST", "/cache/enable") => {
            cache.set_enabled(true);
            action(cache, "enable", None)
        }
        ("POST", "/cache/disable") => {
            cache.set_enabled(false);
            action(cache, "disable", None)
        }
        ("POST", "/cache/clear") => {
            let host = param("host");
            let path = param("path");
            if host.is_none() && path.is_none() {
                cache.clear();
                return action(cache, "clear", None);
            }
            match compile_patterns(host, path) {
                Ok((host, path)) => {
                    let cleared = cache.clear_matching(host.as_ref(), path.as_ref());
                    info!(cleared, "cleared matching cache resources");
                    action(cache, "clear", Some(cleared))
                }
                Err(err) => AdminResponse::text(400, &format!("{err:#}")),
            }
        }
        ("POST", "/cache/clear-expires") => {
            cache.clear_expires();
            action(cache, "clear-expires", None)
        }
        (_, "/metrics" | "/cache/status" | "/cache/enable" | "/cache/disable")
        | (_, "/cache/clear" | "/cache/clear-expires") => {
            AdminResponse::text(405, "method not allowed")
        }
        _ => AdminResponse::text(404, "not found"),
    }
}

fn action(cache: &ResponseCache, name: &'static str, cleared: Option<usize>) -> AdminResponse {
    AdminResponse::json(
        200,
        &ActionReport {
            action: name,
            enabled: cache.is_enabled(),
            cleared,
        },
    )
}

fn compile_patterns(
    host: Option<&str>,
    path: Option<&str>,
) -> Result<(Option<Regex>, Option<Regex>)> {
    let compile = |value: Option<&str>, what: &str| {
        value
            .map(Regex::new)
            .transpose()
            .map_err(|err| anyhow!("invalid {what} pattern: {err}"))
    };
    Ok((compile(host, "host")?, compile(path, "path")?))
}

fn build_response(response: &AdminResponse) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: {}\r\nConnection: close\r\n\r\n",
        response.status,
        response.body.len(),
        response.content_type
    );
    let mut bytes = header.into_bytes();
    bytes.extend_from_slice(&response.body);
    bytes
}

async fn read_line_with_limits<R>(
    reader: &mut BufReader<R>,
    buf: &mut String,
    timeout_dur: Duration,
    max_bytes: usize,
    total: &mut usize,
    context: &str,
) -> Result<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    if max_bytes == 0 {
        anyhow::bail!("max_bytes must be greater than zero");
    }
    buf.clear();
    let mut collected = Vec::new();
    loop {
        let available = timeout(timeout_dur, reader.fill_buf())
            .await
            .map_err(|_| anyhow!("timed out {context}"))??;
        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            anyhow::bail!("connection closed while {context}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        let remaining = max_bytes
            .checked_sub(*total)
            .ok_or_else(|| anyhow!("admin request exceeded allowed size"))?;
        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("admin request length overflow"))?
            > remaining
        {
            anyhow::bail!("admin request exceeded allowed size");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string = String::from_utf8(collected)
        .map_err(|_| anyhow!("admin request contained invalid bytes"))?;
    let bytes = string.len();
    *total = total
        .checked_add(bytes)
        .ok_or_else(|| anyhow!("admin request length overflow"))?;
    ensure!(*total <= max_bytes, "admin request exceeded allowed size");
    *buf = string;
    Ok(bytes)
}

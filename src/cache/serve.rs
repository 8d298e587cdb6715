use std::time::SystemTime;

use http::header::{
    CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, EXPIRES, IF_RANGE,
    LAST_MODIFIED, RANGE,
};
use http::{HeaderValue, Method, StatusCode};
use tracing::{debug, warn};

use super::content::{ContentError, ContentGuard, ContentKind};
use super::coordinator::CacheOutcome;
use super::entry::CacheEntry;
use crate::protocol::range::{ByteRange, RangeRejection, RangeRequest, parse_range};
use crate::protocol::{CacheRequest, DispatchError, Response, conditional, set_header};

#[derive(Debug, Clone, Copy)]
pub(crate) struct ServeOptions {
    pub enable_range: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServeResult {
    Served(CacheOutcome),
    /// The request cannot be answered from this entry; regenerate it.
    Rejected(RangeRejection),
    /// The entry's content is gone. Nothing was written.
    Unavailable,
}

/// Answers a request from a stored entry: 304, full body or byte ranges.
pub(crate) fn serve_entry(
    entry: &CacheEntry,
    req: &CacheRequest,
    resp: &mut dyn Response,
    options: ServeOptions,
    now: SystemTime,
) -> Result<ServeResult, DispatchError> {
    let Some(guard) = entry.acquire() else {
        return Ok(ServeResult::Unavailable);
    };

    if entry.is_not_modified_eligible(&req.headers)
        && conditional::not_modified(&req.headers, entry.etag(), entry.last_modified())
    {
        write_not_modified(entry, resp, now);
        return Ok(ServeResult::Served(CacheOutcome::NotModified));
    }

    if req.method == Method::GET
        && let Some(range) = req.header_str(RANGE)
    {
        if !options.enable_range || !entry.allow_range() {
            return Ok(ServeResult::Rejected(RangeRejection::Unsatisfiable));
        }
        let if_range_matches = match req.header_str(IF_RANGE) {
            Some(validator) => entry.etag() == Some(validator.trim()),
            None => true,
        };
        if if_range_matches {
            match parse_range(range, entry.content_length()) {
                RangeRequest::Full => {}
                RangeRequest::Partial(ranges) => {
                    return serve_ranges(entry, &guard, &ranges, resp);
                }
                RangeRequest::Rejected(reason) => {
                    debug!(reason = %reason, range, "range not served from cache");
                    return Ok(ServeResult::Rejected(reason));
                }
            }
        }
    }

    serve_full(entry, &guard, req, resp)
}

fn write_entry_headers(entry: &CacheEntry, resp: &mut dyn Response) {
    let headers = resp.headers_mut();
    for (name, value) in entry.headers().iter() {
        headers.append(name.clone(), value.clone());
    }
    if let Some(expires) = entry.expires_header.as_deref() {
        set_header(headers, EXPIRES, expires);
    }
}

fn write_not_modified(entry: &CacheEntry, resp: &mut dyn Response, now: SystemTime) {
    resp.set_status(StatusCode::NOT_MODIFIED);
    let headers = resp.headers_mut();
    if let Some(etag) = entry.etag() {
        set_header(headers, ETAG, etag);
    }
    if let Some(last_modified) = entry.last_modified() {
        set_header(headers, LAST_MODIFIED, last_modified);
    }
    let expires_at = entry.expires_at();
    if expires_at > now {
        set_header(headers, EXPIRES, &httpdate::fmt_http_date(expires_at));
    }
    let directives = match (entry.max_age(), entry.s_maxage()) {
        (Some(m), Some(s)) => Some(format!("max-age={}, s-maxage={}", m.as_secs(), s.as_secs())),
        (Some(m), None) => Some(format!("max-age={}", m.as_secs())),
        (None, Some(s)) => Some(format!("s-maxage={}", s.as_secs())),
        (None, None) => None,
    };
    if let Some(directives) = directives {
        set_header(headers, CACHE_CONTROL, &directives);
    }
}

fn serve_full(
    entry: &CacheEntry,
    guard: &ContentGuard,
    req: &CacheRequest,
    resp: &mut dyn Response,
) -> Result<ServeResult, DispatchError> {
    resp.set_status(StatusCode::OK);
    write_entry_headers(entry, resp);
    if guard.kind() == ContentKind::Bytes {
        resp.headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(guard.len()));
    }
    if req.is_head() {
        return Ok(ServeResult::Served(CacheOutcome::Hit));
    }
    let written = match guard.kind() {
        ContentKind::Bytes => guard.read_full(resp),
        ContentKind::Chars => guard.write_text_to(resp),
    };
    match written {
        Ok(_) => Ok(ServeResult::Served(CacheOutcome::Hit)),
        Err(err) => read_failed(entry, resp, err),
    }
}

fn serve_ranges(
    entry: &CacheEntry,
    guard: &ContentGuard,
    ranges: &[ByteRange],
    resp: &mut dyn Response,
) -> Result<ServeResult, DispatchError> {
    let total = guard.len();
    resp.set_status(StatusCode::PARTIAL_CONTENT);
    write_entry_headers(entry, resp);

    if let [range] = ranges {
        let headers = resp.headers_mut();
        set_header(headers, CONTENT_RANGE, &range.content_range(total));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(range.len()));
        return match guard.read_range(resp, range.start, range.len()) {
            Ok(_) => Ok(ServeResult::Served(CacheOutcome::PartialHit)),
            Err(err) => read_failed(entry, resp, err),
        };
    }

    let boundary = format!("{:016x}", rand::random::<u64>());
    let mime = entry
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();
    let part_headers: Vec<String> = ranges
        .iter()
        .enumerate()
        .map(|(idx, range)| {
            let lead = if idx == 0 { "" } else { "\r\n" };
            format!(
                "{lead}--{boundary}\r\nContent-Type: {mime}\r\nContent-Range: {}\r\n\r\n",
                range.content_range(total)
            )
        })
        .collect();
    let trailer = format!("\r\n--{boundary}--\r\n");
    let body_len: u64 = part_headers.iter().map(|h| h.len() as u64).sum::<u64>()
        + ranges.iter().map(ByteRange::len).sum::<u64>()
        + trailer.len() as u64;

    let headers = resp.headers_mut();
    set_header(
        headers,
        CONTENT_TYPE,
        &format!("multipart/byteranges; boundary={boundary}"),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));

    for (range, part_header) in ranges.iter().zip(&part_headers) {
        resp.write_body(part_header.as_bytes())?;
        if let Err(err) = guard.read_range(resp, range.start, range.len()) {
            return read_failed(entry, resp, err);
        }
    }
    resp.write_body(trailer.as_bytes())?;
    Ok(ServeResult::Served(CacheOutcome::PartialHit))
}

/// Client write failures propagate as disconnects. Store failures retire the
/// entry; if nothing reached the client the request falls back to a miss,
/// otherwise the connection is dropped.
fn read_failed(
    entry: &CacheEntry,
    resp: &mut dyn Response,
    err: ContentError,
) -> Result<ServeResult, DispatchError> {
    let err = match err {
        ContentError::Sink(io) => return Err(DispatchError::Disconnect(io)),
        other => other,
    };
    warn!(error = %err, "cached content unreadable, invalidating entry");
    crate::metrics::record_cache_store_error();
    entry.invalidate();
    if resp.is_committed() {
        resp.close_connection();
        Ok(ServeResult::Served(CacheOutcome::Aborted))
    } else {
        resp.reset();
        Ok(ServeResult::Unavailable)
    }
}

use std::time::{Duration, SystemTime};

use http::header::{
    AUTHORIZATION, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, ETAG,
    EXPIRES, LAST_MODIFIED, TRANSFER_ENCODING, VARY,
};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tracing::{trace, warn};

use super::freshness::FreshnessResolver;
use super::key::{ResourceKey, VaryKey, VarySpec, parse_vary};
use crate::protocol::cache_control::{parse_cache_control, parse_expires};
use crate::protocol::{CacheRequest, set_header};

/// Smallest default lifetime applied from the per-path rules.
pub(crate) const MIN_EXPIRES: Duration = Duration::from_secs(5);
/// Revalidation window for validated responses without any lifetime.
pub(crate) const INTERNAL_REVALIDATE: Duration = Duration::from_secs(5);

const SET_COOKIE2: HeaderName = HeaderName::from_static("set-cookie2");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSkipReason {
    Status,
    Method,
    CacheControl,
    VaryUncacheable,
    /// `Vary: Cookie` answered to a request that carried a cookie.
    CookieRequest,
    ExpiresInPast,
    NoFreshness,
    TooLarge,
    Empty,
    HandlerKilled,
    HandlerError,
    StoreFailure,
}

impl CacheSkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSkipReason::Status => "status",
            CacheSkipReason::Method => "method",
            CacheSkipReason::CacheControl => "cache_control",
            CacheSkipReason::VaryUncacheable => "vary",
            CacheSkipReason::CookieRequest => "cookie_request",
            CacheSkipReason::ExpiresInPast => "expires_past",
            CacheSkipReason::NoFreshness => "no_freshness",
            CacheSkipReason::TooLarge => "too_large",
            CacheSkipReason::Empty => "empty",
            CacheSkipReason::HandlerKilled => "handler_killed",
            CacheSkipReason::HandlerError => "handler_error",
            CacheSkipReason::StoreFailure => "store_failure",
        }
    }

    /// Whether the resource should be marked uncacheable and enter backoff.
    pub fn kills(&self) -> bool {
        !matches!(
            self,
            CacheSkipReason::Status | CacheSkipReason::CookieRequest
        )
    }

    /// Whether the stored variants must be dropped as well.
    pub fn drops_entries(&self) -> bool {
        matches!(self, CacheSkipReason::ExpiresInPast)
    }
}

#[derive(Debug)]
pub(crate) enum Admission {
    Store(Box<StorePlan>),
    Skip(CacheSkipReason),
}

/// Everything about a response that is kept with its body.
#[derive(Debug, Clone)]
pub(crate) struct StorePlan {
    pub headers: HeaderMap,
    pub content_type: Option<String>,
    pub char_encoding: Option<String>,
    pub mime_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub declared_length: Option<u64>,
    pub allow_range: bool,
    pub vary: VaryKey,
    pub vary_cookies: bool,
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
    pub has_explicit_expires: bool,
    pub expires_header: Option<String>,
    pub expires_at: SystemTime,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct AdmissionPolicy<'a> {
    pub max_entry_size: u64,
    pub rewrite_vary_as_private: bool,
    pub resolver: &'a dyn FreshnessResolver,
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

fn charset_of(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

fn age_directives(max_age: Option<Duration>, s_maxage: Option<Duration>) -> Option<String> {
    match (max_age, s_maxage) {
        (Some(m), Some(s)) => Some(format!(
            "max-age={}, s-maxage={}",
            m.as_secs(),
            s.as_secs()
        )),
        (Some(m), None) => Some(format!("max-age={}", m.as_secs())),
        (None, Some(s)) => Some(format!("s-maxage={}", s.as_secs())),
        (None, None) => None,
    }
}

/// Decides whether a committed 200 response may be stored, and prepares the
/// client-facing headers accordingly. `headers` are the response headers as
/// they will be sent; they may gain `Cache-Control` or `Expires` values or
/// lose `Vary`.
pub(crate) fn plan_cache_write(
    request: &CacheRequest,
    status: StatusCode,
    headers: &mut HeaderMap,
    now: SystemTime,
    policy: AdmissionPolicy<'_>,
) -> Admission {
    if status != StatusCode::OK {
        return Admission::Skip(CacheSkipReason::Status);
    }

    let declared_length = header_string(headers, CONTENT_LENGTH).and_then(|v| v.parse().ok());
    if declared_length.is_some_and(|len: u64| len >= policy.max_entry_size) {
        return Admission::Skip(CacheSkipReason::TooLarge);
    }

    let cc = parse_cache_control(headers);
    if !cc.is_storable() {
        trace!(directives = ?cc.unknown, "cache-control forbids storing");
        return Admission::Skip(CacheSkipReason::CacheControl);
    }

    let mut is_private = false;
    let (vary_names, vary_cookies) = match parse_vary(headers) {
        VarySpec::Uncacheable => return Admission::Skip(CacheSkipReason::VaryUncacheable),
        VarySpec::None => (Vec::new(), false),
        VarySpec::Headers { names, cookie } => {
            if cookie && request.headers.contains_key(COOKIE) {
                return Admission::Skip(CacheSkipReason::CookieRequest);
            }
            if policy.rewrite_vary_as_private && !cookie {
                headers.remove(VARY);
                headers.append(CACHE_CONTROL, HeaderValue::from_static("private"));
                is_private = true;
            }
            (names, cookie)
        }
    };
    let vary = VaryKey::new(vary_names, &request.headers);

    let allow_range = !headers.contains_key(CONTENT_ENCODING);
    let etag = header_string(headers, ETAG);
    let last_modified = header_string(headers, LAST_MODIFIED);
    let has_validator = etag.is_some() || last_modified.is_some();

    let mut max_age = cc.max_age.filter(|d| !d.is_zero());
    let mut s_maxage = cc.s_maxage.filter(|d| !d.is_zero());
    let mut expires_at = cc.shared_max_age().filter(|d| !d.is_zero()).map(|d| now + d);

    let mut has_explicit_expires = false;
    let mut expires_header = None;
    match parse_expires(headers) {
        Ok(Some(at)) => {
            if at < now {
                return Admission::Skip(CacheSkipReason::ExpiresInPast);
            }
            has_explicit_expires = true;
            expires_header = header_string(headers, EXPIRES);
            expires_at = Some(at);
        }
        Ok(None) => {
            if let Some(at) = expires_at {
                set_header(headers, EXPIRES, &httpdate::fmt_http_date(at));
            }
        }
        Err(()) => {
            warn!(
                host = %request.host,
                path = %request.path,
                "ignoring unparseable Expires header"
            );
        }
    }

    if !has_explicit_expires && has_validator {
        if max_age.is_none() && s_maxage.is_none() {
            let key = ResourceKey::new(request.host.clone(), request.path.clone());
            let defaults = policy.resolver.resolve(&key);
            max_age = defaults.max_age.map(|age| age.max(MIN_EXPIRES));
            s_maxage = defaults.s_maxage;
            if let Some(directives) = age_directives(max_age, s_maxage) {
                set_header(headers, CACHE_CONTROL, &directives);
            }
        }
        if let Some(age) = max_age {
            set_header(headers, EXPIRES, &httpdate::fmt_http_date(now + age));
        }
        let window = s_maxage.or(max_age).unwrap_or(INTERNAL_REVALIDATE);
        expires_at = Some(now + window);
    }

    let expires_at = expires_at.unwrap_or(now);
    if !has_validator && expires_at < now + Duration::from_secs(1) {
        return Admission::Skip(CacheSkipReason::NoFreshness);
    }

    let mut stored = headers.clone();
    for name in [EXPIRES, http::header::SET_COOKIE, SET_COOKIE2, CONTENT_LENGTH, TRANSFER_ENCODING] {
        stored.remove(name);
    }

    if request.headers.contains_key(AUTHORIZATION) && !is_private {
        headers.append(CACHE_CONTROL, HeaderValue::from_static("private"));
    }

    let content_type = header_string(headers, CONTENT_TYPE);
    let char_encoding = content_type.as_deref().and_then(charset_of);
    let mime_type = content_type
        .as_deref()
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string());

    Admission::Store(Box::new(StorePlan {
        headers: stored,
        content_type,
        char_encoding,
        mime_type,
        etag,
        last_modified,
        declared_length,
        allow_range,
        vary,
        vary_cookies,
        max_age,
        s_maxage,
        has_explicit_expires,
        expires_header,
        expires_at,
    }))
}

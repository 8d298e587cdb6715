use std::fmt;

use http::{HeaderMap, HeaderName};

/// Upper bound on header names honored in a single `Vary`.
pub(crate) const MAX_VARY_HEADERS: usize = 8;

/// Identity of a cacheable resource: virtual host plus path, query excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub host: String,
    pub path: String,
}

impl ResourceKey {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.path)
    }
}

/// Outcome of reading a response's `Vary` headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VarySpec {
    None,
    Headers { names: Vec<HeaderName>, cookie: bool },
    /// `Vary: *` or more names than we track.
    Uncacheable,
}

pub(crate) fn parse_vary(resp_headers: &HeaderMap) -> VarySpec {
    let mut names: Vec<HeaderName> = Vec::new();
    let mut cookie = false;
    let mut seen = false;
    for value in resp_headers.get_all(http::header::VARY) {
        seen = true;
        let Ok(s) = value.to_str() else {
            return VarySpec::Uncacheable;
        };
        for name in s.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if name == "*" {
                return VarySpec::Uncacheable;
            }
            let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
                return VarySpec::Uncacheable;
            };
            if header == http::header::COOKIE {
                cookie = true;
            }
            if !names.contains(&header) {
                names.push(header);
            }
        }
    }
    if !seen || names.is_empty() {
        return VarySpec::None;
    }
    if names.len() > MAX_VARY_HEADERS {
        return VarySpec::Uncacheable;
    }
    VarySpec::Headers { names, cookie }
}

/// Request headers a stored response varies on, plus their fingerprint for
/// the request that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct VaryKey {
    names: Vec<HeaderName>,
    fingerprint: u64,
}

impl VaryKey {
    pub(crate) fn new(names: Vec<HeaderName>, req_headers: &HeaderMap) -> Self {
        let fingerprint = fingerprint(&names, req_headers);
        Self { names, fingerprint }
    }

    pub(crate) fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub(crate) fn names(&self) -> &[HeaderName] {
        &self.names
    }

    pub(crate) fn matches(&self, req_headers: &HeaderMap) -> bool {
        fingerprint(&self.names, req_headers) == self.fingerprint
    }
}

/// 64-bit digest of the request's values for `names`. A missing header
/// hashes differently from an empty one.
pub(crate) fn fingerprint(names: &[HeaderName], req_headers: &HeaderMap) -> u64 {
    if names.is_empty() {
        return 0;
    }
    let mut hasher = blake3::Hasher::new();
    for name in names {
        hasher.update(name.as_str().as_bytes());
        hasher.update(&[0]);
        let mut present = false;
        for value in req_headers.get_all(name) {
            present = true;
            hasher.update(&[1]);
            hasher.update(value.as_bytes());
        }
        let marker: u8 = if present { 2 } else { 3 };
        hasher.update(&[marker]);
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

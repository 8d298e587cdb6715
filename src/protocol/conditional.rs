use http::HeaderMap;
use http::header::{IF_MODIFIED_SINCE, IF_NONE_MATCH};

/// Decides whether a conditional request can be answered with 304 given the
/// validators of a stored response.
///
/// `If-None-Match` takes precedence: when present, only the entity tag is
/// consulted. Otherwise `If-Modified-Since` matches when the stored
/// `Last-Modified` starts with the request's date.
pub fn not_modified(
    request: &HeaderMap,
    etag: Option<&str>,
    last_modified: Option<&str>,
) -> bool {
    if let Some(value) = request.get(IF_NONE_MATCH) {
        let Ok(value) = value.to_str() else {
            return false;
        };
        let Some(etag) = etag else {
            return false;
        };
        return strip_at(value, &[';']) == etag.trim();
    }

    if let Some(value) = request.get(IF_MODIFIED_SINCE) {
        let Ok(value) = value.to_str() else {
            return false;
        };
        let Some(last_modified) = last_modified else {
            return false;
        };
        let since = strip_at(value, &[';', '+']);
        return !since.is_empty() && last_modified.trim().starts_with(since);
    }

    false
}

pub fn has_conditions(request: &HeaderMap) -> bool {
    request.contains_key(IF_NONE_MATCH) || request.contains_key(IF_MODIFIED_SINCE)
}

fn strip_at<'a>(value: &'a str, separators: &[char]) -> &'a str {
    let end = value.find(separators).unwrap_or(value.len());
    value[..end].trim()
}

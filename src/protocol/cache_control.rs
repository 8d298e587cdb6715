use http::HeaderMap;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub public: bool,
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
    pub must_revalidate: bool,
    pub proxy_revalidate: bool,
    /// A `max-age` or `s-maxage` with a negative or unparseable value.
    pub invalid_age: bool,
    /// Directives this cache does not interpret.
    pub unknown: Vec<String>,
}

impl CacheControl {
    /// True when the response carries nothing beyond `public`, `max-age`
    /// and `s-maxage`. Anything else makes the response uncacheable here.
    pub fn is_storable(&self) -> bool {
        !(self.private
            || self.no_cache
            || self.no_store
            || self.must_revalidate
            || self.proxy_revalidate
            || self.invalid_age
            || !self.unknown.is_empty())
    }

    /// Shared-cache lifetime: `s-maxage` wins over `max-age`.
    pub fn shared_max_age(&self) -> Option<Duration> {
        self.s_maxage.or(self.max_age)
    }
}

fn parse_age(value: &str) -> Option<Duration> {
    let value = value.trim().trim_matches('"');
    value.parse::<u64>().ok().map(Duration::from_secs)
}

pub fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();

    for value in headers.get_all(http::header::CACHE_CONTROL) {
        let Ok(s) = value.to_str() else {
            cc.unknown.push(String::from_utf8_lossy(value.as_bytes()).into_owned());
            continue;
        };
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, arg) = match part.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg)),
                None => (part, None),
            };
            if name.eq_ignore_ascii_case("public") {
                cc.public = true;
            } else if name.eq_ignore_ascii_case("private") {
                cc.private = true;
            } else if name.eq_ignore_ascii_case("no-cache") {
                cc.no_cache = true;
            } else if name.eq_ignore_ascii_case("no-store") {
                cc.no_store = true;
            } else if name.eq_ignore_ascii_case("must-revalidate") {
                cc.must_revalidate = true;
            } else if name.eq_ignore_ascii_case("proxy-revalidate") {
                cc.proxy_revalidate = true;
            } else if name.eq_ignore_ascii_case("max-age") {
                match arg.and_then(parse_age) {
                    Some(age) => cc.max_age = Some(age),
                    None => cc.invalid_age = true,
                }
            } else if name.eq_ignore_ascii_case("s-maxage") {
                match arg.and_then(parse_age) {
                    Some(age) => cc.s_maxage = Some(age),
                    None => cc.invalid_age = true,
                }
            } else {
                cc.unknown.push(part.to_ascii_lowercase());
            }
        }
    }
    cc
}

pub fn is_private(headers: &HeaderMap) -> bool {
    parse_cache_control(headers).private
}

/// Parses an `Expires` header. Returns `Err(())` when the header is present
/// but not a valid HTTP date.
#[allow(clippy::result_unit_err)]
pub fn parse_expires(headers: &HeaderMap) -> Result<Option<SystemTime>, ()> {
    let Some(value) = headers.get(http::header::EXPIRES) else {
        return Ok(None);
    };
    let text = value.to_str().map_err(|_| ())?;
    httpdate::parse_http_date(text.trim())
        .map(Some)
        .map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CACHE_CONTROL, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_parse_cache_control() {
        let cc = parse_cache_control(&headers("public, max-age=3600"));
        assert!(cc.public);
        assert_eq!(cc.max_age, Some(Duration::from_secs(3600)));
        assert!(!cc.private);
        assert!(cc.is_storable());
    }

    #[test]
    fn s_maxage_wins_over_max_age() {
        let cc = parse_cache_control(&headers("max-age=10, s-maxage=120"));
        assert_eq!(cc.shared_max_age(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn revalidate_directives_are_not_storable() {
        assert!(!parse_cache_control(&headers("max-age=60, must-revalidate")).is_storable());
        assert!(!parse_cache_control(&headers("proxy-revalidate")).is_storable());
    }

    #[test]
    fn private_and_no_store_are_not_storable() {
        assert!(!parse_cache_control(&headers("private, max-age=60")).is_storable());
        assert!(!parse_cache_control(&headers("no-store")).is_storable());
        assert!(!parse_cache_control(&headers("no-cache")).is_storable());
        assert!(is_private(&headers("private")));
    }

    #[test]
    fn negative_age_is_not_storable() {
        let cc = parse_cache_control(&headers("max-age=-1"));
        assert!(cc.invalid_age);
        assert!(!cc.is_storable());
    }

    #[test]
    fn unknown_directive_is_not_storable() {
        let cc = parse_cache_control(&headers("public, immutable"));
        assert_eq!(cc.unknown, vec!["immutable".to_string()]);
        assert!(!cc.is_storable());
    }

    #[test]
    fn missing_header_is_storable() {
        let cc = parse_cache_control(&HeaderMap::new());
        assert_eq!(cc, CacheControl::default());
        assert!(cc.is_storable());
    }

    #[test]
    fn parses_expires_dates() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_expires(&headers), Ok(None));
        headers.insert(
            http::header::EXPIRES,
            HeaderValue::from_static("Thu, 01 Jan 1970 00:00:10 GMT"),
        );
        let parsed = parse_expires(&headers).unwrap().unwrap();
        assert_eq!(
            parsed,
            SystemTime::UNIX_EPOCH + Duration::from_secs(10)
        );
        headers.insert(http::header::EXPIRES, HeaderValue::from_static("0"));
        assert!(parse_expires(&headers).is_err());
    }
}

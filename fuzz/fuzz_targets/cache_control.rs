#![no_main]

use http::{HeaderMap, HeaderValue, header};
use libfuzzer_sys::fuzz_target;

use cachegate::protocol::cache_control::{parse_cache_control, parse_expires};

fuzz_target!(|data: &[u8]| {
    let Ok(value) = HeaderValue::from_bytes(data) else {
        return;
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, value.clone());
    headers.insert(header::EXPIRES, value);

    let _ = parse_cache_control(&headers).is_storable();
    let _ = parse_expires(&headers);
});

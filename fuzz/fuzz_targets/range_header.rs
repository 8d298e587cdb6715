#![no_main]

use libfuzzer_sys::fuzz_target;

use cachegate::protocol::range::{RangeRequest, parse_range};

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    let length = u16::from_le_bytes([data[0], data[1]]) as u64;
    let header = String::from_utf8_lossy(&data[2..]);

    if let RangeRequest::Partial(ranges) = parse_range(header.as_ref(), length) {
        let mut total = 0u64;
        for range in &ranges {
            assert!(range.start <= range.end);
            assert!(range.end < length);
            total += range.len();
        }
        assert!(total <= length * 2);
    }
});

//! `Range: bytes=...` parsing against a known body length.

use std::fmt;

/// Inclusive byte range within a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

#[allow(clippy::len_without_is_empty)]
impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRejection {
    Malformed,
    Unsatisfiable,
    /// More bytes requested than twice the body length.
    Excessive,
}

impl fmt::Display for RangeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RangeRejection::Malformed => "malformed",
            RangeRejection::Unsatisfiable => "unsatisfiable",
            RangeRejection::Excessive => "excessive",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeRequest {
    /// The range covers the whole body; serve it as a normal response.
    Full,
    Partial(Vec<ByteRange>),
    Rejected(RangeRejection),
}

pub fn parse_range(header: &str, length: u64) -> RangeRequest {
    match parse_specs(header, length) {
        Ok(RangeRequest::Partial(ranges)) => {
            let total = ranges
                .iter()
                .fold(0u64, |acc, range| acc.saturating_add(range.len()));
            if total > length.saturating_mul(2) {
                RangeRequest::Rejected(RangeRejection::Excessive)
            } else {
                RangeRequest::Partial(ranges)
            }
        }
        Ok(other) => other,
        Err(rejection) => RangeRequest::Rejected(rejection),
    }
}

fn parse_specs(header: &str, length: u64) -> Result<RangeRequest, RangeRejection> {
    let header = header.trim();
    let specs = header
        .get(..6)
        .filter(|unit| unit.eq_ignore_ascii_case("bytes="))
        .map(|_| &header[6..])
        .ok_or(RangeRejection::Malformed)?;

    let specs: Vec<&str> = specs.split(',').map(str::trim).collect();
    if specs.iter().any(|spec| spec.is_empty()) {
        return Err(RangeRejection::Malformed);
    }

    let mut ranges = Vec::with_capacity(specs.len());
    for spec in &specs {
        let (first, last) = spec.split_once('-').ok_or(RangeRejection::Malformed)?;
        let (first, last) = (first.trim(), last.trim());
        let range = match (first.is_empty(), last.is_empty()) {
            (true, true) => return Err(RangeRejection::Malformed),
            (true, false) => {
                let suffix = parse_offset(last)?;
                if suffix == 0 || length == 0 {
                    return Err(RangeRejection::Unsatisfiable);
                }
                ByteRange {
                    start: length.saturating_sub(suffix),
                    end: length - 1,
                }
            }
            (false, true) => {
                let start = parse_offset(first)?;
                if start == 0 && specs.len() == 1 {
                    return Ok(RangeRequest::Full);
                }
                if start >= length {
                    return Err(RangeRejection::Unsatisfiable);
                }
                ByteRange {
                    start,
                    end: length - 1,
                }
            }
            (false, false) => {
                let start = parse_offset(first)?;
                let end = parse_offset(last)?;
                if end < start {
                    return Err(RangeRejection::Malformed);
                }
                if end >= length {
                    return Err(RangeRejection::Unsatisfiable);
                }
                ByteRange { start, end }
            }
        };
        ranges.push(range);
    }
    Ok(RangeRequest::Partial(ranges))
}

fn parse_offset(value: &str) -> Result<u64, RangeRejection> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeRejection::Malformed);
    }
    value.parse().map_err(|_| RangeRejection::Malformed)
}

//! Parsing and validation of the `Range` request header.
//!
//! Parsing is deliberately lenient and kept separate from sanity
//! validation: the parser only turns header text into raw offsets, and
//! [`plan`] then checks those offsets against the resource length. An
//! inclusive end equal to the resource length is tolerated by clamping it
//! back one byte, since some clients send an exclusive end position.

use std::fmt;

/// An inclusive span of a resource's bytes, zero-indexed.
///
/// Invariant once validated: `start <= end < length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        ByteRange { start, end }
    }

    /// Number of bytes covered by the span. A validated span always
    /// covers at least one byte.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Why a `Range` header was rejected. Both variants resolve to 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// The header text did not parse as a byte-range set.
    Malformed,
    /// A parsed span falls outside `0..length` or runs backwards.
    OutOfBounds,
}

/// The validated range set for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RangePlan {
    pub ranges: Vec<ByteRange>,
    pub is_range_request: bool,
}

impl RangePlan {
    pub fn is_multipart(&self) -> bool {
        self.ranges.len() > 1
    }
}

/// A raw span as parsed from the header, before sanity validation.
/// Offsets are signed so nonsense input survives until the validation
/// step that maps it to a 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RawRange {
    start: i64,
    end: i64,
}

/// Parse and validate a `Range` header against the resource length.
///
/// An absent or empty header yields the implicit full span with
/// `is_range_request = false`. Ranges are kept exactly as the client
/// ordered them: no merging, reordering, or deduplication of
/// overlapping or out-of-order spans.
pub(crate) fn plan(header: Option<&str>, length: u64) -> Result<RangePlan, RangeError> {
    let header = header.map(str::trim).filter(|h| !h.is_empty());

    let Some(header) = header else {
        let ranges = if length > 0 {
            vec![ByteRange::new(0, length - 1)]
        } else {
            Vec::new()
        };
        return Ok(RangePlan { ranges, is_range_request: false });
    };

    let raw = parse(header, length)?;
    let ranges = validate(&raw, length)?;
    Ok(RangePlan { ranges, is_range_request: true })
}

/// Turn header text into raw spans. The `bytes=` prefix is stripped if
/// present; each comma-separated segment is `start-end`, `start-`, or
/// `-suffix`.
fn parse(header: &str, length: u64) -> Result<Vec<RawRange>, RangeError> {
    let spec = header.strip_prefix("bytes=").unwrap_or(header);

    // sanity validation works in i64 space; an oversized resource is
    // rejected with 413 before validation ever runs
    let last = length.min(i64::MAX as u64) as i64 - 1;

    let mut ranges = Vec::new();
    for segment in spec.split(',') {
        let segment = segment.trim();
        let Some((start_digits, end_digits)) = segment.split_once('-') else {
            return Err(RangeError::Malformed);
        };

        let range = match (start_digits.is_empty(), end_digits.is_empty()) {
            // "start-end"
            (false, false) => RawRange {
                start: parse_offset(start_digits)?,
                end: parse_offset(end_digits)?,
            },
            // "start-": from start to EOF
            (false, true) => RawRange {
                start: parse_offset(start_digits)?,
                end: last,
            },
            // "-suffix": the final N bytes
            (true, false) => {
                let suffix = parse_offset(end_digits)?;
                RawRange {
                    start: (last + 1).saturating_sub(suffix).max(0),
                    end: last,
                }
            }
            (true, true) => return Err(RangeError::Malformed),
        };

        ranges.push(range);
    }

    Ok(ranges)
}

fn parse_offset(digits: &str) -> Result<i64, RangeError> {
    digits.trim().parse().map_err(|_| RangeError::Malformed)
}

/// Check raw spans against the resource length, clamping an inclusive
/// end equal to `length` back by one byte.
fn validate(raw: &[RawRange], length: u64) -> Result<Vec<ByteRange>, RangeError> {
    let length = length.min(i64::MAX as u64) as i64;

    raw.iter()
        .map(|range| {
            let mut end = range.end;
            if end == length {
                end -= 1;
            }
            if range.start < 0 || end < range.start || end > length - 1 {
                return Err(RangeError::OutOfBounds);
            }
            Ok(ByteRange::new(range.start as u64, end as u64))
        })
        .collect()
}

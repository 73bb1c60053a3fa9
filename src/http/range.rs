//! Byte ranges and `Range` header handling.
//!
//! [`ByteRange`] is a 64-bit `[location, location + length)` interval. Large
//! resources are the norm for a download server, so all arithmetic is done in
//! `u64` regardless of the platform word size.
//!
//! [`RequestRangeSet`] is what a connection builds from a `Range` header once
//! the resource length is known. It owns the multipart boundary and the cursor
//! used while the parts are streamed.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A half-open interval of bytes within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ByteRange {
    /// Offset of the first byte.
    pub location: u64,
    /// Number of bytes.
    pub length: u64,
}

impl ByteRange {
    pub fn new(location: u64, length: u64) -> Self {
        Self { location, length }
    }

    /// One past the last byte. Callers must know `location + length` fits;
    /// use [`ByteRange::checked_max_exclusive`] otherwise.
    pub fn max_exclusive(&self) -> u64 {
        self.location + self.length
    }

    pub fn checked_max_exclusive(&self) -> Option<u64> {
        self.location.checked_add(self.length)
    }

    /// Offset of the last byte, `None` for an empty range.
    pub fn last_byte(&self) -> Option<u64> {
        if self.length == 0 {
            None
        } else {
            Some(self.location + self.length - 1)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn contains(&self, point: u64) -> bool {
        // Wrapping keeps points below `location` out without a second compare.
        point.wrapping_sub(self.location) < self.length
    }

    /// Smallest range covering both. The result is always well formed, even
    /// when the two ranges are disjoint; callers decide whether that is useful.
    pub fn union(&self, other: &ByteRange) -> ByteRange {
        let start = self.location.min(other.location);
        let end = self.max_exclusive().max(other.max_exclusive());
        ByteRange::new(start, end - start)
    }

    /// Overlap of both ranges, zero length when they are disjoint.
    pub fn intersection(&self, other: &ByteRange) -> ByteRange {
        let start = self.location.max(other.location);
        let end = self.max_exclusive().min(other.max_exclusive());
        if end <= start {
            ByteRange::new(start.min(end), 0)
        } else {
            ByteRange::new(start, end - start)
        }
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        !self.intersection(other).is_empty()
    }

    /// `Content-Range` value for this range within a resource of `total` bytes.
    pub fn content_range(&self, total: u64) -> String {
        match self.last_byte() {
            Some(last) => format!("bytes {}-{}/{}", self.location, last, total),
            None => format!("bytes */{}", total),
        }
    }
}

impl PartialOrd for ByteRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByteRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.location
            .cmp(&other.location)
            .then(self.length.cmp(&other.length))
    }
}

/// Canonical `location-lastByte` form. An empty range prints as `location-`.
impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_byte() {
            Some(last) => write!(f, "{}-{}", self.location, last),
            None => write!(f, "{}-", self.location),
        }
    }
}

impl FromStr for ByteRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s.trim().split_once('-').ok_or(RangeError::Malformed)?;
        let location = parse_u64(start)?;
        if end.is_empty() {
            return Ok(ByteRange::new(location, 0));
        }
        let last = parse_u64(end)?;
        if last < location {
            return Err(RangeError::Malformed);
        }
        let length = (last - location)
            .checked_add(1)
            .ok_or(RangeError::Malformed)?;
        let range = ByteRange::new(location, length);
        range.checked_max_exclusive().ok_or(RangeError::Malformed)?;
        Ok(range)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// The header does not follow the `bytes=` grammar.
    Malformed,
    /// Some range lies entirely outside the resource.
    Unsatisfiable,
    /// Two requested ranges share bytes.
    Overlapping,
}

fn parse_u64(s: &str) -> Result<u64, RangeError> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::Malformed);
    }
    s.parse().map_err(|_| RangeError::Malformed)
}

/// Parses a `Range` header value against a resource of `resource_length` bytes.
///
/// Supports `bytes=a-b`, `bytes=a-` and `bytes=-n`, comma separated. Ranges are
/// clipped to the resource. If any single range cannot be satisfied the whole
/// header is rejected.
pub fn parse_range_header(value: &str, resource_length: u64) -> Result<Vec<ByteRange>, RangeError> {
    let (unit, specs) = value.trim().split_once('=').ok_or(RangeError::Malformed)?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Err(RangeError::Malformed);
    }

    let mut ranges: Vec<ByteRange> = Vec::new();

    for spec in specs.split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            // Tolerate "bytes=0-1,,5-6" the way most servers do.
            continue;
        }

        let (start, end) = spec.split_once('-').ok_or(RangeError::Malformed)?;

        let range = if start.trim().is_empty() {
            // Suffix form: the last N bytes.
            let suffix = parse_u64(end)?;
            if suffix == 0 || resource_length == 0 {
                return Err(RangeError::Unsatisfiable);
            }
            let length = suffix.min(resource_length);
            ByteRange::new(resource_length - length, length)
        } else {
            let first = parse_u64(start)?;
            let last = if end.trim().is_empty() {
                None
            } else {
                Some(parse_u64(end)?)
            };

            if let Some(last) = last {
                if last < first {
                    return Err(RangeError::Malformed);
                }
            }
            if first >= resource_length {
                return Err(RangeError::Unsatisfiable);
            }

            let last = last.map_or(resource_length - 1, |l| l.min(resource_length - 1));
            ByteRange::new(first, last - first + 1)
        };

        if ranges.iter().any(|r| r.overlaps(&range)) {
            return Err(RangeError::Overlapping);
        }
        ranges.push(range);
    }

    if ranges.is_empty() {
        return Err(RangeError::Malformed);
    }

    Ok(ranges)
}

/// The ranges accepted for a single request and the streaming cursor over them.
#[derive(Debug, Clone)]
pub struct RequestRangeSet {
    ranges: Vec<ByteRange>,
    resource_length: u64,
    boundary: Option<String>,
    cursor: usize,
}

impl RequestRangeSet {
    pub fn from_header(value: &str, resource_length: u64) -> Result<Self, RangeError> {
        let ranges = parse_range_header(value, resource_length)?;
        let boundary = if ranges.len() > 1 {
            Some(generate_boundary())
        } else {
            None
        };

        Ok(Self {
            ranges,
            resource_length,
            boundary,
            cursor: 0,
        })
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn resource_length(&self) -> u64 {
        self.resource_length
    }

    pub fn is_multipart(&self) -> bool {
        self.boundary.is_some()
    }

    pub fn boundary(&self) -> Option<&str> {
        self.boundary.as_deref()
    }

    /// The range currently being streamed, `None` once all are done.
    pub fn current(&self) -> Option<ByteRange> {
        self.ranges.get(self.cursor).copied()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Moves to the next range and returns it.
    pub fn advance(&mut self) -> Option<ByteRange> {
        if self.cursor < self.ranges.len() {
            self.cursor += 1;
        }
        self.current()
    }

    pub fn content_range(&self, index: usize) -> Option<String> {
        self.ranges
            .get(index)
            .map(|r| r.content_range(self.resource_length))
    }

    /// `Content-Type` of the whole multipart response.
    pub fn multipart_content_type(&self) -> Option<String> {
        self.boundary
            .as_ref()
            .map(|b| format!("multipart/byteranges; boundary={}", b))
    }

    /// Header block preceding part `index` of a multipart body.
    pub fn part_header(&self, index: usize, content_type: &str) -> Option<String> {
        let boundary = self.boundary.as_ref()?;
        let content_range = self.content_range(index)?;
        Some(format!(
            "--{}\r\nContent-Type: {}\r\nContent-Range: {}\r\n\r\n",
            boundary, content_type, content_range
        ))
    }

    /// Closing delimiter of a multipart body.
    pub fn trailer(&self) -> Option<String> {
        self.boundary.as_ref().map(|b| format!("--{}--\r\n", b))
    }

    /// Exact body length of the multipart response, so it can be sent with a
    /// `Content-Length` and the connection kept alive.
    pub fn multipart_content_length(&self, content_type: &str) -> Option<u64> {
        let mut total = self.trailer()?.len() as u64;
        for (i, range) in self.ranges.iter().enumerate() {
            total += self.part_header(i, content_type)?.len() as u64;
            total += range.length + 2;
        }
        Some(total)
    }
}

fn generate_boundary() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

//! Logical byte range → package-aligned physical range
//!
//! Package `i` of a container occupies
//! `[i·(PACKAGE_SIZE+PACKAGE_OVERHEAD) + header_offset, (i+1)·(…) + header_offset)`
//! and holds logical bytes shifted by the metadata prefix of package 0.

use std::fmt;

use vlt_core::{VltError, VltResult};

use crate::{PACKAGE_OVERHEAD, PACKAGE_SIZE};

const PACKAGE_SIZE_U64: u64 = PACKAGE_SIZE as u64;
const PHYSICAL_PACKAGE_SIZE: u64 = (PACKAGE_SIZE + PACKAGE_OVERHEAD) as u64;

/// A requested range of plaintext content, with the offsets needed to locate
/// it inside an encrypted container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRange {
    /// First requested content byte
    pub start: u64,
    /// Requested byte count; 0 means "to the end of the file"
    pub length: u64,
    /// Plaintext content size, 0 when unknown
    pub file_size: u64,
    /// Encoded container header size
    pub header_offset: u64,
    /// Encoded metadata size at the start of package 0
    pub metadata_offset: u64,
}

impl RequestRange {
    /// Fails with a user error when the range or the physical offsets it maps
    /// to do not fit in a `u64`.
    pub fn new(
        start: u64,
        length: u64,
        header_offset: u64,
        metadata_offset: u64,
    ) -> VltResult<Self> {
        let range = Self {
            start,
            length,
            file_size: 0,
            header_offset,
            metadata_offset,
        };
        let shifted_start = start.checked_add(metadata_offset);
        let shifted_end = if length == 0 {
            shifted_start
        } else {
            shifted_start.and_then(|s| s.checked_add(length))
        };
        shifted_end
            .and_then(physical_offset_of_package_after)
            .and_then(|end| end.checked_add(header_offset))
            .ok_or_else(|| VltError::user(format!("invalid range: start {start}, length {length}")))?;
        Ok(range)
    }

    /// Record the content size and clamp the range against it.
    ///
    /// A start at or past the end yields an empty range positioned at the end
    /// of the file. A zero or overlong length is cut to the end of the file.
    pub fn set_file_size(&mut self, size: u64) {
        self.file_size = size;
        if size == 0 {
            return;
        }
        if self.start >= size {
            self.start = size;
            self.length = 0;
        } else if self.length == 0 || self.start.saturating_add(self.length) > size {
            self.length = size - self.start;
        }
    }

    /// True when the file size is known and nothing is left to read.
    pub fn is_empty(&self) -> bool {
        self.file_size > 0 && self.length == 0
    }

    /// True when the range extends to the end of a file of unknown size.
    pub fn is_open_ended(&self) -> bool {
        self.file_size == 0 && self.length == 0
    }

    /// First package holding requested bytes.
    pub fn start_package(&self) -> u64 {
        self.shifted_start() / PACKAGE_SIZE_U64
    }

    fn shifted_start(&self) -> u64 {
        self.start.saturating_add(self.metadata_offset)
    }

    /// One past the last package to fetch, or `None` for an open-ended range.
    ///
    /// Computed as `floor(end / PACKAGE_SIZE) + 1` rather than a ceiling: when
    /// the range ends exactly on a package boundary this fetches one extra
    /// package, which the bounded decrypt simply never reads.
    pub fn end_package(&self) -> Option<u64> {
        if self.is_open_ended() {
            return None;
        }
        Some(self.shifted_start().saturating_add(self.length) / PACKAGE_SIZE_U64 + 1)
    }

    /// Plaintext bytes to drop from the first fetched package.
    pub fn skip_beginning(&self) -> u64 {
        self.shifted_start() % PACKAGE_SIZE_U64
    }

    /// First physical byte to fetch.
    pub fn start_bytes(&self) -> u64 {
        self.start_package()
            .saturating_mul(PHYSICAL_PACKAGE_SIZE)
            .saturating_add(self.header_offset)
    }

    /// One past the last physical byte to fetch, `None` when open-ended.
    pub fn end_bytes(&self) -> Option<u64> {
        self.end_package().map(|end| {
            end.saturating_mul(PHYSICAL_PACKAGE_SIZE)
                .saturating_add(self.header_offset)
        })
    }

    /// Value for the `Range` header of the ranged fetch from storage.
    pub fn request_header_value(&self) -> String {
        match self.end_bytes() {
            Some(end) => format!("bytes={}-{}", self.start_bytes(), end - 1),
            None => format!("bytes={}-", self.start_bytes()),
        }
    }

    /// Value for the `Content-Range` header of a response, `None` when the end
    /// of the range is not known. A range starting past the end of the file
    /// yields the unsatisfied form `bytes */<size>`.
    pub fn response_header_value(&self) -> Option<String> {
        if self.is_open_ended() {
            return None;
        }
        if self.is_empty() {
            return Some(format!("bytes */{}", self.file_size));
        }
        let end = self.start.saturating_add(self.length).saturating_sub(1);
        let size = if self.file_size > 0 {
            self.file_size.to_string()
        } else {
            "*".to_string()
        };
        Some(format!("bytes {}-{}/{}", self.start, end, size))
    }
}

impl fmt::Display for RequestRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start={} length={} packages={}..{} skip={}",
            self.start,
            self.length,
            self.start_package(),
            self.end_package()
                .map_or_else(|| "end".to_string(), |p| p.to_string()),
            self.skip_beginning()
        )
    }
}

/// Parse a single `Range` header of the form `bytes=a-b` or `bytes=a-`.
///
/// Returns `(start, length)` with length 0 for an open end, or `None` when
/// the header is empty. Multiple and suffix ranges are rejected.
pub fn parse_range_header(value: &str) -> VltResult<Option<(u64, u64)>> {
    if value.is_empty() {
        return Ok(None);
    }
    let spec = value
        .strip_prefix("bytes=")
        .ok_or_else(|| VltError::user("invalid range"))?;
    if spec.contains(',') {
        return Err(VltError::user("multiple ranges are not supported"));
    }
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(None);
    }
    let (start, end) = spec
        .split_once('-')
        .ok_or_else(|| VltError::user("invalid range"))?;

    let start: u64 = start
        .trim()
        .parse()
        .map_err(|_| VltError::user("invalid range"))?;
    let end = end.trim();
    if end.is_empty() {
        return Ok(Some((start, 0)));
    }
    let end: u64 = end.parse().map_err(|_| VltError::user("invalid range"))?;
    if start > end {
        return Err(VltError::user("invalid range"));
    }
    let length = (end - start)
        .checked_add(1)
        .ok_or_else(|| VltError::user("invalid range"))?;
    Ok(Some((start, length)))
}

/// Physical offset just past the package holding shifted byte `offset`,
/// without the header; `None` on overflow.
fn physical_offset_of_package_after(offset: u64) -> Option<u64> {
    (offset / PACKAGE_SIZE_U64)
        .checked_add(1)?
        .checked_mul(PHYSICAL_PACKAGE_SIZE)
}

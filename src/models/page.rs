//! Page blob data models.

use serde::{Deserialize, Serialize};

use super::blob::ExtentChunk;

/// Page blob constants.
pub const PAGE_SIZE: u64 = 512;
pub const MAX_PAGE_BLOB_SIZE: u64 = 8 * 1024 * 1024 * 1024 * 1024; // 8 TiB
pub const MAX_PAGE_RANGE_SIZE: u64 = 4 * 1024 * 1024; // 4 MiB per write operation

/// A range of pages in a page blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    /// Start byte offset (inclusive).
    pub start: u64,
    /// End byte offset (inclusive).
    pub end: u64,
}

impl PageRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Range covering `len` bytes starting at `offset`.
    pub fn from_offset(offset: u64, len: u64) -> Self {
        Self::new(offset, offset + len - 1)
    }

    /// Returns the length of this page range.
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Whether both ends fall on page boundaries.
    pub fn is_aligned(&self) -> bool {
        self.start % PAGE_SIZE == 0 && (self.end + 1) % PAGE_SIZE == 0
    }
}

/// A page range together with the extent holding its data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageWrite {
    pub range: PageRange,
    pub extent_chunk: ExtentChunk,
}

impl PageWrite {
    pub fn new(range: PageRange, extent_chunk: ExtentChunk) -> Self {
        Self {
            range,
            extent_chunk,
        }
    }
}

//! Blob data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::block::CommittedBlock;
use super::page::PageWrite;

/// Maximum number of blocks in an append blob.
pub const MAX_APPEND_BLOCK_COUNT: u32 = 50_000;
/// Maximum size of a single append block (100 MiB).
pub const MAX_APPEND_BLOCK_SIZE: u64 = 100 * 1024 * 1024;

/// Blob kinds. Each kind has its own client type exposing only the
/// operations that are legal for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobKind {
    Block,
    Page,
    Append,
}

impl BlobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobKind::Block => "BlockBlob",
            BlobKind::Page => "PageBlob",
            BlobKind::Append => "AppendBlob",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "block" | "blockblob" => Some(BlobKind::Block),
            "page" | "pageblob" => Some(BlobKind::Page),
            "append" | "appendblob" => Some(BlobKind::Append),
            _ => None,
        }
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a blob: container plus blob name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobPath {
    pub container: String,
    pub name: String,
}

impl BlobPath {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

/// Reference to data stored in an extent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentChunk {
    /// UUID of the extent containing this data.
    pub id: String,
    /// Byte offset within the extent.
    pub offset: u64,
    /// Number of bytes.
    pub count: u64,
}

impl ExtentChunk {
    pub fn new(id: String, offset: u64, count: u64) -> Self {
        Self { id, offset, count }
    }
}

/// Blob properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobProperties {
    pub kind: BlobKind,
    pub content_length: u64,
    pub content_md5: Option<String>,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub created_on: DateTime<Utc>,
    /// Committed block count for append blobs.
    pub committed_block_count: Option<u32>,
    /// Sequence number for page blobs.
    pub sequence_number: Option<u64>,
}

impl BlobProperties {
    /// Creates new blob properties for the given blob kind.
    pub fn new(kind: BlobKind, content_length: u64) -> Self {
        let now = Utc::now();
        let mut props = Self {
            kind,
            content_length,
            content_md5: None,
            etag: new_etag(),
            last_modified: now,
            created_on: now,
            committed_block_count: None,
            sequence_number: None,
        };

        match kind {
            BlobKind::Page => props.sequence_number = Some(0),
            BlobKind::Append => props.committed_block_count = Some(0),
            BlobKind::Block => {}
        }

        props
    }

    /// Updates the ETag and last modified time.
    pub fn update_etag(&mut self) {
        self.etag = new_etag();
        self.last_modified = Utc::now();
    }
}

fn new_etag() -> String {
    format!("\"0x{}\"", uuid::Uuid::new_v4().simple())
}

/// Complete blob model stored in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobModel {
    pub path: BlobPath,
    pub properties: BlobProperties,
    /// Data of block and append blobs, in content order.
    pub extent_chunks: Vec<ExtentChunk>,
    /// Committed block list of a block blob.
    pub committed_blocks: Vec<CommittedBlock>,
    /// Page writes of a page blob, oldest first. Later writes shadow earlier ones.
    pub page_writes: Vec<PageWrite>,
}

impl BlobModel {
    /// Creates a new, empty blob model.
    pub fn new(path: BlobPath, kind: BlobKind, content_length: u64) -> Self {
        Self {
            path,
            properties: BlobProperties::new(kind, content_length),
            extent_chunks: Vec::new(),
            committed_blocks: Vec::new(),
            page_writes: Vec::new(),
        }
    }

    pub fn kind(&self) -> BlobKind {
        self.properties.kind
    }
}

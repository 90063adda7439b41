//! Block data models for block blobs.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::blob::{BlobPath, ExtentChunk};

/// Maximum decoded length of a block ID.
pub const MAX_BLOCK_ID_LENGTH: usize = 64;

/// Maximum size of a single staged block (4000 MiB).
pub const MAX_BLOCK_SIZE: u64 = 4000 * 1024 * 1024;

/// Maximum number of blocks in a committed block list.
pub const MAX_BLOCK_COUNT: usize = 50_000;

/// Base64-encoded block identifier.
///
/// Stream-generated ids encode `{prefix}-{sequence:06}`, so every id of one
/// upload has the same length and sorts by submission order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(String);

impl BlockId {
    /// Builds the id of the block with the given sequence number.
    pub fn for_sequence(prefix: &Uuid, sequence: u64) -> Self {
        Self(BASE64.encode(format!("{}-{:06}", prefix, sequence)))
    }

    /// Wraps an already encoded id, validating it.
    pub fn parse(encoded: impl Into<String>) -> Option<Self> {
        let encoded = encoded.into();
        let decoded = BASE64.decode(&encoded).ok()?;
        if decoded.is_empty() || decoded.len() > MAX_BLOCK_ID_LENGTH {
            return None;
        }
        Some(Self(encoded))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recovers the sequence number of a stream-generated id.
    pub fn sequence(&self) -> Option<u64> {
        let decoded = BASE64.decode(&self.0).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        decoded.rsplit('-').next()?.parse().ok()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Block list type for GetBlockList operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockListType {
    Committed,
    Uncommitted,
    #[default]
    All,
}

impl BlockListType {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "committed" => BlockListType::Committed,
            "uncommitted" => BlockListType::Uncommitted,
            _ => BlockListType::All,
        }
    }

    pub fn includes_committed(&self) -> bool {
        matches!(self, BlockListType::Committed | BlockListType::All)
    }

    pub fn includes_uncommitted(&self) -> bool {
        matches!(self, BlockListType::Uncommitted | BlockListType::All)
    }
}

/// A staged (uncommitted) block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockModel {
    pub path: BlobPath,
    pub block_id: BlockId,
    /// Block size in bytes.
    pub size: u64,
    /// Reference to extent data.
    pub extent_chunk: ExtentChunk,
    /// When the block was staged.
    pub staged_time: DateTime<Utc>,
}

impl BlockModel {
    pub fn new(path: BlobPath, block_id: BlockId, size: u64, extent_chunk: ExtentChunk) -> Self {
        Self {
            path,
            block_id,
            size,
            extent_chunk,
            staged_time: Utc::now(),
        }
    }
}

/// Block entry in a committed block list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedBlock {
    pub block_id: BlockId,
    pub size: u64,
    pub extent_chunk: ExtentChunk,
}

impl From<BlockModel> for CommittedBlock {
    fn from(block: BlockModel) -> Self {
        Self {
            block_id: block.block_id,
            size: block.size,
            extent_chunk: block.extent_chunk,
        }
    }
}

/// Name and size of a block as reported by GetBlockList.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub block_id: BlockId,
    pub size: u64,
}

/// Result of GetBlockList.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockList {
    pub committed: Vec<BlockEntry>,
    pub uncommitted: Vec<BlockEntry>,
}

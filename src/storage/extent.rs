//! Extent store for blob and block data.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::ExtentChunk;

/// Trait for extent (raw data) storage operations.
#[async_trait]
pub trait ExtentStore: Send + Sync {
    /// Writes data to the extent store and returns an ExtentChunk reference.
    async fn write(&self, data: Bytes) -> StorageResult<ExtentChunk>;

    /// Reads the data referenced by a chunk.
    async fn read(&self, chunk: &ExtentChunk) -> StorageResult<Bytes>;

    /// Deletes an extent from the store.
    async fn delete(&self, extent_id: &str) -> StorageResult<()>;

    /// Returns the total size of all extents.
    async fn total_size(&self) -> u64;
}

/// Number of shards for the extent store (must be power of 2).
const NUM_SHARDS: usize = 64;

/// Sharded in-memory implementation of the extent store.
pub struct MemoryExtentStore {
    shards: Vec<DashMap<Arc<str>, Bytes>>,
    current_size: AtomicU64,
    /// Maximum size limit (0 = unlimited).
    size_limit: u64,
}

impl MemoryExtentStore {
    pub fn new() -> Self {
        Self::with_limit(0)
    }

    /// Creates a store that rejects writes once `limit` bytes are held.
    pub fn with_limit(limit: u64) -> Self {
        let shards = (0..NUM_SHARDS).map(|_| DashMap::new()).collect();
        Self {
            shards,
            current_size: AtomicU64::new(0),
            size_limit: limit,
        }
    }

    #[inline]
    fn shard(&self, extent_id: &str) -> &DashMap<Arc<str>, Bytes> {
        let hash = extent_id
            .bytes()
            .take(8)
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        &self.shards[hash & (NUM_SHARDS - 1)]
    }
}

impl Default for MemoryExtentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExtentStore for MemoryExtentStore {
    async fn write(&self, data: Bytes) -> StorageResult<ExtentChunk> {
        let size = data.len() as u64;

        if self.size_limit > 0 {
            let reserved = self.current_size.fetch_add(size, Ordering::AcqRel);
            if reserved + size > self.size_limit {
                self.current_size.fetch_sub(size, Ordering::AcqRel);
                return Err(StorageError::with_message(
                    ErrorCode::RequestBodyTooLarge,
                    "Storage limit exceeded",
                ));
            }
        } else {
            self.current_size.fetch_add(size, Ordering::AcqRel);
        }

        let extent_id = Uuid::new_v4().to_string();
        self.shard(&extent_id)
            .insert(Arc::from(extent_id.as_str()), data);

        Ok(ExtentChunk::new(extent_id, 0, size))
    }

    async fn read(&self, chunk: &ExtentChunk) -> StorageResult<Bytes> {
        let extent = self
            .shard(&chunk.id)
            .get(chunk.id.as_str())
            .map(|e| e.value().clone())
            .ok_or_else(|| StorageError::new(ErrorCode::InternalError))?;

        let start = chunk.offset as usize;
        let end = start + chunk.count as usize;
        if end > extent.len() {
            return Err(StorageError::new(ErrorCode::InternalError));
        }

        Ok(extent.slice(start..end))
    }

    async fn delete(&self, extent_id: &str) -> StorageResult<()> {
        if let Some((_, data)) = self.shard(extent_id).remove(extent_id) {
            self.current_size
                .fetch_sub(data.len() as u64, Ordering::AcqRel);
        }
        Ok(())
    }

    async fn total_size(&self) -> u64 {
        self.current_size.load(Ordering::Acquire)
    }
}

/// File system implementation of the extent store. One file per extent.
pub struct FsExtentStore {
    base_path: PathBuf,
    extent_sizes: DashMap<Arc<str>, u64>,
    current_size: AtomicU64,
}

impl FsExtentStore {
    pub async fn new(base_path: PathBuf) -> StorageResult<Self> {
        fs::create_dir_all(&base_path)
            .await
            .map_err(|e| io_error("Failed to create extent directory", e))?;

        Ok(Self {
            base_path,
            extent_sizes: DashMap::new(),
            current_size: AtomicU64::new(0),
        })
    }

    fn extent_path(&self, extent_id: &str) -> PathBuf {
        self.base_path.join(extent_id)
    }
}

fn io_error(context: &str, err: std::io::Error) -> StorageError {
    StorageError::with_message(ErrorCode::InternalError, format!("{}: {}", context, err))
}

#[async_trait]
impl ExtentStore for FsExtentStore {
    async fn write(&self, data: Bytes) -> StorageResult<ExtentChunk> {
        let size = data.len() as u64;
        let extent_id = Uuid::new_v4().to_string();

        let mut file = fs::File::create(self.extent_path(&extent_id))
            .await
            .map_err(|e| io_error("Failed to create extent file", e))?;
        file.write_all(&data)
            .await
            .map_err(|e| io_error("Failed to write extent data", e))?;
        file.flush()
            .await
            .map_err(|e| io_error("Failed to flush extent data", e))?;

        self.extent_sizes.insert(Arc::from(extent_id.as_str()), size);
        self.current_size.fetch_add(size, Ordering::AcqRel);

        Ok(ExtentChunk::new(extent_id, 0, size))
    }

    async fn read(&self, chunk: &ExtentChunk) -> StorageResult<Bytes> {
        let data = fs::read(self.extent_path(&chunk.id))
            .await
            .map_err(|e| io_error("Failed to read extent file", e))?;

        let start = chunk.offset as usize;
        let end = start + chunk.count as usize;
        if end > data.len() {
            return Err(StorageError::new(ErrorCode::InternalError));
        }

        Ok(Bytes::from(data).slice(start..end))
    }

    async fn delete(&self, extent_id: &str) -> StorageResult<()> {
        if let Some((_, size)) = self.extent_sizes.remove(extent_id) {
            self.current_size.fetch_sub(size, Ordering::AcqRel);
        }

        // A missing file means the extent was never written or already gone.
        fs::remove_file(self.extent_path(extent_id)).await.ok();
        Ok(())
    }

    async fn total_size(&self) -> u64 {
        self.current_size.load(Ordering::Acquire)
    }
}

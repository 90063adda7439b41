//! Metadata store for containers, blobs, and staged blocks.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::{BlobModel, BlobPath, BlockId, BlockModel, ContainerModel};

/// Trait for metadata storage operations.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    // Container operations
    async fn create_container(&self, container: ContainerModel) -> StorageResult<()>;
    async fn get_container(&self, name: &str) -> StorageResult<ContainerModel>;
    async fn container_exists(&self, name: &str) -> bool;

    // Blob operations
    async fn create_blob(&self, blob: BlobModel) -> StorageResult<()>;
    async fn get_blob(&self, path: &BlobPath) -> StorageResult<BlobModel>;
    async fn update_blob(&self, blob: BlobModel) -> StorageResult<()>;
    async fn delete_blob(&self, path: &BlobPath) -> StorageResult<()>;

    // Block operations
    async fn stage_block(&self, block: BlockModel) -> StorageResult<()>;
    /// Returns the staged blocks of a blob in staging order.
    async fn get_staged_blocks(&self, path: &BlobPath) -> StorageResult<Vec<BlockModel>>;
    async fn get_staged_block(&self, path: &BlobPath, block_id: &BlockId)
        -> StorageResult<BlockModel>;
    async fn delete_staged_blocks(&self, path: &BlobPath) -> StorageResult<()>;
}

/// Key type for blobs - uses Arc<str> to avoid allocations.
type BlobKey = (Arc<str>, Arc<str>);

/// In-memory implementation of the metadata store with concurrent access.
pub struct MemoryMetadataStore {
    /// Containers indexed by name.
    containers: DashMap<Arc<str>, ContainerModel>,

    /// Blobs indexed by (container, name).
    blobs: DashMap<BlobKey, BlobModel>,

    /// Staged (uncommitted) blocks per blob. Restaging an id replaces the
    /// earlier block in place so the list keeps first-staged order.
    blocks: DashMap<BlobKey, Vec<BlockModel>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            blobs: DashMap::new(),
            blocks: DashMap::new(),
        }
    }

    /// Create a blob key.
    #[inline]
    fn blob_key(path: &BlobPath) -> BlobKey {
        (Arc::from(path.container.as_str()), Arc::from(path.name.as_str()))
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_container(&self, container: ContainerModel) -> StorageResult<()> {
        let key: Arc<str> = Arc::from(container.name.as_str());
        if self.containers.contains_key(&key) {
            return Err(StorageError::new(ErrorCode::ContainerAlreadyExists));
        }
        self.containers.insert(key, container);
        Ok(())
    }

    async fn get_container(&self, name: &str) -> StorageResult<ContainerModel> {
        self.containers
            .get(name)
            .map(|c| c.value().clone())
            .ok_or_else(|| StorageError::new(ErrorCode::ContainerNotFound))
    }

    async fn container_exists(&self, name: &str) -> bool {
        self.containers.contains_key(name)
    }

    async fn create_blob(&self, blob: BlobModel) -> StorageResult<()> {
        if !self.container_exists(&blob.path.container).await {
            return Err(StorageError::new(ErrorCode::ContainerNotFound));
        }
        self.blobs.insert(Self::blob_key(&blob.path), blob);
        Ok(())
    }

    async fn get_blob(&self, path: &BlobPath) -> StorageResult<BlobModel> {
        // First check if container exists
        if !self.container_exists(&path.container).await {
            return Err(StorageError::new(ErrorCode::ContainerNotFound));
        }

        self.blobs
            .get(&Self::blob_key(path))
            .map(|b| b.value().clone())
            .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))
    }

    async fn update_blob(&self, blob: BlobModel) -> StorageResult<()> {
        let key = Self::blob_key(&blob.path);
        if !self.blobs.contains_key(&key) {
            return Err(StorageError::new(ErrorCode::BlobNotFound));
        }
        self.blobs.insert(key, blob);
        Ok(())
    }

    async fn delete_blob(&self, path: &BlobPath) -> StorageResult<()> {
        let key = Self::blob_key(path);
        self.blocks.remove(&key);
        self.blobs
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))
    }

    async fn stage_block(&self, block: BlockModel) -> StorageResult<()> {
        if !self.container_exists(&block.path.container).await {
            return Err(StorageError::new(ErrorCode::ContainerNotFound));
        }

        let mut staged = self.blocks.entry(Self::blob_key(&block.path)).or_default();
        match staged.iter_mut().find(|b| b.block_id == block.block_id) {
            Some(existing) => *existing = block,
            None => staged.push(block),
        }
        Ok(())
    }

    async fn get_staged_blocks(&self, path: &BlobPath) -> StorageResult<Vec<BlockModel>> {
        Ok(self
            .blocks
            .get(&Self::blob_key(path))
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn get_staged_block(
        &self,
        path: &BlobPath,
        block_id: &BlockId,
    ) -> StorageResult<BlockModel> {
        self.blocks
            .get(&Self::blob_key(path))
            .and_then(|entry| entry.iter().find(|b| &b.block_id == block_id).cloned())
            .ok_or_else(|| StorageError::new(ErrorCode::InvalidBlockId))
    }

    async fn delete_staged_blocks(&self, path: &BlobPath) -> StorageResult<()> {
        self.blocks.remove(&Self::blob_key(path));
        Ok(())
    }
}

//! In-process blob service emulator.
//!
//! Implements [`BlobTransport`] directly on a [`MetadataStore`] and an
//! [`ExtentStore`]. It enforces the service rules upload streams rely on:
//! block ids and block lists, ETag / max-size / append-position conditions,
//! page alignment and transactional MD5.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use md5::{Digest, Md5};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::{
    AccessConditions, BlobKind, BlobModel, BlobPath, BlobProperties, BlockEntry, BlockId,
    BlockList, BlockListType, BlockModel, CommittedBlock, ContainerModel, ExtentChunk, PageRange,
    PageWrite, MAX_APPEND_BLOCK_COUNT, MAX_APPEND_BLOCK_SIZE, MAX_BLOCK_COUNT, MAX_BLOCK_SIZE,
    MAX_PAGE_BLOB_SIZE, MAX_PAGE_RANGE_SIZE, PAGE_SIZE,
};
use crate::storage::{ExtentStore, MemoryExtentStore, MemoryMetadataStore, MetadataStore};

use super::{BlobTransport, CommitOptions};

/// Blob service emulator backed by the storage layer.
pub struct StorageEmulator {
    metadata: Arc<dyn MetadataStore>,
    extents: Arc<dyn ExtentStore>,
    /// Serializes read-modify-write cycles on a single blob.
    blob_locks: DashMap<BlobPath, Arc<Mutex<()>>>,
}

impl StorageEmulator {
    /// Creates an emulator with in-memory storage.
    pub fn new() -> Self {
        Self::with_storage(
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(MemoryExtentStore::new()),
        )
    }

    /// Creates an emulator with custom storage.
    pub fn with_storage(metadata: Arc<dyn MetadataStore>, extents: Arc<dyn ExtentStore>) -> Self {
        Self {
            metadata,
            extents,
            blob_locks: DashMap::new(),
        }
    }

    pub fn extents(&self) -> &Arc<dyn ExtentStore> {
        &self.extents
    }

    async fn lock_blob(&self, path: &BlobPath) -> OwnedMutexGuard<()> {
        let lock = self
            .blob_locks
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    async fn require_container(&self, container: &str) -> StorageResult<()> {
        self.metadata.get_container(container).await.map(|_| ())
    }

    async fn existing_blob(&self, path: &BlobPath) -> StorageResult<Option<BlobModel>> {
        match self.metadata.get_blob(path).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.code == ErrorCode::BlobNotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_blob_of_kind(&self, path: &BlobPath, kind: BlobKind) -> StorageResult<BlobModel> {
        let blob = self.metadata.get_blob(path).await?;
        if blob.kind() != kind {
            return Err(StorageError::with_message(
                ErrorCode::InvalidBlobType,
                format!("{} is a {}, not a {}", path, blob.kind(), kind),
            ));
        }
        Ok(blob)
    }

    /// Replaces whatever is stored at `path` with a new, empty blob.
    async fn replace_blob(&self, blob: BlobModel) -> StorageResult<BlobProperties> {
        if let Some(previous) = self.existing_blob(&blob.path).await? {
            self.release_extents(referenced_chunks(&previous)).await;
        }
        let staged = self.metadata.get_staged_blocks(&blob.path).await?;
        self.release_extents(staged.iter().map(|b| &b.extent_chunk))
            .await;
        self.metadata.delete_staged_blocks(&blob.path).await?;

        let properties = blob.properties.clone();
        self.metadata.create_blob(blob).await?;
        Ok(properties)
    }

    async fn release_extents<'a>(&self, chunks: impl Iterator<Item = &'a ExtentChunk>) {
        for chunk in chunks {
            if let Err(e) = self.extents.delete(&chunk.id).await {
                warn!("Failed to release extent {}: {}", chunk.id, e);
            }
        }
    }
}

impl Default for StorageEmulator {
    fn default() -> Self {
        Self::new()
    }
}

fn referenced_chunks(blob: &BlobModel) -> impl Iterator<Item = &ExtentChunk> {
    blob.extent_chunks
        .iter()
        .chain(blob.committed_blocks.iter().map(|b| &b.extent_chunk))
        .chain(blob.page_writes.iter().map(|w| &w.extent_chunk))
}

/// Validates a transactional Content-MD5 against the received data.
fn verify_md5(data: &[u8], expected: Option<&str>) -> StorageResult<()> {
    if let Some(expected) = expected {
        let computed = BASE64.encode(Md5::digest(data));
        if computed != expected {
            return Err(StorageError::new(ErrorCode::Md5Mismatch));
        }
    }
    Ok(())
}

#[async_trait]
impl BlobTransport for StorageEmulator {
    async fn create_container(&self, container: &str) -> StorageResult<()> {
        self.metadata
            .create_container(ContainerModel::new(container))
            .await
    }

    async fn container_exists(&self, container: &str) -> bool {
        self.metadata.container_exists(container).await
    }

    async fn stage_block(
        &self,
        path: &BlobPath,
        block_id: &BlockId,
        data: Bytes,
        content_md5: Option<String>,
    ) -> StorageResult<()> {
        self.require_container(&path.container).await?;

        // Ids built outside this crate may not have been validated.
        if BlockId::parse(block_id.as_str()).is_none() {
            return Err(StorageError::with_message(
                ErrorCode::InvalidBlockId,
                "Block ID must be base64 encoded and <= 64 bytes when decoded",
            ));
        }

        if let Some(existing) = self.existing_blob(path).await? {
            if existing.kind() != BlobKind::Block {
                return Err(StorageError::new(ErrorCode::InvalidBlobType));
            }
        }

        let size = data.len() as u64;
        if size > MAX_BLOCK_SIZE {
            return Err(StorageError::with_message(
                ErrorCode::RequestBodyTooLarge,
                format!("Block size cannot exceed {} bytes", MAX_BLOCK_SIZE),
            ));
        }
        verify_md5(&data, content_md5.as_deref())?;

        let replaced = self.metadata.get_staged_block(path, block_id).await.ok();
        let extent_chunk = self.extents.write(data).await?;
        self.metadata
            .stage_block(BlockModel::new(
                path.clone(),
                block_id.clone(),
                size,
                extent_chunk,
            ))
            .await?;
        if let Some(replaced) = replaced {
            self.release_extents(std::iter::once(&replaced.extent_chunk))
                .await;
        }

        debug!("Staged block {} ({} bytes) for {}", block_id, size, path);
        Ok(())
    }

    async fn commit_block_list(
        &self,
        path: &BlobPath,
        blocks: &[BlockId],
        options: &CommitOptions,
    ) -> StorageResult<BlobProperties> {
        let _guard = self.lock_blob(path).await;
        self.require_container(&path.container).await?;

        let existing = self.existing_blob(path).await?;
        if let Some(ref blob) = existing {
            if blob.kind() != BlobKind::Block {
                return Err(StorageError::new(ErrorCode::InvalidBlobType));
            }
        }
        options.conditions.check_etag(existing.as_ref())?;

        if blocks.len() > MAX_BLOCK_COUNT {
            return Err(StorageError::new(ErrorCode::BlockListTooLong));
        }

        let staged = self.metadata.get_staged_blocks(path).await?;
        let committed: &[CommittedBlock] = existing
            .as_ref()
            .map(|b| b.committed_blocks.as_slice())
            .unwrap_or_default();

        // Resolve each id the way a "Latest" entry does: the staged block
        // wins over a committed block with the same id.
        let mut resolved = Vec::with_capacity(blocks.len());
        let mut total_size = 0u64;
        for block_id in blocks {
            let block = staged
                .iter()
                .find(|b| &b.block_id == block_id)
                .map(|b| CommittedBlock::from(b.clone()))
                .or_else(|| committed.iter().find(|b| &b.block_id == block_id).cloned())
                .ok_or_else(|| {
                    StorageError::with_message(
                        ErrorCode::InvalidBlockList,
                        format!("Block {} not found", block_id),
                    )
                })?;
            total_size += block.size;
            resolved.push(block);
        }

        options.conditions.check_max_size(total_size)?;

        let mut blob = existing
            .clone()
            .unwrap_or_else(|| BlobModel::new(path.clone(), BlobKind::Block, 0));
        blob.properties.content_length = total_size;
        blob.properties.content_md5 = options.content_md5.clone();
        blob.properties.update_etag();
        blob.extent_chunks = resolved.iter().map(|b| b.extent_chunk.clone()).collect();
        blob.committed_blocks = resolved;

        let properties = blob.properties.clone();
        self.metadata.create_blob(blob.clone()).await?;
        self.metadata.delete_staged_blocks(path).await?;

        // Uncommitted blocks are discarded by a commit.
        let live: HashSet<&str> = blob.extent_chunks.iter().map(|c| c.id.as_str()).collect();
        let stale = staged
            .iter()
            .map(|b| &b.extent_chunk)
            .chain(committed.iter().map(|b| &b.extent_chunk))
            .filter(|c| !live.contains(c.id.as_str()));
        self.release_extents(stale).await;

        debug!(
            "Committed {} blocks ({} bytes) to {}",
            blocks.len(),
            total_size,
            path
        );
        Ok(properties)
    }

    async fn get_block_list(
        &self,
        path: &BlobPath,
        list_type: BlockListType,
    ) -> StorageResult<BlockList> {
        self.require_container(&path.container).await?;

        let blob = self.existing_blob(path).await?;
        let staged = self.metadata.get_staged_blocks(path).await?;
        if blob.is_none() && staged.is_empty() {
            return Err(StorageError::new(ErrorCode::BlobNotFound));
        }

        let mut list = BlockList::default();
        if list_type.includes_committed() {
            if let Some(blob) = blob {
                list.committed = blob
                    .committed_blocks
                    .into_iter()
                    .map(|b| BlockEntry {
                        block_id: b.block_id,
                        size: b.size,
                    })
                    .collect();
            }
        }
        if list_type.includes_uncommitted() {
            list.uncommitted = staged
                .into_iter()
                .map(|b| BlockEntry {
                    block_id: b.block_id,
                    size: b.size,
                })
                .collect();
        }

        Ok(list)
    }

    async fn create_page_blob(
        &self,
        path: &BlobPath,
        size: u64,
        conditions: &AccessConditions,
    ) -> StorageResult<BlobProperties> {
        let _guard = self.lock_blob(path).await;
        self.require_container(&path.container).await?;

        // Content length must be aligned to 512 bytes
        if size % PAGE_SIZE != 0 {
            return Err(StorageError::with_message(
                ErrorCode::InvalidHeaderValue,
                "Page blob size must be aligned to 512 bytes",
            ));
        }
        if size > MAX_PAGE_BLOB_SIZE {
            return Err(StorageError::with_message(
                ErrorCode::InvalidHeaderValue,
                "Page blob size exceeds the maximum",
            ));
        }

        let existing = self.existing_blob(path).await?;
        conditions.check_etag(existing.as_ref())?;
        conditions.check_max_size(size)?;

        let properties = self
            .replace_blob(BlobModel::new(path.clone(), BlobKind::Page, size))
            .await?;
        debug!("Created page blob {} ({} bytes)", path, size);
        Ok(properties)
    }

    async fn put_pages(
        &self,
        path: &BlobPath,
        offset: u64,
        data: Bytes,
        content_md5: Option<String>,
    ) -> StorageResult<()> {
        let _guard = self.lock_blob(path).await;
        let mut blob = self.get_blob_of_kind(path, BlobKind::Page).await?;

        let len = data.len() as u64;
        if len == 0 {
            return Err(StorageError::with_message(
                ErrorCode::InvalidPageRange,
                "Page writes must not be empty",
            ));
        }
        if len > MAX_PAGE_RANGE_SIZE {
            return Err(StorageError::with_message(
                ErrorCode::RequestBodyTooLarge,
                format!("Page writes cannot exceed {} bytes", MAX_PAGE_RANGE_SIZE),
            ));
        }

        let range = PageRange::from_offset(offset, len);
        if !range.is_aligned() {
            return Err(StorageError::with_message(
                ErrorCode::InvalidPageRange,
                "Page ranges must be aligned to 512 bytes",
            ));
        }
        // Validate range is within blob size
        if range.end >= blob.properties.content_length {
            return Err(StorageError::new(ErrorCode::InvalidPageRange));
        }
        verify_md5(&data, content_md5.as_deref())?;

        let extent_chunk = self.extents.write(data).await?;
        blob.page_writes.push(PageWrite::new(range, extent_chunk));
        blob.properties.content_md5 = None;
        blob.properties.update_etag();
        self.metadata.update_blob(blob).await?;

        debug!("Wrote pages {}-{} of {}", range.start, range.end, path);
        Ok(())
    }

    async fn create_append_blob(
        &self,
        path: &BlobPath,
        conditions: &AccessConditions,
    ) -> StorageResult<BlobProperties> {
        let _guard = self.lock_blob(path).await;
        self.require_container(&path.container).await?;

        let existing = self.existing_blob(path).await?;
        conditions.check_etag(existing.as_ref())?;

        let properties = self
            .replace_blob(BlobModel::new(path.clone(), BlobKind::Append, 0))
            .await?;
        debug!("Created append blob {}", path);
        Ok(properties)
    }

    async fn append_block(
        &self,
        path: &BlobPath,
        data: Bytes,
        content_md5: Option<String>,
        conditions: &AccessConditions,
    ) -> StorageResult<u64> {
        let _guard = self.lock_blob(path).await;
        let mut blob = self.get_blob_of_kind(path, BlobKind::Append).await?;

        let block_size = data.len() as u64;
        if block_size > MAX_APPEND_BLOCK_SIZE {
            return Err(StorageError::with_message(
                ErrorCode::RequestBodyTooLarge,
                format!("Append block size cannot exceed {} bytes", MAX_APPEND_BLOCK_SIZE),
            ));
        }

        let current_block_count = blob.properties.committed_block_count.unwrap_or(0);
        if current_block_count >= MAX_APPEND_BLOCK_COUNT {
            return Err(StorageError::new(ErrorCode::BlockCountExceedsLimit));
        }

        let append_offset = blob.properties.content_length;
        conditions.check_etag(Some(&blob))?;
        conditions.check_append_position(append_offset)?;
        conditions.check_max_size(append_offset + block_size)?;
        verify_md5(&data, content_md5.as_deref())?;

        let extent_chunk = self.extents.write(data).await?;
        blob.extent_chunks.push(extent_chunk);
        blob.properties.content_length += block_size;
        blob.properties.committed_block_count = Some(current_block_count + 1);
        blob.properties.content_md5 = None;
        blob.properties.update_etag();
        self.metadata.update_blob(blob).await?;

        debug!(
            "Appended {} bytes to {} at offset {}",
            block_size, path, append_offset
        );
        Ok(append_offset)
    }

    async fn set_content_md5(
        &self,
        path: &BlobPath,
        content_md5: Option<String>,
    ) -> StorageResult<BlobProperties> {
        let _guard = self.lock_blob(path).await;
        let mut blob = self.metadata.get_blob(path).await?;
        blob.properties.content_md5 = content_md5;
        blob.properties.update_etag();

        let properties = blob.properties.clone();
        self.metadata.update_blob(blob).await?;
        Ok(properties)
    }

    async fn get_properties(&self, path: &BlobPath) -> StorageResult<BlobProperties> {
        Ok(self.metadata.get_blob(path).await?.properties)
    }

    async fn download(&self, path: &BlobPath) -> StorageResult<Bytes> {
        let blob = self.metadata.get_blob(path).await?;

        match blob.kind() {
            BlobKind::Page => {
                // Unwritten pages read as zeros.
                let mut content = vec![0u8; blob.properties.content_length as usize];
                for write in &blob.page_writes {
                    let data = self.extents.read(&write.extent_chunk).await?;
                    let start = write.range.start as usize;
                    content[start..start + data.len()].copy_from_slice(&data);
                }
                Ok(Bytes::from(content))
            }
            BlobKind::Block | BlobKind::Append => {
                let mut content = BytesMut::with_capacity(blob.properties.content_length as usize);
                for chunk in &blob.extent_chunks {
                    content.extend_from_slice(&self.extents.read(chunk).await?);
                }
                Ok(content.freeze())
            }
        }
    }
}

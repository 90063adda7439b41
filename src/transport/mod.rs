//! The storage contract consumed by upload streams.
//!
//! [`BlobTransport`] is the boundary to the remote blob service. The crate
//! ships one implementation, [`StorageEmulator`], which runs in-process over
//! the [`storage`](crate::storage) layer.

mod emulator;

pub use emulator::*;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{StorageError, StorageResult};
use crate::models::{AccessConditions, BlobPath, BlobProperties, BlockId, BlockList, BlockListType};

/// Options for committing a block list.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub conditions: AccessConditions,
    /// Whole-blob MD5 to store in the blob's properties.
    pub content_md5: Option<String>,
}

/// Asynchronous blob service operations used by upload streams.
#[async_trait]
pub trait BlobTransport: Send + Sync {
    async fn create_container(&self, container: &str) -> StorageResult<()>;

    async fn container_exists(&self, container: &str) -> bool;

    /// Stages an uncommitted block. `content_md5` is a transactional hash
    /// the store verifies against the received data.
    async fn stage_block(
        &self,
        path: &BlobPath,
        block_id: &BlockId,
        data: Bytes,
        content_md5: Option<String>,
    ) -> StorageResult<()>;

    /// Atomically replaces the blob's content with the given staged blocks,
    /// in the given order.
    async fn commit_block_list(
        &self,
        path: &BlobPath,
        blocks: &[BlockId],
        options: &CommitOptions,
    ) -> StorageResult<BlobProperties>;

    async fn get_block_list(
        &self,
        path: &BlobPath,
        list_type: BlockListType,
    ) -> StorageResult<BlockList>;

    /// Creates (or overwrites) a zero-filled page blob of `size` bytes.
    async fn create_page_blob(
        &self,
        path: &BlobPath,
        size: u64,
        conditions: &AccessConditions,
    ) -> StorageResult<BlobProperties>;

    /// Writes page-aligned data at `offset`.
    async fn put_pages(
        &self,
        path: &BlobPath,
        offset: u64,
        data: Bytes,
        content_md5: Option<String>,
    ) -> StorageResult<()>;

    /// Creates (or overwrites) an empty append blob.
    async fn create_append_blob(
        &self,
        path: &BlobPath,
        conditions: &AccessConditions,
    ) -> StorageResult<BlobProperties>;

    /// Appends a block, returning the offset it was written at.
    async fn append_block(
        &self,
        path: &BlobPath,
        data: Bytes,
        content_md5: Option<String>,
        conditions: &AccessConditions,
    ) -> StorageResult<u64>;

    /// Stores the whole-blob MD5 in the blob's properties.
    async fn set_content_md5(
        &self,
        path: &BlobPath,
        content_md5: Option<String>,
    ) -> StorageResult<BlobProperties>;

    async fn get_properties(&self, path: &BlobPath) -> StorageResult<BlobProperties>;

    async fn download(&self, path: &BlobPath) -> StorageResult<Bytes>;
}

/// Kind of request a stream sends to its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    StageBlock,
    CommitBlockList,
    PutPages,
    AppendBlock,
    SetContentMd5,
}

/// Description of a single request attempt, handed to a [`RequestObserver`].
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub operation: Operation,
    pub path: BlobPath,
    pub block_id: Option<BlockId>,
    pub offset: Option<u64>,
    pub length: u64,
    /// Zero for the first attempt, incremented on every retry.
    pub attempt: u32,
}

/// Hook for observing the requests an upload stream issues.
///
/// Supplied per stream through
/// [`UploadOptions::with_observer`](crate::config::UploadOptions::with_observer).
pub trait RequestObserver: Send + Sync {
    fn on_sending(&self, _event: &RequestEvent) {}

    fn on_completed(&self, _event: &RequestEvent, _outcome: Result<(), &StorageError>) {}
}

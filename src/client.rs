//! Blob clients.
//!
//! Each blob kind has its own client type exposing only the operations that
//! are legal for it. All of them open a [`BlobOutputStream`] through
//! `open_write`.

use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use crate::config::UploadOptions;
use crate::error::{StorageResult, UploadError, UploadResult};
use crate::models::{
    AccessConditions, BlobKind, BlobPath, BlobProperties, BlockList, BlockListType,
    MAX_APPEND_BLOCK_SIZE, MAX_PAGE_RANGE_SIZE, PAGE_SIZE,
};
use crate::stream::{BlobOutputStream, Target};
use crate::transport::BlobTransport;

/// Largest block a block blob stream dispatches (100 MiB).
pub const MAX_STREAM_BLOCK_SIZE: usize = 100 * 1024 * 1024;

/// Client for a container.
#[derive(Clone)]
pub struct ContainerClient {
    transport: Arc<dyn BlobTransport>,
    name: String,
}

impl ContainerClient {
    pub fn new(transport: Arc<dyn BlobTransport>, name: impl Into<String>) -> Self {
        Self {
            transport,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn create(&self) -> StorageResult<()> {
        self.transport.create_container(&self.name).await
    }

    pub async fn exists(&self) -> bool {
        self.transport.container_exists(&self.name).await
    }

    pub fn block_blob_client(&self, blob: impl Into<String>) -> BlockBlobClient {
        BlockBlobClient {
            inner: self.blob(blob),
        }
    }

    pub fn page_blob_client(&self, blob: impl Into<String>) -> PageBlobClient {
        PageBlobClient {
            inner: self.blob(blob),
        }
    }

    pub fn append_blob_client(&self, blob: impl Into<String>) -> AppendBlobClient {
        AppendBlobClient {
            inner: self.blob(blob),
        }
    }

    fn blob(&self, blob: impl Into<String>) -> BlobClient {
        BlobClient {
            transport: self.transport.clone(),
            path: BlobPath::new(self.name.clone(), blob),
        }
    }
}

/// Operations shared by every blob kind.
#[derive(Clone)]
struct BlobClient {
    transport: Arc<dyn BlobTransport>,
    path: BlobPath,
}

impl BlobClient {
    async fn properties(&self) -> StorageResult<BlobProperties> {
        self.transport.get_properties(&self.path).await
    }

    async fn download(&self) -> StorageResult<Bytes> {
        self.transport.download(&self.path).await
    }

    fn stream(
        &self,
        target: Target,
        conditions: AccessConditions,
        options: UploadOptions,
        start_offset: u64,
    ) -> BlobOutputStream {
        BlobOutputStream::new(
            self.transport.clone(),
            self.path.clone(),
            target,
            conditions,
            options,
            start_offset,
        )
    }
}

fn validate(options: &UploadOptions, max_block_size: usize) -> UploadResult<()> {
    if options.block_size == 0 {
        return Err(UploadError::InvalidArgument(
            "block size must be greater than zero".to_string(),
        ));
    }
    if options.block_size > max_block_size {
        return Err(UploadError::InvalidArgument(format!(
            "block size {} exceeds the limit of {} bytes",
            options.block_size, max_block_size
        )));
    }
    if options.concurrency == 0 {
        return Err(UploadError::InvalidArgument(
            "concurrency must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Client for a block blob.
#[derive(Clone)]
pub struct BlockBlobClient {
    inner: BlobClient,
}

impl BlockBlobClient {
    pub fn path(&self) -> &BlobPath {
        &self.inner.path
    }

    /// Opens an upload stream. Blocks are staged as they fill up and the
    /// block list is committed, subject to `conditions`, on close.
    pub async fn open_write(
        &self,
        conditions: AccessConditions,
        options: UploadOptions,
    ) -> UploadResult<BlobOutputStream> {
        validate(&options, MAX_STREAM_BLOCK_SIZE)?;
        Ok(self.inner.stream(Target::Block, conditions, options, 0))
    }

    pub async fn block_list(&self, list_type: BlockListType) -> StorageResult<BlockList> {
        self.inner
            .transport
            .get_block_list(&self.inner.path, list_type)
            .await
    }

    pub async fn properties(&self) -> StorageResult<BlobProperties> {
        self.inner.properties().await
    }

    pub async fn download(&self) -> StorageResult<Bytes> {
        self.inner.download().await
    }
}

/// Client for a page blob.
#[derive(Clone)]
pub struct PageBlobClient {
    inner: BlobClient,
}

impl PageBlobClient {
    pub fn path(&self) -> &BlobPath {
        &self.inner.path
    }

    /// Creates a page blob of `size` bytes and opens a stream writing it
    /// from the start. `size` and the block size must be multiples of 512.
    pub async fn open_write(
        &self,
        size: u64,
        conditions: AccessConditions,
        options: UploadOptions,
    ) -> UploadResult<BlobOutputStream> {
        validate(&options, MAX_PAGE_RANGE_SIZE as usize)?;
        if options.block_size as u64 % PAGE_SIZE != 0 {
            return Err(UploadError::InvalidArgument(format!(
                "page blob block size must be a multiple of {} bytes",
                PAGE_SIZE
            )));
        }
        if size % PAGE_SIZE != 0 {
            return Err(UploadError::InvalidArgument(format!(
                "page blob size must be a multiple of {} bytes",
                PAGE_SIZE
            )));
        }

        self.inner
            .transport
            .create_page_blob(&self.inner.path, size, &conditions)
            .await
            .map_err(UploadError::open)?;

        Ok(self
            .inner
            .stream(Target::Page { size }, conditions, options, 0))
    }

    pub async fn properties(&self) -> StorageResult<BlobProperties> {
        self.inner.properties().await
    }

    pub async fn download(&self) -> StorageResult<Bytes> {
        self.inner.download().await
    }
}

/// Client for an append blob.
#[derive(Clone)]
pub struct AppendBlobClient {
    inner: BlobClient,
}

impl AppendBlobClient {
    pub fn path(&self) -> &BlobPath {
        &self.inner.path
    }

    /// Opens a stream appending to the blob.
    ///
    /// With `create` set the blob is created (replacing an existing one);
    /// otherwise the stream continues an existing append blob at its current
    /// length. Appends are always dispatched one at a time.
    pub async fn open_write(
        &self,
        create: bool,
        conditions: AccessConditions,
        mut options: UploadOptions,
    ) -> UploadResult<BlobOutputStream> {
        validate(&options, MAX_APPEND_BLOCK_SIZE as usize)?;
        if options.concurrency != 1 {
            debug!(
                "Append blob {} dispatches sequentially, ignoring concurrency {}",
                self.inner.path, options.concurrency
            );
            options.concurrency = 1;
        }

        let start_offset = if create {
            self.inner
                .transport
                .create_append_blob(&self.inner.path, &conditions)
                .await
                .map_err(UploadError::open)?;
            0
        } else {
            let properties = self.inner.properties().await.map_err(UploadError::open)?;
            if properties.kind != BlobKind::Append {
                return Err(UploadError::InvalidArgument(format!(
                    "{} is a {}, not an append blob",
                    self.inner.path, properties.kind
                )));
            }
            conditions
                .check_etag_value(Some(&properties.etag))
                .map_err(UploadError::open)?;
            properties.content_length
        };

        Ok(self
            .inner
            .stream(Target::Append, conditions, options, start_offset))
    }

    pub async fn properties(&self) -> StorageResult<BlobProperties> {
        self.inner.properties().await
    }

    pub async fn download(&self) -> StorageResult<Bytes> {
        self.inner.download().await
    }
}

//! blobstream-rs: chunked, concurrent upload streams for blob storage.
//!
//! Writes to a [`BlobOutputStream`] are accumulated into fixed-size blocks.
//! Full blocks are dispatched in the background under a concurrency limit,
//! `flush` waits for every sealed block to be acknowledged and `close`
//! commits the blocks in submission order.
//!
//! The store is reached through the [`BlobTransport`] trait. The crate ships
//! [`StorageEmulator`], an in-process implementation backed by a metadata
//! store and an extent store.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use blobstream_rs::{AccessConditions, ContainerClient, StorageEmulator, UploadOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let container = ContainerClient::new(Arc::new(StorageEmulator::new()), "logs");
//!     container.create().await?;
//!
//!     let blob = container.block_blob_client("today.txt");
//!     let stream = blob
//!         .open_write(AccessConditions::default(), UploadOptions::new().with_concurrency(4))
//!         .await?;
//!     stream.write(b"hello ").await?;
//!     stream.write(b"world").await?;
//!     let summary = stream.close().await?;
//!     println!("committed {} bytes", summary.length);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod retry;
pub mod storage;
pub mod stream;
pub mod transport;

// Re-exports for convenience
pub use client::{AppendBlobClient, BlockBlobClient, ContainerClient, PageBlobClient};
pub use config::{Args, Config, UploadOptions, DEFAULT_BLOCK_SIZE};
pub use error::{ErrorCode, StorageError, StorageResult, UploadError, UploadResult};
pub use models::{AccessConditions, BlobKind, BlobPath, BlockId};
pub use retry::RetryPolicy;
pub use storage::{ExtentStore, FsExtentStore, MemoryExtentStore, MemoryMetadataStore, MetadataStore};
pub use stream::{BlobOutputStream, CommitSummary, UploadStats};
pub use transport::{BlobTransport, RequestEvent, RequestObserver, StorageEmulator};

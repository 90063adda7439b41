//! Common test utilities.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blobstream_rs::error::{ErrorCode, StorageError, StorageResult};
use blobstream_rs::models::{
    AccessConditions, BlobPath, BlobProperties, BlockId, BlockList, BlockListType,
};
use blobstream_rs::transport::CommitOptions;
use blobstream_rs::{
    BlobTransport, ContainerClient, RequestEvent, RequestObserver, RetryPolicy, StorageEmulator,
};

pub const CONTAINER: &str = "testcontainer";

/// Random payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Retry policy with short delays.
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::Linear {
        max_retries,
        delay: Duration::from_millis(1),
    }
}

/// Creates the test container on `transport` and returns its client.
pub async fn container(transport: Arc<dyn BlobTransport>) -> ContainerClient {
    let client = ContainerClient::new(transport, CONTAINER);
    client.create().await.unwrap();
    client
}

/// Emulator wrapper that injects latency and faults into data requests
/// (stage block, put pages, append block) and records what it saw.
#[derive(Default)]
pub struct FlakyTransport {
    inner: StorageEmulator,
    dispatch_delay: Option<Duration>,
    even_block_delay: Option<Duration>,
    /// Data call index -> error returned for that call.
    failures: Mutex<HashMap<usize, ErrorCode>>,
    transient_failures: AtomicU32,
    hung_attempts: AtomicU32,
    landed_then_busy: AtomicU32,
    lost_appends: AtomicU32,

    data_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    commits: AtomicUsize,
    /// Block sequence numbers in the order their staging completed.
    completion_order: Mutex<Vec<u64>>,
}

impl FlakyTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every data request sleeps for `delay` before reaching the store.
    pub fn with_dispatch_delay(mut self, delay: Duration) -> Self {
        self.dispatch_delay = Some(delay);
        self
    }

    /// Staging of even-numbered blocks is delayed by `delay`.
    pub fn with_even_block_delay(mut self, delay: Duration) -> Self {
        self.even_block_delay = Some(delay);
        self
    }

    /// The data request with zero-based index `call` fails with `code`.
    pub fn fail_call(self, call: usize, code: ErrorCode) -> Self {
        self.failures.lock().insert(call, code);
        self
    }

    /// The next `count` data requests fail with `ServerBusy`.
    pub fn with_transient_failures(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// The next `count` data requests never answer.
    pub fn with_hung_attempts(self, count: u32) -> Self {
        self.hung_attempts.store(count, Ordering::SeqCst);
        self
    }

    /// The next `count` appends land but report `ServerBusy`.
    pub fn with_landed_then_busy(self, count: u32) -> Self {
        self.landed_then_busy.store(count, Ordering::SeqCst);
        self
    }

    /// The next `count` appends report success without reaching the store.
    pub fn with_lost_appends(self, count: u32) -> Self {
        self.lost_appends.store(count, Ordering::SeqCst);
        self
    }

    pub fn data_calls(&self) -> usize {
        self.data_calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn completion_order(&self) -> Vec<u64> {
        self.completion_order.lock().clone()
    }

    async fn intercept(&self, sequence: Option<u64>) -> StorageResult<InFlightGuard<'_>> {
        let call = self.data_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlightGuard(&self.in_flight);

        if take_one(&self.hung_attempts) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if let Some(delay) = self.dispatch_delay {
            tokio::time::sleep(delay).await;
        }
        if let (Some(delay), Some(sequence)) = (self.even_block_delay, sequence) {
            if sequence % 2 == 0 {
                tokio::time::sleep(delay).await;
            }
        }

        if let Some(code) = self.failures.lock().remove(&call) {
            return Err(StorageError::new(code));
        }
        if take_one(&self.transient_failures) {
            return Err(StorageError::new(ErrorCode::ServerBusy));
        }

        Ok(guard)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobTransport for FlakyTransport {
    async fn create_container(&self, container: &str) -> StorageResult<()> {
        self.inner.create_container(container).await
    }

    async fn container_exists(&self, container: &str) -> bool {
        self.inner.container_exists(container).await
    }

    async fn stage_block(
        &self,
        path: &BlobPath,
        block_id: &BlockId,
        data: Bytes,
        content_md5: Option<String>,
    ) -> StorageResult<()> {
        let _guard = self.intercept(block_id.sequence()).await?;
        self.inner
            .stage_block(path, block_id, data, content_md5)
            .await?;
        if let Some(sequence) = block_id.sequence() {
            self.completion_order.lock().push(sequence);
        }
        Ok(())
    }

    async fn commit_block_list(
        &self,
        path: &BlobPath,
        blocks: &[BlockId],
        options: &CommitOptions,
    ) -> StorageResult<BlobProperties> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit_block_list(path, blocks, options).await
    }

    async fn get_block_list(
        &self,
        path: &BlobPath,
        list_type: BlockListType,
    ) -> StorageResult<BlockList> {
        self.inner.get_block_list(path, list_type).await
    }

    async fn create_page_blob(
        &self,
        path: &BlobPath,
        size: u64,
        conditions: &AccessConditions,
    ) -> StorageResult<BlobProperties> {
        self.inner.create_page_blob(path, size, conditions).await
    }

    async fn put_pages(
        &self,
        path: &BlobPath,
        offset: u64,
        data: Bytes,
        content_md5: Option<String>,
    ) -> StorageResult<()> {
        let _guard = self.intercept(None).await?;
        self.inner.put_pages(path, offset, data, content_md5).await
    }

    async fn create_append_blob(
        &self,
        path: &BlobPath,
        conditions: &AccessConditions,
    ) -> StorageResult<BlobProperties> {
        self.inner.create_append_blob(path, conditions).await
    }

    async fn append_block(
        &self,
        path: &BlobPath,
        data: Bytes,
        content_md5: Option<String>,
        conditions: &AccessConditions,
    ) -> StorageResult<u64> {
        let _guard = self.intercept(None).await?;
        if take_one(&self.lost_appends) {
            return Ok(conditions.append_position.unwrap_or_default());
        }
        let offset = self
            .inner
            .append_block(path, data, content_md5, conditions)
            .await?;
        if take_one(&self.landed_then_busy) {
            return Err(StorageError::new(ErrorCode::ServerBusy));
        }
        Ok(offset)
    }

    async fn set_content_md5(
        &self,
        path: &BlobPath,
        content_md5: Option<String>,
    ) -> StorageResult<BlobProperties> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.set_content_md5(path, content_md5).await
    }

    async fn get_properties(&self, path: &BlobPath) -> StorageResult<BlobProperties> {
        self.inner.get_properties(path).await
    }

    async fn download(&self, path: &BlobPath) -> StorageResult<Bytes> {
        self.inner.download(path).await
    }
}

/// Observer that records every completed request attempt.
#[derive(Default)]
pub struct RecordingObserver {
    sent: AtomicUsize,
    completed: Mutex<Vec<(RequestEvent, Option<ErrorCode>)>>,
}

impl RecordingObserver {
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> Vec<(RequestEvent, Option<ErrorCode>)> {
        self.completed.lock().clone()
    }
}

impl RequestObserver for RecordingObserver {
    fn on_sending(&self, _event: &RequestEvent) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }

    fn on_completed(&self, event: &RequestEvent, outcome: Result<(), &StorageError>) {
        self.completed
            .lock()
            .push((event.clone(), outcome.err().map(|e| e.code)));
    }
}

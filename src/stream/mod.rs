//! Chunked upload stream.
//!
//! [`BlobOutputStream`] accumulates writes into fixed-size blocks and hands
//! every full block to a spawned dispatch task. At most `concurrency`
//! dispatches run at once; a write that seals a block while every slot is
//! busy waits for one to free up. `flush` waits for the blocks sealed so far
//! to be acknowledged and `close` commits them in submission order.
//!
//! A dispatch failure is recorded on the stream and re-raised from the next
//! `write`, `flush` or `close`.

mod ledger;

pub use ledger::{DispatchState, Ledger, PendingBlock};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::UploadOptions;
use crate::error::{ErrorCode, StorageError, StorageResult, UploadError, UploadResult};
use crate::models::{AccessConditions, BlobKind, BlobPath, BlobProperties, BlockId, PAGE_SIZE};
use crate::retry::is_absorbable;
use crate::transport::{BlobTransport, CommitOptions, Operation, RequestEvent};

/// Kind-specific state of the blob a stream writes to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Target {
    Block,
    /// Fixed-size page blob, created when the stream was opened.
    Page { size: u64 },
    Append,
}

impl Target {
    fn kind(&self) -> BlobKind {
        match self {
            Target::Block => BlobKind::Block,
            Target::Page { .. } => BlobKind::Page,
            Target::Append => BlobKind::Append,
        }
    }

    fn operation(&self) -> Operation {
        match self {
            Target::Block => Operation::StageBlock,
            Target::Page { .. } => Operation::PutPages,
            Target::Append => Operation::AppendBlock,
        }
    }
}

/// Outcome of a successful [`BlobOutputStream::close`].
#[derive(Debug, Clone, Serialize)]
pub struct CommitSummary {
    pub path: BlobPath,
    pub kind: BlobKind,
    /// Number of blocks this session dispatched.
    pub blocks: usize,
    /// Length of the blob after the commit.
    pub length: u64,
    pub etag: String,
    pub content_md5: Option<String>,
}

/// Point-in-time counters of an upload session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    pub bytes_written: u64,
    pub blocks_sealed: usize,
    pub blocks_acknowledged: usize,
    pub bytes_acknowledged: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Committed,
    Failed,
}

/// State owned by the caller side of the stream.
struct WriteState {
    phase: Phase,
    buffer: BytesMut,
    /// Blob offset of the next sealed block.
    next_offset: u64,
    hasher: Option<Md5>,
}

/// State shared with the dispatch tasks.
struct Shared {
    transport: Arc<dyn BlobTransport>,
    path: BlobPath,
    target: Target,
    conditions: AccessConditions,
    options: UploadOptions,
    slots: Arc<Semaphore>,
    ledger: parking_lot::Mutex<Ledger>,
    /// Bumped every time a block settles.
    progress: watch::Sender<u64>,
    failure: parking_lot::Mutex<Option<UploadError>>,
    /// Length of the blob before this session's first byte.
    start_offset: u64,
    bytes_written: AtomicU64,
}

/// Buffered, concurrently dispatching writer for a single blob.
///
/// Obtained from the `open_write` method of a blob client.
pub struct BlobOutputStream {
    shared: Arc<Shared>,
    state: Mutex<WriteState>,
}

impl BlobOutputStream {
    pub(crate) fn new(
        transport: Arc<dyn BlobTransport>,
        path: BlobPath,
        target: Target,
        conditions: AccessConditions,
        options: UploadOptions,
        start_offset: u64,
    ) -> Self {
        // A digest of this session's bytes only describes the blob when the
        // session writes all of it.
        let hasher = (options.store_content_md5 && start_offset == 0).then(Md5::new);
        let (progress, _) = watch::channel(0);

        debug!(
            "Opened {} stream for {} (block size {}, concurrency {})",
            target.kind(),
            path,
            options.block_size,
            options.concurrency
        );

        Self {
            state: Mutex::new(WriteState {
                phase: Phase::Open,
                buffer: BytesMut::with_capacity(options.block_size),
                next_offset: start_offset,
                hasher,
            }),
            shared: Arc::new(Shared {
                transport,
                path,
                target,
                conditions,
                slots: Arc::new(Semaphore::new(options.concurrency)),
                options,
                ledger: parking_lot::Mutex::new(Ledger::new()),
                progress,
                failure: parking_lot::Mutex::new(None),
                start_offset,
                bytes_written: AtomicU64::new(0),
            }),
        }
    }

    pub fn path(&self) -> &BlobPath {
        &self.shared.path
    }

    pub fn kind(&self) -> BlobKind {
        self.shared.target.kind()
    }

    pub fn block_size(&self) -> usize {
        self.shared.options.block_size
    }

    /// Buffers `data`, dispatching every block it completes.
    ///
    /// Suspends while all dispatch slots are busy and a new block is ready.
    pub async fn write(&self, data: &[u8]) -> UploadResult<()> {
        let mut state = self.state.lock().await;
        self.check_open(&state)?;

        if let Target::Page { size } = self.shared.target {
            let end = state.next_offset + state.buffer.len() as u64 + data.len() as u64;
            if end > size {
                return Err(UploadError::InvalidArgument(format!(
                    "write ends at byte {} but the page blob holds {} bytes",
                    end, size
                )));
            }
        }

        // A write dropped while it waits for a slot has only buffered part
        // of `data`, which leaves the stream unable to commit.
        let mut cancelled = CancelGuard {
            shared: &self.shared,
            armed: true,
        };
        let result = self.buffer(&mut state, data).await;
        cancelled.armed = false;
        result
    }

    async fn buffer(&self, state: &mut WriteState, data: &[u8]) -> UploadResult<()> {
        let block_size = self.shared.options.block_size;
        let mut rest = data;
        while !rest.is_empty() {
            let take = (block_size - state.buffer.len()).min(rest.len());
            let (chunk, tail) = rest.split_at(take);
            if let Some(hasher) = state.hasher.as_mut() {
                hasher.update(chunk);
            }
            state.buffer.extend_from_slice(chunk);
            self.shared
                .bytes_written
                .fetch_add(take as u64, Ordering::SeqCst);
            rest = tail;

            if state.buffer.len() == block_size {
                self.dispatch(state).await?;
            }
        }

        Ok(())
    }

    /// Dispatches buffered data and waits until every block sealed so far has
    /// been acknowledged. Does not commit.
    pub async fn flush(&self) -> UploadResult<()> {
        let mut state = self.state.lock().await;
        self.check_open(&state)?;
        self.seal_partial(&mut state).await?;
        let sealed = self.shared.ledger.lock().len();
        // Writes may continue while this flush waits.
        drop(state);

        self.shared.wait_settled(sealed).await;
        match self.shared.recorded_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Flushes remaining data and commits every block in submission order.
    ///
    /// A stream can be closed once. Later calls, and calls after a failed
    /// close, return [`UploadError::StreamClosed`].
    pub async fn close(&self) -> UploadResult<CommitSummary> {
        let mut state = self.state.lock().await;
        if state.phase != Phase::Open {
            return Err(UploadError::StreamClosed);
        }

        let result = match self.shared.recorded_failure() {
            Some(err) => Err(err),
            None => self.finish(&mut state).await,
        };

        match &result {
            Ok(summary) => {
                state.phase = Phase::Committed;
                debug!(
                    "Committed {} blocks ({} bytes) to {}",
                    summary.blocks, summary.length, summary.path
                );
            }
            Err(err) => {
                state.phase = Phase::Failed;
                warn!("Upload to {} failed: {}", self.shared.path, err);
            }
        }
        result
    }

    pub fn stats(&self) -> UploadStats {
        let ledger = self.shared.ledger.lock();
        UploadStats {
            bytes_written: self.shared.bytes_written.load(Ordering::SeqCst),
            blocks_sealed: ledger.len(),
            blocks_acknowledged: ledger.acknowledged(),
            bytes_acknowledged: ledger.bytes_acknowledged(),
            in_flight: ledger.in_flight(),
            peak_in_flight: ledger.peak_in_flight(),
        }
    }

    fn check_open(&self, state: &WriteState) -> UploadResult<()> {
        if state.phase != Phase::Open {
            return Err(UploadError::StreamClosed);
        }
        match self.shared.recorded_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn seal_partial(&self, state: &mut WriteState) -> UploadResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        if matches!(self.shared.target, Target::Page { .. })
            && state.buffer.len() as u64 % PAGE_SIZE != 0
        {
            return Err(UploadError::InvalidArgument(format!(
                "page blob data must be flushed in multiples of {} bytes, {} are buffered",
                PAGE_SIZE,
                state.buffer.len()
            )));
        }
        self.dispatch(state).await
    }

    /// Waits for a free slot, then seals the buffered data as the next block
    /// and spawns its dispatch. The buffer is left untouched until a slot is
    /// held.
    async fn dispatch(&self, state: &mut WriteState) -> UploadResult<()> {
        let permit = self
            .shared
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| UploadError::StreamClosed)?;

        // Another block may have failed while this one waited for a slot.
        if let Some(err) = self.shared.recorded_failure() {
            return Err(err);
        }

        let data = state.buffer.split().freeze();
        let len = data.len() as u64;
        let block = {
            let mut ledger = self.shared.ledger.lock();
            let block = ledger.seal(state.next_offset, len);
            ledger.start(block.sequence);
            block
        };
        state.next_offset += len;

        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.run_dispatch(block, data, permit).await;
        });
        Ok(())
    }

    async fn finish(&self, state: &mut WriteState) -> UploadResult<CommitSummary> {
        self.seal_partial(state).await?;
        let sealed = self.shared.ledger.lock().len();
        self.shared.wait_settled(sealed).await;
        if let Some(err) = self.shared.recorded_failure() {
            return Err(err);
        }

        let (ids, bytes_acknowledged) = {
            let ledger = self.shared.ledger.lock();
            if !ledger.all_acknowledged() {
                return Err(UploadError::CommitFailed(StorageError::with_message(
                    ErrorCode::InternalError,
                    "not every block was acknowledged",
                )));
            }
            (ledger.commit_order(), ledger.bytes_acknowledged())
        };

        let bytes_written = self.shared.bytes_written.load(Ordering::SeqCst);
        if bytes_acknowledged != bytes_written {
            return Err(UploadError::CommitFailed(StorageError::with_message(
                ErrorCode::InternalError,
                format!(
                    "{} bytes written but {} acknowledged",
                    bytes_written, bytes_acknowledged
                ),
            )));
        }

        let mut content_md5 = state
            .hasher
            .take()
            .map(|hasher| BASE64.encode(hasher.finalize()));
        if let Target::Page { size } = self.shared.target {
            // Unwritten pages read back as zeros.
            if bytes_written != size {
                content_md5 = None;
            }
        }

        let properties = self
            .shared
            .commit(&ids, bytes_written, content_md5)
            .await
            .map_err(UploadError::commit)?;

        let expected = match self.shared.target {
            Target::Page { size } => size,
            Target::Block | Target::Append => self.shared.start_offset + bytes_written,
        };
        if properties.content_length != expected {
            return Err(UploadError::CommitFailed(StorageError::with_message(
                ErrorCode::InternalError,
                format!(
                    "committed blob holds {} bytes, expected {}",
                    properties.content_length, expected
                ),
            )));
        }

        Ok(CommitSummary {
            path: self.shared.path.clone(),
            kind: self.shared.target.kind(),
            blocks: ids.len(),
            length: properties.content_length,
            etag: properties.etag,
            content_md5: properties.content_md5,
        })
    }
}

impl fmt::Debug for BlobOutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobOutputStream")
            .field("path", &self.shared.path)
            .field("kind", &self.kind())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for BlobOutputStream {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.phase == Phase::Open && self.shared.bytes_written.load(Ordering::SeqCst) > 0 {
            warn!(
                "Upload stream for {} dropped without close, {} bytes abandoned",
                self.shared.path,
                self.shared.bytes_written.load(Ordering::SeqCst)
            );
        }
    }
}

/// Records [`UploadError::WriteCancelled`] unless disarmed before it drops.
struct CancelGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Write to {} was cancelled mid-block", self.shared.path);
            self.shared
                .failure
                .lock()
                .get_or_insert(UploadError::WriteCancelled);
        }
    }
}

impl Shared {
    fn recorded_failure(&self) -> Option<UploadError> {
        self.failure.lock().clone()
    }

    fn notify_progress(&self) {
        self.progress.send_modify(|settled| *settled += 1);
    }

    async fn wait_settled(&self, count: usize) {
        let mut progress = self.progress.subscribe();
        loop {
            if self.ledger.lock().settled(count) {
                return;
            }
            if progress.changed().await.is_err() {
                return;
            }
        }
    }

    async fn run_dispatch(&self, block: PendingBlock, data: Bytes, permit: OwnedSemaphorePermit) {
        let result = self.send_block(&block, data).await;

        match result {
            Ok(()) => {
                self.ledger.lock().acknowledge(block.sequence);
                debug!(
                    "Block {} ({} bytes at {}) acknowledged for {}",
                    block.sequence, block.len, block.offset, self.path
                );
            }
            Err(err) => {
                warn!("Block {} for {} failed: {}", block.sequence, self.path, err);
                self.failure.lock().get_or_insert(err);
                self.ledger.lock().fail(block.sequence);
            }
        }

        drop(permit);
        self.notify_progress();
    }

    async fn send_block(&self, block: &PendingBlock, data: Bytes) -> UploadResult<()> {
        let md5 = self
            .options
            .use_transactional_md5
            .then(|| BASE64.encode(Md5::digest(&data)));
        let event = RequestEvent {
            operation: self.target.operation(),
            path: self.path.clone(),
            block_id: matches!(self.target, Target::Block).then(|| block.id.clone()),
            offset: (!matches!(self.target, Target::Block)).then_some(block.offset),
            length: block.len,
            attempt: 0,
        };

        let result = match self.target {
            Target::Block => {
                self.send(&event, |_| {
                    self.transport
                        .stage_block(&self.path, &block.id, data.clone(), md5.clone())
                })
                .await
            }
            Target::Page { .. } => {
                self.send(&event, |_| {
                    self.transport
                        .put_pages(&self.path, block.offset, data.clone(), md5.clone())
                })
                .await
            }
            Target::Append => {
                let conditions = AccessConditions {
                    append_position: Some(block.offset),
                    max_size: self.conditions.max_size,
                    ..Default::default()
                };
                let absorb = self.options.absorb_conditional_errors_on_retry;
                let transport = &self.transport;
                let path = &self.path;
                self.send(&event, |attempt| {
                    let request =
                        transport.append_block(path, data.clone(), md5.clone(), &conditions);
                    async move {
                        match request.await {
                            Ok(_) => Ok(()),
                            Err(err) if absorb && attempt > 0 && is_absorbable(&err) => {
                                let landed = transport.get_properties(path).await?;
                                if landed.content_length < block.offset + block.len {
                                    return Err(err);
                                }
                                warn!(
                                    "Treating {} on retry of block at {} as already appended",
                                    err.code.as_str(),
                                    block.offset
                                );
                                Ok(())
                            }
                            Err(err) => Err(err),
                        }
                    }
                })
                .await
            }
        };

        result.map_err(|err| UploadError::dispatch(block.id.as_str(), err))
    }

    async fn commit(
        &self,
        ids: &[BlockId],
        length: u64,
        content_md5: Option<String>,
    ) -> StorageResult<BlobProperties> {
        match self.target {
            Target::Block => {
                let event = RequestEvent {
                    operation: Operation::CommitBlockList,
                    path: self.path.clone(),
                    block_id: None,
                    offset: None,
                    length,
                    attempt: 0,
                };
                let options = CommitOptions {
                    conditions: self.conditions.clone(),
                    content_md5,
                };
                self.send(&event, |_| {
                    self.transport.commit_block_list(&self.path, ids, &options)
                })
                .await
            }
            Target::Page { .. } | Target::Append if content_md5.is_some() => {
                let event = RequestEvent {
                    operation: Operation::SetContentMd5,
                    path: self.path.clone(),
                    block_id: None,
                    offset: None,
                    length: 0,
                    attempt: 0,
                };
                self.send(&event, |_| {
                    self.transport
                        .set_content_md5(&self.path, content_md5.clone())
                })
                .await
            }
            // Every block already landed in place.
            Target::Page { .. } | Target::Append => self.transport.get_properties(&self.path).await,
        }
    }

    /// Sends a request through the retry policy, applying the request timeout
    /// and notifying the observer around every attempt.
    async fn send<T, F, Fut>(&self, event: &RequestEvent, request: F) -> StorageResult<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let observer = self.options.observer.as_ref();
        self.options
            .retry
            .run(|attempt| {
                let event = RequestEvent {
                    attempt,
                    ..event.clone()
                };
                let pending = request(attempt);
                async move {
                    if let Some(observer) = observer {
                        observer.on_sending(&event);
                    }
                    let outcome = match self.options.request_timeout {
                        Some(limit) => tokio::time::timeout(limit, pending)
                            .await
                            .unwrap_or_else(|_| Err(StorageError::new(ErrorCode::OperationTimedOut))),
                        None => pending.await,
                    };
                    if let Some(observer) = observer {
                        observer.on_completed(&event, outcome.as_ref().map(|_| ()));
                    }
                    outcome
                }
            })
            .await
    }
}

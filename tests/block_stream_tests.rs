//! Block blob upload stream tests.

mod common;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use md5::{Digest, Md5};
use std::sync::Arc;
use std::time::Duration;

use blobstream_rs::models::BlockListType;
use blobstream_rs::transport::Operation;
use blobstream_rs::{
    AccessConditions, ErrorCode, RetryPolicy, StorageEmulator, UploadError, UploadOptions,
};
use common::{container, fast_retry, payload, FlakyTransport, RecordingObserver};

fn options(block_size: usize, concurrency: usize) -> UploadOptions {
    UploadOptions::new()
        .with_block_size(block_size)
        .with_concurrency(concurrency)
        .with_retry(fast_retry(3))
}

#[tokio::test]
async fn test_end_to_end_commit() {
    let container = container(Arc::new(StorageEmulator::new())).await;
    let blob = container.block_blob_client("ten-blocks.bin");

    let data = payload(5120);
    let stream = blob
        .open_write(AccessConditions::default(), options(512, 4))
        .await
        .unwrap();
    for chunk in data.chunks(512) {
        stream.write(chunk).await.unwrap();
    }
    let summary = stream.close().await.unwrap();

    assert_eq!(summary.blocks, 10);
    assert_eq!(summary.length, 5120);
    assert_eq!(
        summary.content_md5.as_deref(),
        Some(BASE64.encode(Md5::digest(&data)).as_str())
    );

    let body = blob.download().await.unwrap();
    assert_eq!(&body[..], &data[..]);

    let list = blob.block_list(BlockListType::All).await.unwrap();
    assert_eq!(list.committed.len(), 10);
    assert!(list.uncommitted.is_empty());
    let sequences: Vec<u64> = list
        .committed
        .iter()
        .map(|b| b.block_id.sequence().unwrap())
        .collect();
    assert_eq!(sequences, (0..10).collect::<Vec<_>>());
    assert!(list.committed.iter().all(|b| b.size == 512));
}

#[tokio::test]
async fn test_writes_spanning_block_boundaries() {
    let container = container(Arc::new(StorageEmulator::new())).await;
    let blob = container.block_blob_client("uneven.bin");

    let data = payload(3000);
    let stream = blob
        .open_write(AccessConditions::default(), options(1024, 2))
        .await
        .unwrap();
    for chunk in data.chunks(333) {
        stream.write(chunk).await.unwrap();
    }
    let summary = stream.close().await.unwrap();

    // Two full blocks plus the 952-byte tail.
    assert_eq!(summary.blocks, 3);
    assert_eq!(summary.length, 3000);
    assert_eq!(&blob.download().await.unwrap()[..], &data[..]);
}

#[tokio::test]
async fn test_commit_order_is_submission_order() {
    let transport = Arc::new(FlakyTransport::new().with_even_block_delay(Duration::from_millis(30)));
    let container = container(transport.clone()).await;
    let blob = container.block_blob_client("ordered.bin");

    let data = payload(8 * 256);
    let stream = blob
        .open_write(AccessConditions::default(), options(256, 4))
        .await
        .unwrap();
    for chunk in data.chunks(256) {
        stream.write(chunk).await.unwrap();
    }
    stream.close().await.unwrap();

    let completed = transport.completion_order();
    assert_eq!(completed.len(), 8);
    let mut sorted = completed.clone();
    sorted.sort_unstable();
    assert_ne!(completed, sorted, "odd blocks should finish first");

    let list = blob.block_list(BlockListType::Committed).await.unwrap();
    let committed: Vec<u64> = list
        .committed
        .iter()
        .map(|b| b.block_id.sequence().unwrap())
        .collect();
    assert_eq!(committed, (0..8).collect::<Vec<_>>());
    assert_eq!(&blob.download().await.unwrap()[..], &data[..]);
}

#[tokio::test]
async fn test_backpressure_limits_in_flight() {
    let transport = Arc::new(FlakyTransport::new().with_dispatch_delay(Duration::from_millis(20)));
    let container = container(transport.clone()).await;
    let blob = container.block_blob_client("throttled.bin");

    let stream = blob
        .open_write(AccessConditions::default(), options(128, 3))
        .await
        .unwrap();
    for _ in 0..12 {
        stream.write(&payload(128)).await.unwrap();
        assert!(stream.stats().in_flight <= 3);
    }
    let stats = stream.stats();
    stream.close().await.unwrap();

    assert_eq!(transport.peak_in_flight(), 3);
    assert_eq!(stats.peak_in_flight, 3);
    assert_eq!(stats.blocks_sealed, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flush_waits_for_sealed_blocks() {
    let transport = Arc::new(FlakyTransport::new().with_dispatch_delay(Duration::from_millis(50)));
    let container = container(transport.clone()).await;
    let blob = container.block_blob_client("flushed.bin");

    let stream = Arc::new(
        blob.open_write(AccessConditions::default(), options(512, 2))
            .await
            .unwrap(),
    );
    let first = payload(511);
    let second = payload(513);
    stream.write(&first).await.unwrap();

    let flusher = {
        let stream = stream.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            stream.flush().await.unwrap();
            transport.completion_order()
        })
    };
    let writer = {
        let stream = stream.clone();
        let second = second.clone();
        tokio::spawn(async move { stream.write(&second).await.unwrap() })
    };

    let acknowledged_at_flush = flusher.await.unwrap();
    writer.await.unwrap();
    assert!(
        acknowledged_at_flush.contains(&0),
        "flush returned before the first block was acknowledged"
    );

    let summary = stream.close().await.unwrap();
    assert_eq!(summary.length, 1024);

    let mut expected = first;
    expected.extend_from_slice(&second);
    assert_eq!(&blob.download().await.unwrap()[..], &expected[..]);
}

#[tokio::test]
async fn test_flush_does_not_commit() {
    let container = container(Arc::new(StorageEmulator::new())).await;
    let blob = container.block_blob_client("staged-only.bin");

    let stream = blob
        .open_write(AccessConditions::default(), options(512, 1))
        .await
        .unwrap();
    stream.write(&payload(700)).await.unwrap();
    stream.flush().await.unwrap();
    // Nothing new to flush.
    stream.flush().await.unwrap();

    let stats = stream.stats();
    assert_eq!(stats.blocks_sealed, 2);
    assert_eq!(stats.blocks_acknowledged, 2);
    assert_eq!(stats.bytes_acknowledged, 700);

    let list = blob.block_list(BlockListType::All).await.unwrap();
    assert!(list.committed.is_empty());
    assert_eq!(list.uncommitted.len(), 2);
    assert!(blob.properties().await.is_err());

    stream.close().await.unwrap();
    assert_eq!(blob.properties().await.unwrap().content_length, 700);
}

#[tokio::test]
async fn test_second_close_fails() {
    let transport = Arc::new(FlakyTransport::new());
    let container = container(transport.clone()).await;
    let blob = container.block_blob_client("closed-twice.bin");

    let stream = blob
        .open_write(AccessConditions::default(), options(512, 1))
        .await
        .unwrap();
    stream.write(&payload(1000)).await.unwrap();
    stream.close().await.unwrap();

    let err = stream.close().await.unwrap_err();
    assert!(matches!(err, UploadError::StreamClosed));
    assert_eq!(transport.commits(), 1);
}

#[tokio::test]
async fn test_write_after_close_fails() {
    let container = container(Arc::new(StorageEmulator::new())).await;
    let blob = container.block_blob_client("after-close.bin");

    let stream = blob
        .open_write(AccessConditions::default(), options(512, 1))
        .await
        .unwrap();
    stream.write(&payload(512)).await.unwrap();
    stream.close().await.unwrap();
    let before = stream.stats();

    let err = stream.write(&payload(2048)).await.unwrap_err();
    assert!(matches!(err, UploadError::StreamClosed));
    let err = stream.flush().await.unwrap_err();
    assert!(matches!(err, UploadError::StreamClosed));
    assert_eq!(stream.stats(), before);
}

#[tokio::test]
async fn test_empty_stream_commits_empty_blob() {
    let container = container(Arc::new(StorageEmulator::new())).await;
    let blob = container.block_blob_client("empty.bin");

    let stream = blob
        .open_write(AccessConditions::default(), options(512, 1))
        .await
        .unwrap();
    let summary = stream.close().await.unwrap();

    assert_eq!(summary.blocks, 0);
    assert_eq!(summary.length, 0);
    assert!(blob.download().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_max_size_precondition_fails_commit() {
    let transport = Arc::new(FlakyTransport::new());
    let container = container(transport.clone()).await;
    let blob = container.block_blob_client("too-big.bin");

    let stream = blob
        .open_write(AccessConditions::new().max_size(4096), options(512, 2))
        .await
        .unwrap();
    for _ in 0..10 {
        stream.write(&payload(512)).await.unwrap();
    }

    let err = stream.close().await.unwrap_err();
    assert!(matches!(err, UploadError::PreconditionFailed(_)));
    assert_eq!(err.code(), Some(ErrorCode::MaxBlobSizeConditionNotMet));

    let err = blob.properties().await.unwrap_err();
    assert_eq!(err.code, ErrorCode::BlobNotFound);
    let list = blob.block_list(BlockListType::Uncommitted).await.unwrap();
    assert_eq!(list.uncommitted.len(), 10);

    assert!(matches!(
        stream.close().await.unwrap_err(),
        UploadError::StreamClosed
    ));
    assert_eq!(transport.commits(), 1);
}

#[tokio::test]
async fn test_if_not_exists_rejects_overwrite() {
    let container = container(Arc::new(StorageEmulator::new())).await;
    let blob = container.block_blob_client("once.bin");

    let stream = blob
        .open_write(AccessConditions::if_not_exists(), options(512, 1))
        .await
        .unwrap();
    stream.write(b"first").await.unwrap();
    stream.close().await.unwrap();

    let stream = blob
        .open_write(AccessConditions::if_not_exists(), options(512, 1))
        .await
        .unwrap();
    stream.write(b"second").await.unwrap();
    let err = stream.close().await.unwrap_err();
    assert!(matches!(err, UploadError::PreconditionFailed(_)));
    assert_eq!(&blob.download().await.unwrap()[..], b"first");
}

#[tokio::test]
async fn test_if_match_etag() {
    let container = container(Arc::new(StorageEmulator::new())).await;
    let blob = container.block_blob_client("versioned.bin");

    let stream = blob
        .open_write(AccessConditions::default(), options(512, 1))
        .await
        .unwrap();
    stream.write(b"v1").await.unwrap();
    let etag = stream.close().await.unwrap().etag;

    let stream = blob
        .open_write(AccessConditions::new().if_match(etag.clone()), options(512, 1))
        .await
        .unwrap();
    stream.write(b"v2").await.unwrap();
    let summary = stream.close().await.unwrap();
    assert_ne!(summary.etag, etag);

    // The ETag changed with the last commit.
    let stream = blob
        .open_write(AccessConditions::new().if_match(etag), options(512, 1))
        .await
        .unwrap();
    stream.write(b"v3").await.unwrap();
    let err = stream.close().await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::ConditionNotMet));
    assert_eq!(&blob.download().await.unwrap()[..], b"v2");
}

#[tokio::test]
async fn test_dispatch_failure_is_fail_fast() {
    let transport =
        Arc::new(FlakyTransport::new().fail_call(2, ErrorCode::AuthorizationFailure));
    let container = container(transport.clone()).await;
    let blob = container.block_blob_client("denied.bin");

    let stream = blob
        .open_write(AccessConditions::default(), options(256, 1))
        .await
        .unwrap();

    let mut first_error = None;
    for _ in 0..10 {
        if let Err(err) = stream.write(&payload(256)).await {
            first_error = Some(err);
            break;
        }
    }
    let err = match first_error {
        Some(err) => err,
        None => stream.flush().await.unwrap_err(),
    };
    assert!(matches!(err, UploadError::DispatchFailure { .. }));
    assert_eq!(err.code(), Some(ErrorCode::AuthorizationFailure));

    // Recorded failures are re-raised and nothing is committed.
    assert!(matches!(
        stream.write(b"more").await.unwrap_err(),
        UploadError::DispatchFailure { .. }
    ));
    assert!(matches!(
        stream.close().await.unwrap_err(),
        UploadError::DispatchFailure { .. }
    ));
    assert!(matches!(
        stream.close().await.unwrap_err(),
        UploadError::StreamClosed
    ));
    assert_eq!(transport.commits(), 0);
    assert_eq!(transport.data_calls(), 3);
    assert!(blob.properties().await.is_err());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let transport = Arc::new(FlakyTransport::new().with_transient_failures(2));
    let container = container(transport.clone()).await;
    let blob = container.block_blob_client("retried.bin");

    let data = payload(4 * 512);
    let stream = blob
        .open_write(AccessConditions::default(), options(512, 1))
        .await
        .unwrap();
    stream.write(&data).await.unwrap();
    let summary = stream.close().await.unwrap();

    assert_eq!(summary.blocks, 4);
    assert_eq!(transport.data_calls(), 6);
    assert_eq!(&blob.download().await.unwrap()[..], &data[..]);
}

#[tokio::test]
async fn test_exhausted_retries_surface_dispatch_failure() {
    let transport = Arc::new(FlakyTransport::new().with_transient_failures(100));
    let container = container(transport.clone()).await;
    let blob = container.block_blob_client("busy.bin");

    let stream = blob
        .open_write(
            AccessConditions::default(),
            options(512, 1).with_retry(fast_retry(2)),
        )
        .await
        .unwrap();
    stream.write(&payload(100)).await.unwrap();

    let err = stream.flush().await.unwrap_err();
    assert!(matches!(err, UploadError::DispatchFailure { .. }));
    assert_eq!(err.code(), Some(ErrorCode::ServerBusy));
    assert_eq!(transport.data_calls(), 3);
}

#[tokio::test]
async fn test_no_retry_policy() {
    let transport = Arc::new(FlakyTransport::new().with_transient_failures(1));
    let container = container(transport.clone()).await;
    let blob = container.block_blob_client("once.bin");

    let stream = blob
        .open_write(
            AccessConditions::default(),
            options(512, 1).with_retry(RetryPolicy::None),
        )
        .await
        .unwrap();
    stream.write(&payload(10)).await.unwrap();

    assert!(stream.close().await.is_err());
    assert_eq!(transport.data_calls(), 1);
}

#[tokio::test]
async fn test_request_timeout_is_retried() {
    let transport = Arc::new(FlakyTransport::new().with_hung_attempts(1));
    let observer = Arc::new(RecordingObserver::default());
    let container = container(transport.clone()).await;
    let blob = container.block_blob_client("slow.bin");

    let stream = blob
        .open_write(
            AccessConditions::default(),
            options(512, 1)
                .with_request_timeout(Duration::from_millis(50))
                .with_observer(observer.clone()),
        )
        .await
        .unwrap();
    stream.write(&payload(512)).await.unwrap();
    stream.close().await.unwrap();

    let outcomes: Vec<_> = observer
        .completed()
        .into_iter()
        .filter(|(event, _)| event.operation == Operation::StageBlock)
        .map(|(event, code)| (event.attempt, code))
        .collect();
    assert_eq!(
        outcomes,
        vec![(0, Some(ErrorCode::OperationTimedOut)), (1, None)]
    );
}

#[tokio::test]
async fn test_transactional_md5() {
    let container = container(Arc::new(StorageEmulator::new())).await;
    let blob = container.block_blob_client("hashed.bin");

    let data = payload(2000);
    let stream = blob
        .open_write(
            AccessConditions::default(),
            options(512, 2).with_transactional_md5(true),
        )
        .await
        .unwrap();
    stream.write(&data).await.unwrap();
    let summary = stream.close().await.unwrap();

    let expected = BASE64.encode(Md5::digest(&data));
    assert_eq!(summary.content_md5.as_deref(), Some(expected.as_str()));
    assert_eq!(
        blob.properties().await.unwrap().content_md5.as_deref(),
        Some(expected.as_str())
    );
}

#[tokio::test]
async fn test_content_md5_can_be_disabled() {
    let container = container(Arc::new(StorageEmulator::new())).await;
    let blob = container.block_blob_client("unhashed.bin");

    let stream = blob
        .open_write(
            AccessConditions::default(),
            options(512, 1).with_content_md5(false),
        )
        .await
        .unwrap();
    stream.write(&payload(600)).await.unwrap();
    let summary = stream.close().await.unwrap();

    assert!(summary.content_md5.is_none());
    assert!(blob.properties().await.unwrap().content_md5.is_none());
}

#[tokio::test]
async fn test_observer_sees_every_request() {
    let observer = Arc::new(RecordingObserver::default());
    let container = container(Arc::new(StorageEmulator::new())).await;
    let blob = container.block_blob_client("observed.bin");

    let stream = blob
        .open_write(
            AccessConditions::default(),
            options(512, 2).with_observer(observer.clone()),
        )
        .await
        .unwrap();
    stream.write(&payload(1300)).await.unwrap();
    stream.close().await.unwrap();

    let completed = observer.completed();
    assert_eq!(observer.sent(), 4);
    assert_eq!(completed.len(), 4);

    let staged: Vec<_> = completed
        .iter()
        .filter(|(event, _)| event.operation == Operation::StageBlock)
        .collect();
    assert_eq!(staged.len(), 3);
    assert!(staged
        .iter()
        .all(|(event, code)| event.block_id.is_some() && code.is_none()));
    let staged_bytes: u64 = staged.iter().map(|(event, _)| event.length).sum();
    assert_eq!(staged_bytes, 1300);

    let (commit, code) = completed.last().unwrap();
    assert_eq!(commit.operation, Operation::CommitBlockList);
    assert_eq!(commit.length, 1300);
    assert!(code.is_none());
}

#[tokio::test]
async fn test_invalid_options() {
    let container = container(Arc::new(StorageEmulator::new())).await;
    let blob = container.block_blob_client("invalid.bin");

    let err = blob
        .open_write(AccessConditions::default(), options(0, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::InvalidArgument(_)));

    let err = blob
        .open_write(AccessConditions::default(), options(512, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_dropped_stream_is_not_committed() {
    let transport = Arc::new(FlakyTransport::new());
    let container = container(transport.clone()).await;
    let blob = container.block_blob_client("abandoned.bin");

    let stream = blob
        .open_write(AccessConditions::default(), options(512, 1))
        .await
        .unwrap();
    stream.write(&payload(2048)).await.unwrap();
    drop(stream);

    assert_eq!(transport.commits(), 0);
    assert!(blob.properties().await.is_err());
}

#[tokio::test]
async fn test_cancelled_write_fails_the_stream() {
    let transport = Arc::new(FlakyTransport::new().with_dispatch_delay(Duration::from_millis(300)));
    let container = container(transport.clone()).await;
    let blob = container.block_blob_client("cancelled.bin");

    let stream = blob
        .open_write(AccessConditions::default(), options(512, 1))
        .await
        .unwrap();
    stream.write(&payload(512)).await.unwrap();

    // The only slot is busy, so this write is dropped while waiting for it.
    let cancelled =
        tokio::time::timeout(Duration::from_millis(20), stream.write(&payload(512))).await;
    assert!(cancelled.is_err());

    let flushed = tokio::time::timeout(Duration::from_secs(2), stream.flush())
        .await
        .expect("flush must not hang after a cancelled write");
    assert!(matches!(flushed, Err(UploadError::WriteCancelled)));

    let closed = tokio::time::timeout(Duration::from_secs(2), stream.close())
        .await
        .expect("close must not hang after a cancelled write");
    assert!(matches!(closed, Err(UploadError::WriteCancelled)));
    assert_eq!(transport.commits(), 0);
}

#[tokio::test]
async fn test_cancelled_flush_keeps_buffered_data() {
    let transport = Arc::new(FlakyTransport::new().with_dispatch_delay(Duration::from_millis(100)));
    let container = container(transport.clone()).await;
    let blob = container.block_blob_client("retried-flush.bin");

    let data = payload(800);
    let stream = blob
        .open_write(AccessConditions::default(), options(512, 1))
        .await
        .unwrap();
    stream.write(&data).await.unwrap();

    // The partial block waits for the slot held by the first block.
    let cancelled = tokio::time::timeout(Duration::from_millis(10), stream.flush()).await;
    assert!(cancelled.is_err());

    let summary = stream.close().await.unwrap();
    assert_eq!(summary.length, 800);
    assert_eq!(summary.blocks, 2);
    assert_eq!(&blob.download().await.unwrap()[..], &data[..]);
}

#[tokio::test]
async fn test_independent_streams_in_parallel() {
    let container = container(Arc::new(StorageEmulator::new())).await;

    let uploads = (0..4).map(|i| {
        let blob = container.block_blob_client(format!("parallel-{}.bin", i));
        async move {
            let data = payload(1500 + i * 100);
            let stream = blob
                .open_write(AccessConditions::default(), options(256, 2))
                .await
                .unwrap();
            stream.write(&data).await.unwrap();
            stream.close().await.unwrap();
            (blob, data)
        }
    });

    for (blob, data) in futures::future::join_all(uploads).await {
        assert_eq!(&blob.download().await.unwrap()[..], &data[..]);
    }
}

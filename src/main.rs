//! blobstream-rs: stream a local file into a blob through a chunked upload
//! stream backed by the in-process storage emulator.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::Parser;
use md5::{Digest, Md5};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use blobstream_rs::models::PAGE_SIZE;
use blobstream_rs::{
    AccessConditions, Args, BlobKind, BlobOutputStream, BlobTransport, CommitSummary, Config,
    ContainerClient, FsExtentStore, MemoryMetadataStore, StorageEmulator,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Parse command-line arguments
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug {
        Level::DEBUG
    } else if args.silent {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::from(args);
    let transport: Arc<dyn BlobTransport> = match &config.location {
        Some(location) => Arc::new(StorageEmulator::with_storage(
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(FsExtentStore::new(location.clone()).await?),
        )),
        None => Arc::new(StorageEmulator::new()),
    };

    let container = ContainerClient::new(transport, config.container.clone());
    if !container.exists().await {
        container.create().await?;
    }

    let file_len = tokio::fs::metadata(&config.file).await?.len();
    info!(
        "Uploading {} ({} bytes) to {}/{} as a {}",
        config.file.display(),
        file_len,
        config.container,
        config.blob,
        config.kind
    );

    let mut conditions = AccessConditions::new();
    if let Some(max_size) = config.max_size {
        conditions = conditions.max_size(max_size);
    }

    // Page blobs hold whole pages; the tail is zero-padded.
    let padded_len = file_len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    let stream = match config.kind {
        BlobKind::Block => {
            container
                .block_blob_client(&config.blob)
                .open_write(conditions, config.options.clone())
                .await?
        }
        BlobKind::Page => {
            container
                .page_blob_client(&config.blob)
                .open_write(padded_len, conditions, config.options.clone())
                .await?
        }
        BlobKind::Append => {
            container
                .append_blob_client(&config.blob)
                .open_write(true, conditions, config.options.clone())
                .await?
        }
    };

    let mut hasher = Md5::new();
    copy_file(&config, &stream, &mut hasher).await?;
    if config.kind == BlobKind::Page && padded_len > file_len {
        let padding = vec![0u8; (padded_len - file_len) as usize];
        hasher.update(&padding);
        stream.write(&padding).await?;
    }

    let stats = stream.stats();
    let summary = stream.close().await?;
    info!(
        "Committed {} blocks, peak {} in flight",
        summary.blocks, stats.peak_in_flight
    );
    print_summary(&config, &summary)?;

    if config.verify {
        let expected = BASE64.encode(hasher.finalize());
        let body = match config.kind {
            BlobKind::Block => container.block_blob_client(&config.blob).download().await?,
            BlobKind::Page => container.page_blob_client(&config.blob).download().await?,
            BlobKind::Append => container.append_blob_client(&config.blob).download().await?,
        };
        let actual = BASE64.encode(Md5::digest(&body));
        if actual != expected {
            return Err(format!("verification failed: expected MD5 {}, got {}", expected, actual).into());
        }
        info!("Verified {} bytes (MD5 {})", body.len(), actual);
    }

    Ok(())
}

async fn copy_file(
    config: &Config,
    stream: &BlobOutputStream,
    hasher: &mut Md5,
) -> Result<(), BoxError> {
    let mut file = tokio::fs::File::open(&config.file).await?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        if let Err(e) = stream.write(&buf[..n]).await {
            warn!("Write failed after {} bytes", stream.stats().bytes_written);
            return Err(e.into());
        }
    }
    Ok(())
}

fn print_summary(config: &Config, summary: &CommitSummary) -> Result<(), BoxError> {
    if config.json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        println!(
            r#"
Committed {} ({})
  blocks:      {}
  length:      {}
  etag:        {}
  content-md5: {}
"#,
            summary.path,
            summary.kind,
            summary.blocks,
            summary.length,
            summary.etag,
            summary.content_md5.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

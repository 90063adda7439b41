//! Upload stream options and CLI configuration.

use clap::Parser;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::models::BlobKind;
use crate::retry::RetryPolicy;
use crate::transport::RequestObserver;

/// Default size of a dispatched block (4 MiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Default number of blocks that may be in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Options fixed when an upload stream is opened.
#[derive(Clone)]
pub struct UploadOptions {
    /// Size of every sealed block except the last one.
    pub block_size: usize,
    /// Maximum number of dispatches in flight.
    pub concurrency: usize,
    /// Attach a base64 MD5 of each block to its dispatch.
    pub use_transactional_md5: bool,
    /// Hash the whole upload and store the digest with the blob.
    pub store_content_md5: bool,
    pub retry: RetryPolicy,
    /// Upper bound for a single request attempt.
    pub request_timeout: Option<Duration>,
    /// Treat append-position and max-size failures seen on a retry as success.
    /// Only append blobs honor this.
    pub absorb_conditional_errors_on_retry: bool,
    pub observer: Option<Arc<dyn RequestObserver>>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            use_transactional_md5: false,
            store_content_md5: true,
            retry: RetryPolicy::default(),
            request_timeout: None,
            absorb_conditional_errors_on_retry: false,
            observer: None,
        }
    }
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("block_size", &self.block_size)
            .field("concurrency", &self.concurrency)
            .field("use_transactional_md5", &self.use_transactional_md5)
            .field("store_content_md5", &self.store_content_md5)
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .field(
                "absorb_conditional_errors_on_retry",
                &self.absorb_conditional_errors_on_retry,
            )
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_transactional_md5(mut self, enabled: bool) -> Self {
        self.use_transactional_md5 = enabled;
        self
    }

    pub fn with_content_md5(mut self, enabled: bool) -> Self {
        self.store_content_md5 = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_conditional_error_absorption(mut self, enabled: bool) -> Self {
        self.absorb_conditional_errors_on_retry = enabled;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

/// Command-line arguments for the uploader.
#[derive(Parser, Debug, Clone)]
#[command(name = "blobstream-rs")]
#[command(about = "Stream a local file into a blob through a chunked upload stream")]
#[command(version)]
pub struct Args {
    /// File to upload.
    pub file: PathBuf,

    /// Target container (created if missing).
    #[arg(long, default_value = "uploads")]
    pub container: String,

    /// Target blob name. Defaults to the file name.
    #[arg(long)]
    pub blob: Option<String>,

    /// Blob kind: block, page or append.
    #[arg(long, default_value = "block", value_parser = parse_kind)]
    pub kind: BlobKind,

    /// Block size in bytes.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: usize,

    /// Maximum number of blocks in flight.
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Fail the upload if the blob would grow beyond this many bytes.
    #[arg(long)]
    pub max_size: Option<u64>,

    /// Attach a per-block MD5 to every dispatch.
    #[arg(long)]
    pub transactional_md5: bool,

    /// Directory for file-backed extents. In-memory when omitted.
    #[arg(long, short = 'l')]
    pub location: Option<PathBuf>,

    /// Download the blob after the commit and compare its MD5.
    #[arg(long)]
    pub verify: bool,

    /// Print the commit summary as JSON.
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging.
    #[arg(long, short = 'd')]
    pub debug: bool,

    /// Enable silent mode (minimal logging).
    #[arg(long, short = 's')]
    pub silent: bool,
}

fn parse_kind(s: &str) -> Result<BlobKind, String> {
    BlobKind::from_str(s).ok_or_else(|| format!("unknown blob kind '{}'", s))
}

/// Uploader configuration derived from command-line arguments.
#[derive(Debug, Clone)]
pub struct Config {
    pub file: PathBuf,
    pub container: String,
    pub blob: String,
    pub kind: BlobKind,
    pub max_size: Option<u64>,
    pub location: Option<PathBuf>,
    pub verify: bool,
    pub json: bool,
    pub options: UploadOptions,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        let blob = args.blob.unwrap_or_else(|| {
            args.file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload.bin".to_string())
        });

        let options = UploadOptions::new()
            .with_block_size(args.block_size)
            .with_concurrency(args.concurrency)
            .with_transactional_md5(args.transactional_md5);

        Self {
            file: args.file,
            container: args.container,
            blob,
            kind: args.kind,
            max_size: args.max_size,
            location: args.location,
            verify: args.verify,
            json: args.json,
            options,
        }
    }
}

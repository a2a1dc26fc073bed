//! Pipeline configuration and protocol defaults.

use std::path::PathBuf;
use std::time::Duration;

pub const BYTES_IN_ONE_MB: u64 = 1024 * 1024;

/// Bounds for the adaptive chunk-size selection.
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub max_chunk_count: u64,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        MultipartConfig {
            min_chunk_size: 5 * BYTES_IN_ONE_MB,
            max_chunk_size: 1024 * BYTES_IN_ONE_MB,
            max_chunk_count: 1000,
        }
    }
}

/// File-set packaging limits applied before the bulk-vs-chunked decision.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub multipart: MultipartConfig,
    pub max_package_size: u64,
    pub max_package_files: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            multipart: MultipartConfig::default(),
            max_package_size: BYTES_IN_ONE_MB,
            max_package_files: 500,
        }
    }
}

/// Per-call retry policy: exponential backoff, base 2, per-wait cap, and an
/// overall wall-clock budget after which the call surfaces `ConnectionLost`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub budget: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            budget: Duration::from_secs(60),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Bounds for the background batching worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Capacity of the bounded operation queue.
    pub queue_capacity: usize,
    /// How long a producer may block on a full queue before giving up.
    pub enqueue_timeout: Duration,
    /// Maximum operations accumulated into one flushed batch.
    pub max_batch_operations: usize,
    /// Cumulative payload-estimate bound for one batch, for binary-heavy series.
    pub max_batch_bytes: u64,
    /// Wall-clock batching window, measured from the first queued operation.
    pub batch_window: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            queue_capacity: 4096,
            enqueue_timeout: Duration::from_secs(30),
            max_batch_operations: 1000,
            max_batch_bytes: 16 * BYTES_IN_ONE_MB,
            batch_window: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub retry: RetryConfig,
    pub upload: UploadConfig,
    pub worker: WorkerConfig,
    /// Overrides the default per-user artifact hash cache location.
    pub hash_cache_file: Option<PathBuf>,
}

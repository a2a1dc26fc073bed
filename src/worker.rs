//! Background batching worker.
//!
//! Producers hand operations to a bounded queue and move on; one dedicated
//! task drains it, accumulates a batch bounded by count, bytes and a
//! wall-clock window, and flushes through the synchronous pipeline. Closing
//! the handle shuts the worker down cooperatively after a final
//! drain-and-flush.

use crate::backend::executor::{ExecutionReport, OperationsExecutor};
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::operation::Operation;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info};

/// Where accumulated batches go. The seam exists so the worker loop can be
/// exercised without a backend.
#[async_trait]
pub trait BatchSink: Send {
    async fn flush_batch(&mut self, operations: Vec<Operation>) -> Result<ExecutionReport>;
}

/// Binds an executor to one run.
pub struct RunSink {
    executor: OperationsExecutor,
    run_id: String,
}

impl RunSink {
    pub fn new(executor: OperationsExecutor, run_id: impl Into<String>) -> Self {
        RunSink {
            executor,
            run_id: run_id.into(),
        }
    }
}

#[async_trait]
impl BatchSink for RunSink {
    async fn flush_batch(&mut self, operations: Vec<Operation>) -> Result<ExecutionReport> {
        self.executor.execute(&self.run_id, operations).await
    }
}

enum Envelope {
    Op(Box<Operation>),
    Flush(oneshot::Sender<()>),
}

/// Counters reported when the worker finishes.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WorkerStats {
    pub batches_flushed: u64,
    pub operations_processed: usize,
    pub operation_errors: usize,
    pub failed_flushes: u64,
}

pub struct WorkerHandle {
    tx: mpsc::Sender<Envelope>,
    enqueue_timeout: std::time::Duration,
    task: tokio::task::JoinHandle<WorkerStats>,
}

impl WorkerHandle {
    /// Starts the worker task and returns its producer handle.
    pub fn spawn<S: BatchSink + 'static>(sink: S, config: WorkerConfig) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let enqueue_timeout = config.enqueue_timeout;
        let task = tokio::spawn(run_worker(sink, config, rx));
        WorkerHandle {
            tx,
            enqueue_timeout,
            task,
        }
    }

    /// Queues one operation, blocking up to the configured timeout when the
    /// queue is full.
    pub async fn enqueue(&self, operation: Operation) -> Result<()> {
        self.tx
            .send_timeout(Envelope::Op(Box::new(operation)), self.enqueue_timeout)
            .await
            .map_err(|err| match err {
                mpsc::error::SendTimeoutError::Timeout(_) => {
                    Error::QueueFull(self.enqueue_timeout)
                }
                mpsc::error::SendTimeoutError::Closed(_) => {
                    Error::InternalClient("worker has shut down".into())
                }
            })
    }

    /// Waits until everything queued before this call has been flushed.
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Envelope::Flush(ack))
            .await
            .map_err(|_| Error::InternalClient("worker has shut down".into()))?;
        done.await
            .map_err(|_| Error::InternalClient("worker dropped a flush request".into()))
    }

    /// Closes the queue and waits for the final drain-and-flush.
    pub async fn shutdown(self) -> Result<WorkerStats> {
        drop(self.tx);
        self.task
            .await
            .map_err(|err| Error::InternalClient(format!("worker task failed: {err}")))
    }
}

async fn run_worker<S: BatchSink>(
    mut sink: S,
    config: WorkerConfig,
    mut rx: mpsc::Receiver<Envelope>,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    let mut closed = false;

    while !closed {
        // Block until there is work at all.
        let first = match rx.recv().await {
            None => break,
            Some(Envelope::Flush(ack)) => {
                let _ = ack.send(());
                continue;
            }
            Some(Envelope::Op(op)) => *op,
        };

        let mut bytes = first.estimated_bytes();
        let mut batch = vec![first];
        let mut pending_acks = Vec::new();
        let deadline = Instant::now() + config.batch_window;

        // Accumulate until a bound trips, the window closes, a flush is
        // requested, or the queue shuts.
        while batch.len() < config.max_batch_operations && bytes < config.max_batch_bytes {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, rx.recv()).await {
                Err(_) => break,
                Ok(None) => {
                    closed = true;
                    break;
                }
                Ok(Some(Envelope::Flush(ack))) => {
                    pending_acks.push(ack);
                    break;
                }
                Ok(Some(Envelope::Op(op))) => {
                    bytes += op.estimated_bytes();
                    batch.push(*op);
                }
            }
        }

        debug!(operations = batch.len(), bytes, "flushing batch");
        match sink.flush_batch(batch).await {
            Ok(report) => {
                stats.batches_flushed += 1;
                stats.operations_processed += report.processed_count;
                stats.operation_errors += report.errors.len();
                for err in &report.errors {
                    error!(error = %err, "operation rejected");
                }
            }
            Err(err) => {
                stats.failed_flushes += 1;
                error!(error = %err, "batch flush failed");
            }
        }
        for ack in pending_acks {
            let _ = ack.send(());
        }
    }

    info!(
        batches = stats.batches_flushed,
        operations = stats.operations_processed,
        "worker finished"
    );
    stats
}

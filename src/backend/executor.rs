//! Multi-phase batch execution.
//!
//! One batch runs as: compaction, then uploads (idempotent, first), then
//! artifact tracking (each success yields a synthetic assign), then one
//! batched operations RPC. Errors from every phase are merged into one
//! report; only transport-level failures abort the batch.

use crate::artifact::cache::LocalHashCache;
use crate::artifact::execute_artifact_operations;
use crate::backend::ApiClient;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::preprocessor::{AccumulatedOperations, OperationsPreprocessor};
use crate::upload::execute_upload_operations;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one `execute` call. Operations that appear in `errors` were
/// dropped or rejected; everything else was durably applied, so the result
/// reads as "mostly succeeded", never as atomic.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub processed_count: usize,
    pub errors: Vec<Error>,
}

pub struct OperationsExecutor {
    client: Arc<dyn ApiClient>,
    config: PipelineConfig,
    hash_cache: LocalHashCache,
}

impl OperationsExecutor {
    pub fn new(client: Arc<dyn ApiClient>, config: PipelineConfig) -> Result<Self> {
        let hash_cache = LocalHashCache::open(config.hash_cache_file.clone())?;
        Ok(OperationsExecutor {
            client,
            config,
            hash_cache,
        })
    }

    /// Compacts and executes a batch of operations against one run.
    ///
    /// When compaction stalls (a file or artifact operation queued behind a
    /// delete), the consumed prefix is flushed first and the remainder goes
    /// through another round, so submission-order effects are preserved.
    pub async fn execute(
        &mut self,
        run_id: &str,
        mut operations: Vec<Operation>,
    ) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();
        while !operations.is_empty() {
            let mut preprocessor = OperationsPreprocessor::new();
            let remainder = preprocessor.process(operations);
            report.processed_count += preprocessor.processed_count();
            if !remainder.is_empty() {
                debug!(
                    remaining = remainder.len(),
                    "compaction stalled behind a queued delete, flushing consumed prefix"
                );
            }
            let accumulated = preprocessor.accumulate();
            self.execute_accumulated(run_id, accumulated, &mut report.errors)
                .await?;
            operations = remainder;
        }
        Ok(report)
    }

    async fn execute_accumulated(
        &mut self,
        run_id: &str,
        accumulated: AccumulatedOperations,
        errors: &mut Vec<Error>,
    ) -> Result<()> {
        errors.extend(accumulated.errors);

        if !accumulated.upload_operations.is_empty() {
            self.run_upload_phase(run_id, &accumulated.upload_operations, errors)
                .await?;
        }

        let mut batch = Vec::new();
        if !accumulated.artifact_operations.is_empty() {
            let (assigns, artifact_errors) = execute_artifact_operations(
                self.client.as_ref(),
                run_id,
                &accumulated.artifact_operations,
                &mut self.hash_cache,
            )
            .await?;
            errors.extend(artifact_errors);
            batch.extend(assigns);
        }
        batch.extend(accumulated.other_operations);

        if !batch.is_empty() {
            let server_errors = self.client.execute_operations(run_id, &batch).await?;
            errors.extend(server_errors.into_iter().map(Error::MetadataInconsistency));
        }
        Ok(())
    }

    /// Uploads are idempotent, so one whole-phase retry is allowed for the
    /// single known-transient server complaint: a 400 reporting that a
    /// stream's length disagreed with its range header. Anything else, and a
    /// second mismatch, aborts the batch.
    async fn run_upload_phase(
        &self,
        run_id: &str,
        operations: &[Operation],
        errors: &mut Vec<Error>,
    ) -> Result<()> {
        let result = execute_upload_operations(
            self.client.as_ref(),
            run_id,
            operations,
            &self.config.upload,
        )
        .await;
        match result {
            Ok(collected) => {
                errors.extend(collected);
                Ok(())
            }
            Err(err) if err.is_stream_length_mismatch() => {
                warn!(error = %err, "stream length mismatch, retrying upload phase once");
                let collected = execute_upload_operations(
                    self.client.as_ref(),
                    run_id,
                    operations,
                    &self.config.upload,
                )
                .await?;
                errors.extend(collected);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

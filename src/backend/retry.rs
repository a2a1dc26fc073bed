//! Per-call retry with exponential backoff.

use crate::artifact::ArtifactFileData;
use crate::backend::{ApiClient, ArtifactModel, ChunkMetadata};
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::path::AttributePath;
use crate::upload::chunker::FileChunk;
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Re-invokes one call while it fails transiently: doubling backoff per
/// attempt up to `max_backoff`, bounded by an overall wall-clock budget.
/// Budget exhaustion surfaces as `ConnectionLost`; non-retryable errors
/// return immediately.
pub async fn with_retries<T, F, Fut>(config: &RetryConfig, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                let backoff = backoff_for(attempt, config.max_backoff);
                if started.elapsed() + backoff > config.budget {
                    return Err(Error::ConnectionLost(err.to_string()));
                }
                warn!(attempt, backoff_secs = backoff.as_secs(), error = %err, "transient backend error, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_for(attempt: u32, max_backoff: Duration) -> Duration {
    let exp = Duration::from_secs(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    exp.min(max_backoff)
}

/// Decorates an `ApiClient` so every endpoint call gets the retry policy.
pub struct RetryingClient<C> {
    inner: C,
    config: RetryConfig,
}

impl<C: ApiClient> RetryingClient<C> {
    pub fn new(inner: C, config: RetryConfig) -> Self {
        RetryingClient { inner, config }
    }
}

#[async_trait]
impl<C: ApiClient> ApiClient for RetryingClient<C> {
    async fn execute_operations(
        &self,
        run_id: &str,
        operations: &[Operation],
    ) -> Result<Vec<String>> {
        with_retries(&self.config, || {
            self.inner.execute_operations(run_id, operations)
        })
        .await
    }

    async fn upload_attribute_chunk(
        &self,
        run_id: &str,
        attribute: &AttributePath,
        metadata: &ChunkMetadata,
        chunk: &FileChunk,
    ) -> Result<()> {
        with_retries(&self.config, || {
            self.inner
                .upload_attribute_chunk(run_id, attribute, metadata, chunk)
        })
        .await
    }

    async fn upload_file_set_chunk(
        &self,
        run_id: &str,
        attribute: &AttributePath,
        reset: bool,
        metadata: &ChunkMetadata,
        chunk: &FileChunk,
    ) -> Result<()> {
        with_retries(&self.config, || {
            self.inner
                .upload_file_set_chunk(run_id, attribute, reset, metadata, chunk)
        })
        .await
    }

    async fn upload_file_set_tar(
        &self,
        run_id: &str,
        attribute: &AttributePath,
        reset: bool,
        archive: bytes::Bytes,
    ) -> Result<()> {
        with_retries(&self.config, || {
            self.inner
                .upload_file_set_tar(run_id, attribute, reset, archive.clone())
        })
        .await
    }

    async fn get_artifact_attribute(
        &self,
        run_id: &str,
        attribute: &AttributePath,
    ) -> Result<Option<String>> {
        with_retries(&self.config, || {
            self.inner.get_artifact_attribute(run_id, attribute)
        })
        .await
    }

    async fn create_artifact(
        &self,
        project_id: &str,
        run_id: &str,
        hash: &str,
        size: Option<u64>,
    ) -> Result<ArtifactModel> {
        with_retries(&self.config, || {
            self.inner.create_artifact(project_id, run_id, hash, size)
        })
        .await
    }

    async fn upload_artifact_files_metadata(
        &self,
        project_id: &str,
        hash: &str,
        files: &[ArtifactFileData],
    ) -> Result<ArtifactModel> {
        with_retries(&self.config, || {
            self.inner
                .upload_artifact_files_metadata(project_id, hash, files)
        })
        .await
    }

    async fn create_artifact_version(
        &self,
        project_id: &str,
        run_id: &str,
        parent_hash: &str,
        files: &[ArtifactFileData],
    ) -> Result<ArtifactModel> {
        with_retries(&self.config, || {
            self.inner
                .create_artifact_version(project_id, run_id, parent_hash, files)
        })
        .await
    }

    async fn prepare_file_set_download(
        &self,
        run_id: &str,
        attribute: &AttributePath,
    ) -> Result<String> {
        with_retries(&self.config, || {
            self.inner.prepare_file_set_download(run_id, attribute)
        })
        .await
    }

    async fn download_request_status(
        &self,
        run_id: &str,
        request_id: &str,
    ) -> Result<Option<String>> {
        with_retries(&self.config, || {
            self.inner.download_request_status(run_id, request_id)
        })
        .await
    }

    async fn download_url_to_file(&self, url: &str, destination: &Path) -> Result<()> {
        with_retries(&self.config, || {
            self.inner.download_url_to_file(url, destination)
        })
        .await
    }
}

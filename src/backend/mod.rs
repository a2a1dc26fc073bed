//! Backend access layer.
//!
//! The wire surface is one narrow trait so the orchestrator, upload engine
//! and artifact tracker never touch URLs or headers directly, and tests can
//! substitute a recording client.

pub mod executor;
pub mod http;
pub mod retry;

use crate::artifact::ArtifactFileData;
use crate::error::Result;
use crate::operation::Operation;
use crate::path::AttributePath;
use crate::upload::chunker::FileChunk;
use async_trait::async_trait;
use std::path::Path;

// =============================================================================
// API models
// =============================================================================

/// Server-side view of an artifact after a create or metadata-upload call.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactModel {
    pub hash: String,
    pub size: Option<u64>,
    /// False means the backend has no file list for this hash yet and wants
    /// it uploaded.
    pub received_metadata: bool,
}

/// Per-chunk transfer metadata, rendered into headers by the HTTP client.
#[derive(Debug, Clone)]
pub struct ChunkMetadata {
    /// Value of the `Content-Filename` header.
    pub filename: String,
    /// POSIX permission string, `"----------"` when the source vanished.
    pub permissions: Option<String>,
    /// Total payload size when known; omitted from `X-Range` otherwise.
    pub total_size: Option<u64>,
}

// =============================================================================
// ApiClient trait
// =============================================================================

/// The full set of remote calls the pipeline makes. One method per endpoint,
/// no state beyond connection configuration.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Submits one batched operation envelope. Returns per-operation error
    /// messages reported by the server; an empty vec means all applied.
    async fn execute_operations(
        &self,
        run_id: &str,
        operations: &[Operation],
    ) -> Result<Vec<String>>;

    /// Uploads one chunk of a single-file attribute.
    async fn upload_attribute_chunk(
        &self,
        run_id: &str,
        attribute: &AttributePath,
        metadata: &ChunkMetadata,
        chunk: &FileChunk,
    ) -> Result<()>;

    /// Uploads one chunk of a file-set member. `reset` clears the remote set
    /// before the first chunk of the first file.
    async fn upload_file_set_chunk(
        &self,
        run_id: &str,
        attribute: &AttributePath,
        reset: bool,
        metadata: &ChunkMetadata,
        chunk: &FileChunk,
    ) -> Result<()>;

    /// Uploads a whole file-set package as one tar.gz body.
    async fn upload_file_set_tar(
        &self,
        run_id: &str,
        attribute: &AttributePath,
        reset: bool,
        archive: bytes::Bytes,
    ) -> Result<()>;

    /// Current artifact hash assigned to an attribute, `None` when the
    /// attribute does not exist yet.
    async fn get_artifact_attribute(
        &self,
        run_id: &str,
        attribute: &AttributePath,
    ) -> Result<Option<String>>;

    /// Registers a brand-new artifact under its content hash.
    async fn create_artifact(
        &self,
        project_id: &str,
        run_id: &str,
        hash: &str,
        size: Option<u64>,
    ) -> Result<ArtifactModel>;

    /// Uploads the file list for an artifact the backend has not seen.
    async fn upload_artifact_files_metadata(
        &self,
        project_id: &str,
        hash: &str,
        files: &[ArtifactFileData],
    ) -> Result<ArtifactModel>;

    /// Creates a new version chained to an existing artifact hash.
    async fn create_artifact_version(
        &self,
        project_id: &str,
        run_id: &str,
        parent_hash: &str,
        files: &[ArtifactFileData],
    ) -> Result<ArtifactModel>;

    /// Asks the backend to start building a file-set zip. Returns a request
    /// id to poll.
    async fn prepare_file_set_download(
        &self,
        run_id: &str,
        attribute: &AttributePath,
    ) -> Result<String>;

    /// Polls a download request; `Some(url)` once the archive is ready.
    async fn download_request_status(
        &self,
        run_id: &str,
        request_id: &str,
    ) -> Result<Option<String>>;

    /// Streams a ready download URL into a local file.
    async fn download_url_to_file(&self, url: &str, destination: &Path) -> Result<()>;
}

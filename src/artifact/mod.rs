//! Content-addressed artifact tracking.
//!
//! Tracking never uploads file bytes. Each tracked location expands into a
//! file list with per-file content hashes; the list's canonical digest
//! becomes the artifact hash, and only the metadata travels to the backend,
//! deduplicated by that hash.

pub mod cache;
pub mod hasher;

use crate::backend::ApiClient;
use crate::error::{Error, Result};
use crate::operation::{ArtifactEntry, OpPayload, Operation};
use cache::LocalHashCache;
use chrono::{DateTime, Local};
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCAL_FILE_TYPE: &str = "Local";
const FILE_PROTOCOL_PREFIX: &str = "file://";
const LAST_MODIFIED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One file of a tracked artifact, as hashed and transmitted. Serializes
/// straight into the wire DTO; metadata maps go out as key-sorted
/// `{key, value}` pairs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactFileData {
    pub file_path: String,
    pub file_hash: String,
    #[serde(rename = "type")]
    pub file_type: String,
    pub size: Option<u64>,
    #[serde(serialize_with = "metadata_as_pairs")]
    pub metadata: BTreeMap<String, String>,
}

fn metadata_as_pairs<S: Serializer>(
    metadata: &BTreeMap<String, String>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct Pair<'a> {
        key: &'a str,
        value: &'a str,
    }
    let mut seq = serializer.serialize_seq(Some(metadata.len()))?;
    for (key, value) in metadata {
        seq.serialize_element(&Pair { key, value })?;
    }
    seq.end()
}

// =============================================================================
// Local tracked-file listing
// =============================================================================

/// Expands one tracked location into per-file data. A directory is walked
/// recursively with paths relative to it; a single file contributes just its
/// name. `destination` prefixes every resulting path.
pub fn get_tracked_files(
    source: &str,
    destination: Option<&str>,
    cache: &mut LocalHashCache,
) -> Result<Vec<ArtifactFileData>> {
    let source = source.strip_prefix(FILE_PROTOCOL_PREFIX).unwrap_or(source);
    if source.contains('*') || source.contains('?') {
        return Err(Error::ArtifactUploading(format!(
            "wildcard characters in tracked location {source} are not supported"
        )));
    }

    let root = PathBuf::from(source);
    let mut files = Vec::new();
    if root.is_dir() {
        collect_dir_files(&root, &root, destination, cache, &mut files)?;
        files.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    } else if root.is_file() {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        files.push(tracked_file(&root, &name, destination, cache)?);
    }
    Ok(files)
}

fn collect_dir_files(
    root: &Path,
    dir: &Path,
    destination: Option<&str>,
    cache: &mut LocalHashCache,
    out: &mut Vec<ArtifactFileData>,
) -> Result<()> {
    for item in std::fs::read_dir(dir)? {
        let path = item?.path();
        if path.is_dir() {
            collect_dir_files(root, &path, destination, cache, out)?;
        } else if path.is_file() {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            out.push(tracked_file(&path, &relative, destination, cache)?);
        }
    }
    Ok(())
}

fn tracked_file(
    path: &Path,
    relative: &str,
    destination: Option<&str>,
    cache: &mut LocalHashCache,
) -> Result<ArtifactFileData> {
    let meta = std::fs::metadata(path)?;
    let modified: DateTime<Local> = meta.modified()?.into();
    let absolute = path.canonicalize()?;
    let file_path = match destination {
        Some(dest) => format!("{}/{}", dest.trim_end_matches('/'), relative),
        None => relative.to_owned(),
    };
    Ok(ArtifactFileData {
        file_path,
        file_hash: cache.file_hash(path)?,
        file_type: LOCAL_FILE_TYPE.to_owned(),
        size: Some(meta.len()),
        metadata: BTreeMap::from([
            (
                "file_path".to_owned(),
                format!(
                    "{}{}",
                    FILE_PROTOCOL_PREFIX,
                    absolute.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/")
                ),
            ),
            (
                "last_modified".to_owned(),
                modified.format(LAST_MODIFIED_FORMAT).to_string(),
            ),
        ]),
    })
}

// =============================================================================
// Artifact phase
// =============================================================================

fn artifact_size(files: &[ArtifactFileData]) -> Option<u64> {
    files.iter().map(|f| f.size).sum()
}

/// Executes the artifact phase of one batch. Every successful tracking
/// operation yields a synthetic assign carrying the resulting hash; failures
/// are fatal for their own operation only and are collected.
pub async fn execute_artifact_operations(
    client: &dyn ApiClient,
    run_id: &str,
    operations: &[Operation],
    cache: &mut LocalHashCache,
) -> Result<(Vec<Operation>, Vec<Error>)> {
    let mut assigns = Vec::new();
    let mut errors = Vec::new();
    for op in operations {
        match track_operation(client, run_id, op, cache).await {
            Ok(assign) => assigns.push(assign),
            Err(
                err @ (Error::ArtifactUploading(_)
                | Error::EmptyArtifactLocation { .. }
                | Error::MetadataInconsistency(_)),
            ) => errors.push(err),
            Err(err) => return Err(err),
        }
    }
    cache.save()?;
    Ok((assigns, errors))
}

async fn track_operation(
    client: &dyn ApiClient,
    run_id: &str,
    op: &Operation,
    cache: &mut LocalHashCache,
) -> Result<Operation> {
    let (project_id, entries) = match &op.payload {
        OpPayload::TrackFilesToArtifact { project_id, entries } => (project_id, entries),
        other => {
            return Err(Error::InternalClient(format!(
                "{} is not an artifact tracking operation",
                other.name()
            )))
        }
    };

    let files = extract_file_list(&op.path, entries, cache)?;
    let prior_hash = client.get_artifact_attribute(run_id, &op.path).await?;

    let hash = match prior_hash {
        None => {
            let hash = hasher::artifact_hash(&files);
            debug!(attribute = %op.path, hash = %hash, files = files.len(), "creating new artifact");
            let artifact = client
                .create_artifact(project_id, run_id, &hash, artifact_size(&files))
                .await?;
            if !artifact.received_metadata {
                client
                    .upload_artifact_files_metadata(project_id, &hash, &files)
                    .await?;
            }
            hash
        }
        Some(parent) => {
            debug!(attribute = %op.path, parent = %parent, files = files.len(), "creating artifact version");
            let artifact = client
                .create_artifact_version(project_id, run_id, &parent, &files)
                .await?;
            artifact.hash
        }
    };

    Ok(Operation::new(op.path.clone(), OpPayload::AssignArtifact { hash }))
}

fn extract_file_list(
    attribute: &crate::path::AttributePath,
    entries: &[ArtifactEntry],
    cache: &mut LocalHashCache,
) -> Result<Vec<ArtifactFileData>> {
    let mut files = Vec::new();
    for entry in entries {
        let tracked = get_tracked_files(&entry.source, entry.destination.as_deref(), cache)?;
        if tracked.is_empty() {
            return Err(Error::EmptyArtifactLocation {
                location: entry.source.clone(),
                namespace: attribute.to_string(),
            });
        }
        files.extend(tracked);
    }
    if files.is_empty() {
        return Err(Error::ArtifactUploading("Uploading an empty Artifact".into()));
    }
    files.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    Ok(files)
}

//! File and file-set transfer.
//!
//! Single files stream as byte-range chunks; file-set packages that are not
//! exactly one streamable regular file fall back to one in-memory tar.gz
//! body, trading resumability for fewer round trips.

pub mod chunker;
pub mod entries;
pub mod tar;

use crate::backend::{ApiClient, ChunkMetadata};
use crate::config::UploadConfig;
use crate::error::{Error, Result};
use crate::operation::{OpPayload, Operation};
use crate::path::AttributePath;
use bytes::Bytes;
use chunker::{select_chunk_size, FileChunker};
use entries::{split_into_packages, UploadEntry, UploadPackage, UploadSource};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Executes the upload phase of one batch. Per-entry failures (missing
/// source, oversized payload, server-side attribute errors) are collected
/// while sibling operations continue; transport errors propagate.
pub async fn execute_upload_operations(
    client: &dyn ApiClient,
    run_id: &str,
    operations: &[Operation],
    config: &UploadConfig,
) -> Result<Vec<Error>> {
    let mut errors = Vec::new();
    for op in operations {
        let result = match &op.payload {
            OpPayload::UploadFile { file_path, ext } => {
                upload_file_attribute(client, run_id, &op.path, file_path, ext, config).await
            }
            OpPayload::UploadFileContent { content, ext } => {
                upload_content_attribute(client, run_id, &op.path, content, ext, config).await
            }
            OpPayload::UploadFileSet { globs, reset } => {
                upload_file_set_attribute(client, run_id, &op.path, globs, *reset, config).await
            }
            other => {
                return Err(Error::InternalClient(format!(
                    "{} is not an upload operation",
                    other.name()
                )))
            }
        };
        match result {
            Ok(()) => {}
            Err(
                err @ (Error::MetadataInconsistency(_)
                | Error::FileUpload { .. }
                | Error::FileTooLarge { .. }),
            ) => errors.push(err),
            Err(err) => return Err(err),
        }
    }
    Ok(errors)
}

fn attribute_filename(attribute: &AttributePath, ext: &str) -> String {
    if ext.is_empty() {
        attribute.to_string()
    } else {
        format!("{attribute}.{ext}")
    }
}

async fn upload_file_attribute(
    client: &dyn ApiClient,
    run_id: &str,
    attribute: &AttributePath,
    source: &PathBuf,
    ext: &str,
    config: &UploadConfig,
) -> Result<()> {
    if !source.is_file() {
        return Err(Error::FileUpload {
            path: source.display().to_string(),
            reason: "Path not found or is a not a file.".to_owned(),
        });
    }
    let entry = UploadEntry::from_file(source.clone(), attribute_filename(attribute, ext));
    upload_single_entry(client, run_id, attribute, None, &entry, config).await
}

async fn upload_content_attribute(
    client: &dyn ApiClient,
    run_id: &str,
    attribute: &AttributePath,
    content: &[u8],
    ext: &str,
    config: &UploadConfig,
) -> Result<()> {
    let entry = UploadEntry::from_bytes(
        Bytes::copy_from_slice(content),
        attribute_filename(attribute, ext),
    );
    upload_single_entry(client, run_id, attribute, None, &entry, config).await
}

async fn upload_file_set_attribute(
    client: &dyn ApiClient,
    run_id: &str,
    attribute: &AttributePath,
    globs: &[String],
    mut reset: bool,
    config: &UploadConfig,
) -> Result<()> {
    let unique_entries = entries::resolve_glob_entries(globs)?;
    for package in split_into_packages(unique_entries, config)? {
        if package.is_empty() && !reset {
            continue;
        }
        if let Some(entry) = single_streamable_file(&package) {
            upload_single_entry(client, run_id, attribute, Some(reset), entry, config).await?;
        } else {
            debug!(
                attribute = %attribute,
                files = package.items.len(),
                bytes = package.size,
                "sending file-set package as tar archive"
            );
            let archive = tar::compress_to_tar_gz(&package.items)?;
            client
                .upload_file_set_tar(run_id, attribute, reset, archive)
                .await?;
        }
        reset = false;
    }
    Ok(())
}

/// A package goes through the resumable chunked path only when it is exactly
/// one regular file that still exists; everything else takes the tar path.
fn single_streamable_file(package: &UploadPackage) -> Option<&UploadEntry> {
    match package.items.as_slice() {
        [entry] => match &entry.source {
            UploadSource::File(path) if path.is_file() => Some(entry),
            _ => None,
        },
        _ => None,
    }
}

/// Streams one entry chunk by chunk. `file_set_reset` is `Some` for file-set
/// members and carries the reset flag for the first chunk.
async fn upload_single_entry(
    client: &dyn ApiClient,
    run_id: &str,
    attribute: &AttributePath,
    file_set_reset: Option<bool>,
    entry: &UploadEntry,
    config: &UploadConfig,
) -> Result<()> {
    let total = entry.length()?;
    let chunk_size = select_chunk_size(total, &config.multipart)?;
    let metadata = ChunkMetadata {
        filename: entry.target_path.clone(),
        permissions: Some(entry.permissions()),
        total_size: Some(total),
    };

    let mut chunker = match &entry.source {
        UploadSource::Bytes(bytes) => FileChunker::for_bytes(bytes.clone(), chunk_size),
        UploadSource::File(path) => {
            let file = tokio::fs::File::open(path).await.map_err(|err| Error::FileUpload {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
            FileChunker::for_file(file, total, chunk_size)
        }
    };

    let mut first = true;
    while let Some(chunk) = chunker.next_chunk().await? {
        match file_set_reset {
            Some(reset) => {
                client
                    .upload_file_set_chunk(run_id, attribute, reset && first, &metadata, &chunk)
                    .await?
            }
            None => {
                client
                    .upload_attribute_chunk(run_id, attribute, &metadata, &chunk)
                    .await?
            }
        }
        first = false;
    }
    Ok(())
}

// =============================================================================
// File-set download
// =============================================================================

const DOWNLOAD_POLL_START: Duration = Duration::from_millis(500);
const DOWNLOAD_POLL_MAX: Duration = Duration::from_secs(5);

/// Asks the backend to build a file-set zip, polls until it is ready with a
/// doubling delay, then streams it into `destination`.
pub async fn download_file_set_attribute(
    client: &dyn ApiClient,
    run_id: &str,
    attribute: &AttributePath,
    destination: &Path,
) -> Result<()> {
    let request_id = client.prepare_file_set_download(run_id, attribute).await?;
    let mut wait = DOWNLOAD_POLL_START;
    loop {
        if let Some(url) = client.download_request_status(run_id, &request_id).await? {
            return client.download_url_to_file(&url, destination).await;
        }
        tokio::time::sleep(wait).await;
        wait = (wait * 2).min(DOWNLOAD_POLL_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ArtifactModel;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq)]
    enum Call {
        AttributeChunk { filename: String, start: u64, end: u64 },
        FileSetChunk { filename: String, reset: bool, len: usize },
        FileSetTar { reset: bool, files: usize },
        Download { url: String },
    }

    #[derive(Default)]
    struct RecordingClient {
        calls: Mutex<Vec<Call>>,
        /// Status polls answered with "not ready" before a URL appears.
        download_ready_after: usize,
        status_polls: Mutex<Vec<tokio::time::Instant>>,
    }

    #[async_trait]
    impl ApiClient for RecordingClient {
        async fn execute_operations(
            &self,
            _run_id: &str,
            _operations: &[Operation],
        ) -> Result<Vec<String>> {
            unimplemented!()
        }

        async fn upload_attribute_chunk(
            &self,
            _run_id: &str,
            _attribute: &AttributePath,
            metadata: &ChunkMetadata,
            chunk: &chunker::FileChunk,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(Call::AttributeChunk {
                filename: metadata.filename.clone(),
                start: chunk.start,
                end: chunk.end,
            });
            Ok(())
        }

        async fn upload_file_set_chunk(
            &self,
            _run_id: &str,
            _attribute: &AttributePath,
            reset: bool,
            metadata: &ChunkMetadata,
            chunk: &chunker::FileChunk,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(Call::FileSetChunk {
                filename: metadata.filename.clone(),
                reset,
                len: chunk.data.len(),
            });
            Ok(())
        }

        async fn upload_file_set_tar(
            &self,
            _run_id: &str,
            _attribute: &AttributePath,
            reset: bool,
            archive: Bytes,
        ) -> Result<()> {
            let mut unpacked = ::tar::Archive::new(flate2::read::GzDecoder::new(archive.as_ref()));
            let files = unpacked.entries().unwrap().count();
            self.calls.lock().unwrap().push(Call::FileSetTar { reset, files });
            Ok(())
        }

        async fn get_artifact_attribute(
            &self,
            _run_id: &str,
            _attribute: &AttributePath,
        ) -> Result<Option<String>> {
            unimplemented!()
        }

        async fn create_artifact(
            &self,
            _project_id: &str,
            _run_id: &str,
            _hash: &str,
            _size: Option<u64>,
        ) -> Result<ArtifactModel> {
            unimplemented!()
        }

        async fn upload_artifact_files_metadata(
            &self,
            _project_id: &str,
            _hash: &str,
            _files: &[crate::artifact::ArtifactFileData],
        ) -> Result<ArtifactModel> {
            unimplemented!()
        }

        async fn create_artifact_version(
            &self,
            _project_id: &str,
            _run_id: &str,
            _parent_hash: &str,
            _files: &[crate::artifact::ArtifactFileData],
        ) -> Result<ArtifactModel> {
            unimplemented!()
        }

        async fn prepare_file_set_download(
            &self,
            _run_id: &str,
            _attribute: &AttributePath,
        ) -> Result<String> {
            Ok("req-1".into())
        }

        async fn download_request_status(
            &self,
            _run_id: &str,
            _request_id: &str,
        ) -> Result<Option<String>> {
            let mut polls = self.status_polls.lock().unwrap();
            polls.push(tokio::time::Instant::now());
            if polls.len() > self.download_ready_after {
                Ok(Some("https://example.com/files.zip".into()))
            } else {
                Ok(None)
            }
        }

        async fn download_url_to_file(&self, url: &str, _destination: &Path) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Download { url: url.to_owned() });
            Ok(())
        }
    }

    fn path(s: &str) -> AttributePath {
        s.parse().unwrap()
    }

    fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_missing_file_collects_error_and_siblings_continue() {
        let dir = TempDir::new().unwrap();
        let present = write_file(&dir, "ok.txt", b"content");
        let client = RecordingClient::default();
        let ops = vec![
            Operation::new(
                path("missing"),
                OpPayload::UploadFile {
                    file_path: dir.path().join("nope.txt"),
                    ext: "txt".into(),
                },
            ),
            Operation::new(
                path("present"),
                OpPayload::UploadFile {
                    file_path: present,
                    ext: "txt".into(),
                },
            ),
        ];
        let errors =
            execute_upload_operations(&client, "RUN-1", &ops, &UploadConfig::default())
                .await
                .unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::FileUpload { .. }));
        assert_eq!(
            *client.calls.lock().unwrap(),
            vec![Call::AttributeChunk {
                filename: "present.txt".into(),
                start: 0,
                end: 7
            }]
        );
    }

    #[tokio::test]
    async fn test_single_file_set_member_goes_chunked_with_reset() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "main.py", b"print('hi')");
        let client = RecordingClient::default();
        let ops = vec![Operation::new(
            path("source"),
            OpPayload::UploadFileSet {
                globs: vec![format!("{}/main.py", dir.path().display())],
                reset: true,
            },
        )];
        let errors =
            execute_upload_operations(&client, "RUN-1", &ops, &UploadConfig::default())
                .await
                .unwrap();
        assert!(errors.is_empty());
        assert_eq!(
            *client.calls.lock().unwrap(),
            vec![Call::FileSetChunk {
                filename: "main.py".into(),
                reset: true,
                len: 11
            }]
        );
    }

    #[tokio::test]
    async fn test_multi_file_package_goes_through_tar() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "a.py", b"a = 1");
        write_file(&dir, "b.py", b"b = 2");
        let client = RecordingClient::default();
        let ops = vec![Operation::new(
            path("source"),
            OpPayload::UploadFileSet {
                globs: vec![format!("{}/*.py", dir.path().display())],
                reset: true,
            },
        )];
        execute_upload_operations(&client, "RUN-1", &ops, &UploadConfig::default())
            .await
            .unwrap();
        assert_eq!(
            *client.calls.lock().unwrap(),
            vec![Call::FileSetTar {
                reset: true,
                files: 2
            }]
        );
    }

    #[tokio::test]
    async fn test_empty_file_set_with_reset_still_sends_tar() {
        let client = RecordingClient::default();
        let ops = vec![Operation::new(
            path("source"),
            OpPayload::UploadFileSet {
                globs: vec!["/definitely/not/here/*.xyz".into()],
                reset: true,
            },
        )];
        execute_upload_operations(&client, "RUN-1", &ops, &UploadConfig::default())
            .await
            .unwrap();
        assert_eq!(
            *client.calls.lock().unwrap(),
            vec![Call::FileSetTar {
                reset: true,
                files: 0
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_set_download_polls_with_doubling_capped_delay() {
        let dir = TempDir::new().unwrap();
        let client = RecordingClient {
            download_ready_after: 5,
            ..RecordingClient::default()
        };
        let destination = dir.path().join("files.zip");

        download_file_set_attribute(&client, "RUN-1", &path("source"), &destination)
            .await
            .unwrap();

        let polls = client.status_polls.lock().unwrap();
        let offsets: Vec<Duration> = polls.iter().map(|t| *t - polls[0]).collect();
        // Waits of 0.5s, 1s, 2s, 4s, then capped at 5s.
        assert_eq!(
            offsets,
            [0.0, 0.5, 1.5, 3.5, 7.5, 12.5].map(Duration::from_secs_f64)
        );
        assert_eq!(
            *client.calls.lock().unwrap(),
            vec![Call::Download {
                url: "https://example.com/files.zip".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_content_upload_names_file_after_attribute() {
        let client = RecordingClient::default();
        let ops = vec![Operation::new(
            path("notes/summary"),
            OpPayload::UploadFileContent {
                content: b"hello".to_vec(),
                ext: "md".into(),
            },
        )];
        execute_upload_operations(&client, "RUN-1", &ops, &UploadConfig::default())
            .await
            .unwrap();
        assert_eq!(
            *client.calls.lock().unwrap(),
            vec![Call::AttributeChunk {
                filename: "notes/summary.md".into(),
                start: 0,
                end: 5
            }]
        );
    }
}

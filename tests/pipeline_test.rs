//! End-to-end pipeline tests against a recording backend.

use async_trait::async_trait;
use bytes::Bytes;
use runsync::artifact::ArtifactFileData;
use runsync::backend::{ApiClient, ArtifactModel, ChunkMetadata};
use runsync::config::PipelineConfig;
use runsync::operation::{ArtifactEntry, FloatPointValue, OpPayload, Operation};
use runsync::path::AttributePath;
use runsync::upload::chunker::FileChunk;
use runsync::{Error, OperationsExecutor, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    ExecuteOperations(Vec<String>),
    UploadAttributeChunk { filename: String },
    UploadFileSetChunk { filename: String, reset: bool },
    UploadFileSetTar { reset: bool },
    GetArtifactAttribute(String),
    CreateArtifact { hash: String },
    UploadArtifactFilesMetadata { hash: String, files: usize },
    CreateArtifactVersion { parent_hash: String, files: usize },
}

#[derive(Default)]
struct MockBackend {
    calls: Mutex<Vec<Call>>,
    /// Existing artifact hash per attribute path.
    artifact_hashes: Mutex<HashMap<String, String>>,
    /// Upload calls left that answer with a stream/length-mismatch 400.
    upload_failures: AtomicU32,
    /// Whether createNewArtifact reports the file list as already known.
    metadata_already_received: bool,
}

impl MockBackend {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn maybe_fail_upload(&self) -> Result<()> {
        let remaining = self.upload_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.upload_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::ClientHttp {
                status: 400,
                response: r#"{"errorCode":"STREAM_LENGTH_MISMATCH"}"#.into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ApiClient for MockBackend {
    async fn execute_operations(
        &self,
        _run_id: &str,
        operations: &[Operation],
    ) -> Result<Vec<String>> {
        let summary = operations
            .iter()
            .map(|op| format!("{}:{}", op.path, op.payload.name()))
            .collect();
        self.record(Call::ExecuteOperations(summary));
        Ok(Vec::new())
    }

    async fn upload_attribute_chunk(
        &self,
        _run_id: &str,
        _attribute: &AttributePath,
        metadata: &ChunkMetadata,
        _chunk: &FileChunk,
    ) -> Result<()> {
        self.maybe_fail_upload()?;
        self.record(Call::UploadAttributeChunk {
            filename: metadata.filename.clone(),
        });
        Ok(())
    }

    async fn upload_file_set_chunk(
        &self,
        _run_id: &str,
        _attribute: &AttributePath,
        reset: bool,
        metadata: &ChunkMetadata,
        _chunk: &FileChunk,
    ) -> Result<()> {
        self.maybe_fail_upload()?;
        self.record(Call::UploadFileSetChunk {
            filename: metadata.filename.clone(),
            reset,
        });
        Ok(())
    }

    async fn upload_file_set_tar(
        &self,
        _run_id: &str,
        _attribute: &AttributePath,
        reset: bool,
        _archive: Bytes,
    ) -> Result<()> {
        self.maybe_fail_upload()?;
        self.record(Call::UploadFileSetTar { reset });
        Ok(())
    }

    async fn get_artifact_attribute(
        &self,
        _run_id: &str,
        attribute: &AttributePath,
    ) -> Result<Option<String>> {
        self.record(Call::GetArtifactAttribute(attribute.to_string()));
        Ok(self
            .artifact_hashes
            .lock()
            .unwrap()
            .get(&attribute.to_string())
            .cloned())
    }

    async fn create_artifact(
        &self,
        _project_id: &str,
        _run_id: &str,
        hash: &str,
        size: Option<u64>,
    ) -> Result<ArtifactModel> {
        self.record(Call::CreateArtifact { hash: hash.to_owned() });
        Ok(ArtifactModel {
            hash: hash.to_owned(),
            size,
            received_metadata: self.metadata_already_received,
        })
    }

    async fn upload_artifact_files_metadata(
        &self,
        _project_id: &str,
        hash: &str,
        files: &[ArtifactFileData],
    ) -> Result<ArtifactModel> {
        self.record(Call::UploadArtifactFilesMetadata {
            hash: hash.to_owned(),
            files: files.len(),
        });
        Ok(ArtifactModel {
            hash: hash.to_owned(),
            size: None,
            received_metadata: true,
        })
    }

    async fn create_artifact_version(
        &self,
        _project_id: &str,
        _run_id: &str,
        parent_hash: &str,
        files: &[ArtifactFileData],
    ) -> Result<ArtifactModel> {
        self.record(Call::CreateArtifactVersion {
            parent_hash: parent_hash.to_owned(),
            files: files.len(),
        });
        Ok(ArtifactModel {
            hash: format!("{parent_hash}-v2"),
            size: None,
            received_metadata: true,
        })
    }

    async fn prepare_file_set_download(
        &self,
        _run_id: &str,
        _attribute: &AttributePath,
    ) -> Result<String> {
        Ok("download-1".into())
    }

    async fn download_request_status(
        &self,
        _run_id: &str,
        _request_id: &str,
    ) -> Result<Option<String>> {
        Ok(Some("https://downloads.example.com/download-1".into()))
    }

    async fn download_url_to_file(&self, _url: &str, _destination: &Path) -> Result<()> {
        Ok(())
    }
}

fn path(s: &str) -> AttributePath {
    s.parse().unwrap()
}

fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
    let file_path = dir.path().join(name);
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&file_path, content)?;
    Ok(file_path)
}

fn executor(dir: &TempDir, backend: Arc<MockBackend>) -> Result<OperationsExecutor> {
    let config = PipelineConfig {
        hash_cache_file: Some(dir.path().join("hashes.lst")),
        ..PipelineConfig::default()
    };
    OperationsExecutor::new(backend, config)
}

fn log_floats(p: &str, values: &[(f64, f64)]) -> Operation {
    Operation::new(
        path(p),
        OpPayload::LogFloats(
            values
                .iter()
                .map(|&(value, step)| FloatPointValue {
                    value,
                    step: Some(step),
                    timestamp_ms: 1_700_000_000_000,
                })
                .collect(),
        ),
    )
}

#[tokio::test]
async fn test_end_to_end_batch_ordering() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    write_file(&dir, "main.py", b"print('hi')")?;
    let backend = Arc::new(MockBackend::default());
    let mut executor = executor(&dir, backend.clone())?;

    let report = executor
        .execute(
            "RUN-1",
            vec![
                Operation::new(path("sys/name"), OpPayload::AssignString("Untitled".into())),
                log_floats("train/loss", &[(0.5, 1.0)]),
                log_floats("train/loss", &[(0.3, 2.0)]),
                Operation::new(
                    path("source"),
                    OpPayload::UploadFileSet {
                        globs: vec![format!("{}/main.py", dir.path().display())],
                        reset: true,
                    },
                ),
            ],
        )
        .await?;

    assert_eq!(report.processed_count, 4);
    assert!(report.errors.is_empty());
    assert_eq!(
        backend.calls(),
        vec![
            Call::UploadFileSetChunk {
                filename: "main.py".into(),
                reset: true
            },
            Call::ExecuteOperations(vec![
                "sys/name:AssignString".into(),
                "train/loss:LogFloats".into(),
            ]),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_stream_length_mismatch_retries_upload_phase_once() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let model = write_file(&dir, "model.pt", b"weights")?;
    write_file(&dir, "data/train.csv", b"1,2,3")?;
    let backend = Arc::new(MockBackend {
        upload_failures: AtomicU32::new(1),
        ..MockBackend::default()
    });
    let mut executor = executor(&dir, backend.clone())?;

    let report = executor
        .execute(
            "RUN-1",
            vec![
                Operation::new(
                    path("model"),
                    OpPayload::UploadFile {
                        file_path: model,
                        ext: "pt".into(),
                    },
                ),
                Operation::new(path("params/lr"), OpPayload::AssignFloat(0.01)),
                Operation::new(
                    path("datasets/train"),
                    OpPayload::TrackFilesToArtifact {
                        project_id: "PROJ-1".into(),
                        entries: vec![ArtifactEntry {
                            source: format!("{}/data", dir.path().display()),
                            destination: None,
                        }],
                    },
                ),
            ],
        )
        .await?;

    assert!(report.errors.is_empty());
    // Only the upload phase re-runs after the failed first attempt: the
    // artifact phase executes once and exactly one batch RPC goes out.
    let calls = backend.calls();
    assert_eq!(calls.len(), 5);
    assert_eq!(
        calls[0],
        Call::UploadAttributeChunk {
            filename: "model.pt".into()
        }
    );
    assert_eq!(calls[1], Call::GetArtifactAttribute("datasets/train".into()));
    let hash = match &calls[2] {
        Call::CreateArtifact { hash } => hash.clone(),
        other => panic!("unexpected call: {other:?}"),
    };
    assert_eq!(
        calls[3],
        Call::UploadArtifactFilesMetadata { hash, files: 1 }
    );
    assert_eq!(
        calls[4],
        Call::ExecuteOperations(vec![
            "datasets/train:AssignArtifact".into(),
            "params/lr:AssignFloat".into(),
        ])
    );
    Ok(())
}

#[tokio::test]
async fn test_second_stream_length_mismatch_aborts() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let model = write_file(&dir, "model.pt", b"weights")?;
    let backend = Arc::new(MockBackend {
        upload_failures: AtomicU32::new(2),
        ..MockBackend::default()
    });
    let mut executor = executor(&dir, backend.clone())?;

    let result = executor
        .execute(
            "RUN-1",
            vec![Operation::new(
                path("model"),
                OpPayload::UploadFile {
                    file_path: model,
                    ext: "pt".into(),
                },
            )],
        )
        .await;

    assert!(matches!(
        result,
        Err(Error::ClientHttp { status: 400, .. })
    ));
    assert!(backend.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_new_artifact_flow_uploads_metadata_and_assigns_hash() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    write_file(&dir, "data/train.csv", b"1,2,3")?;
    write_file(&dir, "data/test.csv", b"4,5,6")?;
    let backend = Arc::new(MockBackend::default());
    let mut executor = executor(&dir, backend.clone())?;

    let report = executor
        .execute(
            "RUN-1",
            vec![Operation::new(
                path("datasets/train"),
                OpPayload::TrackFilesToArtifact {
                    project_id: "PROJ-1".into(),
                    entries: vec![ArtifactEntry {
                        source: format!("{}/data", dir.path().display()),
                        destination: None,
                    }],
                },
            )],
        )
        .await?;

    assert!(report.errors.is_empty());
    let calls = backend.calls();
    assert_eq!(calls[0], Call::GetArtifactAttribute("datasets/train".into()));
    let hash = match &calls[1] {
        Call::CreateArtifact { hash } => hash.clone(),
        other => panic!("unexpected call: {other:?}"),
    };
    assert_eq!(
        calls[2],
        Call::UploadArtifactFilesMetadata {
            hash: hash.clone(),
            files: 2
        }
    );
    assert_eq!(
        calls[3],
        Call::ExecuteOperations(vec!["datasets/train:AssignArtifact".into()])
    );
    Ok(())
}

#[tokio::test]
async fn test_existing_artifact_gets_a_chained_version() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    write_file(&dir, "data/train.csv", b"1,2,3")?;
    let backend = Arc::new(MockBackend::default());
    backend
        .artifact_hashes
        .lock()
        .unwrap()
        .insert("datasets/train".into(), "priorhash".into());
    let mut executor = executor(&dir, backend.clone())?;

    executor
        .execute(
            "RUN-1",
            vec![Operation::new(
                path("datasets/train"),
                OpPayload::TrackFilesToArtifact {
                    project_id: "PROJ-1".into(),
                    entries: vec![ArtifactEntry {
                        source: format!("{}/data", dir.path().display()),
                        destination: None,
                    }],
                },
            )],
        )
        .await?;

    let calls = backend.calls();
    assert_eq!(
        calls[1],
        Call::CreateArtifactVersion {
            parent_hash: "priorhash".into(),
            files: 1
        }
    );
    assert_eq!(
        calls[2],
        Call::ExecuteOperations(vec!["datasets/train:AssignArtifact".into()])
    );
    Ok(())
}

#[tokio::test]
async fn test_stalled_batch_flushes_delete_before_upload() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let model = write_file(&dir, "model.pt", b"weights")?;
    let backend = Arc::new(MockBackend::default());
    let mut executor = executor(&dir, backend.clone())?;

    let report = executor
        .execute(
            "RUN-1",
            vec![
                Operation::new(path("model"), OpPayload::DeleteAttribute),
                Operation::new(
                    path("model"),
                    OpPayload::UploadFile {
                        file_path: model,
                        ext: "pt".into(),
                    },
                ),
            ],
        )
        .await?;

    assert_eq!(report.processed_count, 2);
    assert_eq!(
        backend.calls(),
        vec![
            Call::ExecuteOperations(vec!["model:DeleteAttribute".into()]),
            Call::UploadAttributeChunk {
                filename: "model.pt".into()
            },
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_type_mismatch_is_collected_not_fatal() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let backend = Arc::new(MockBackend::default());
    let mut executor = executor(&dir, backend.clone())?;

    let report = executor
        .execute(
            "RUN-1",
            vec![
                Operation::new(path("metric"), OpPayload::AssignFloat(1.0)),
                Operation::new(path("metric"), OpPayload::AssignString("oops".into())),
            ],
        )
        .await?;

    assert_eq!(report.errors.len(), 1);
    assert!(matches!(report.errors[0], Error::MetadataInconsistency(_)));
    assert_eq!(
        backend.calls(),
        vec![Call::ExecuteOperations(vec!["metric:AssignFloat".into()])]
    );
    Ok(())
}

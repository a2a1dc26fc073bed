//! Mutation intents against run attributes.
//!
//! `Operation` is the tagged union every layer of the pipeline speaks:
//! produced by callers, compacted by the preprocessor, partitioned by the
//! orchestrator and finally rendered into the batched RPC envelope
//! `{"path": "a/b/c", "<apiOpName>": {fields}}`.

use crate::error::{Error, Result};
use crate::path::AttributePath;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// One point of a float series.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatPointValue {
    pub value: f64,
    pub step: Option<f64>,
    pub timestamp_ms: i64,
}

/// One point of a string series.
#[derive(Debug, Clone, PartialEq)]
pub struct StringPointValue {
    pub value: String,
    pub step: Option<f64>,
    pub timestamp_ms: i64,
}

/// One point of an image series; `data` is the base64-encoded content.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePointValue {
    pub data: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub step: Option<f64>,
    pub timestamp_ms: i64,
}

/// One tracked location of an artifact: a source path plus an optional
/// destination prefix inside the artifact namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactEntry {
    pub source: String,
    pub destination: Option<String>,
}

/// Declared value kind of an attribute. Stable per path until a
/// `DeleteAttribute` resets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    Float,
    Int,
    Bool,
    String,
    Datetime,
    File,
    FileSet,
    FloatSeries,
    StringSeries,
    ImageSeries,
    StringSet,
    Artifact,
}

impl AttributeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeKind::Float => "Float",
            AttributeKind::Int => "Int",
            AttributeKind::Bool => "Bool",
            AttributeKind::String => "String",
            AttributeKind::Datetime => "Datetime",
            AttributeKind::File => "File",
            AttributeKind::FileSet => "File Set",
            AttributeKind::FloatSeries => "Float Series",
            AttributeKind::StringSeries => "String Series",
            AttributeKind::ImageSeries => "Image Series",
            AttributeKind::StringSet => "String Set",
            AttributeKind::Artifact => "Artifact",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpPayload {
    AssignFloat(f64),
    AssignInt(i64),
    AssignBool(bool),
    AssignString(String),
    AssignDatetime(DateTime<Utc>),
    /// Synthetic: produced by the artifact phase, never by callers.
    AssignArtifact {
        hash: String,
    },
    LogFloats(Vec<FloatPointValue>),
    LogStrings(Vec<StringPointValue>),
    LogImages(Vec<ImagePointValue>),
    ClearFloatSeries,
    ClearStringSeries,
    ClearImageSeries,
    ConfigFloatSeries {
        min: Option<f64>,
        max: Option<f64>,
        unit: Option<String>,
    },
    AddStrings(BTreeSet<String>),
    RemoveStrings(BTreeSet<String>),
    ClearStringSet,
    DeleteAttribute,
    UploadFile {
        file_path: PathBuf,
        ext: String,
    },
    UploadFileContent {
        content: Vec<u8>,
        ext: String,
    },
    UploadFileSet {
        globs: Vec<String>,
        reset: bool,
    },
    TrackFilesToArtifact {
        project_id: String,
        entries: Vec<ArtifactEntry>,
    },
    DeleteFiles(BTreeSet<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub path: AttributePath,
    pub payload: OpPayload,
}

impl Operation {
    pub fn new(path: AttributePath, payload: OpPayload) -> Self {
        Operation { path, payload }
    }

    /// Rough payload size, used only for batch byte bounds in the worker.
    pub fn estimated_bytes(&self) -> u64 {
        match &self.payload {
            OpPayload::LogFloats(values) => 24 * values.len() as u64,
            OpPayload::LogStrings(values) => {
                values.iter().map(|v| 16 + v.value.len() as u64).sum()
            }
            OpPayload::LogImages(values) => {
                values.iter().map(|v| 16 + v.data.len() as u64).sum()
            }
            OpPayload::AssignString(value) => value.len() as u64,
            OpPayload::UploadFileContent { content, .. } => content.len() as u64,
            OpPayload::AddStrings(values) | OpPayload::RemoveStrings(values) => {
                values.iter().map(|v| v.len() as u64).sum()
            }
            _ => 64,
        }
    }
}

impl OpPayload {
    /// Short constructor-style name, used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            OpPayload::AssignFloat(_) => "AssignFloat",
            OpPayload::AssignInt(_) => "AssignInt",
            OpPayload::AssignBool(_) => "AssignBool",
            OpPayload::AssignString(_) => "AssignString",
            OpPayload::AssignDatetime(_) => "AssignDatetime",
            OpPayload::AssignArtifact { .. } => "AssignArtifact",
            OpPayload::LogFloats(_) => "LogFloats",
            OpPayload::LogStrings(_) => "LogStrings",
            OpPayload::LogImages(_) => "LogImages",
            OpPayload::ClearFloatSeries => "ClearFloatSeries",
            OpPayload::ClearStringSeries => "ClearStringSeries",
            OpPayload::ClearImageSeries => "ClearImageSeries",
            OpPayload::ConfigFloatSeries { .. } => "ConfigFloatSeries",
            OpPayload::AddStrings(_) => "AddStrings",
            OpPayload::RemoveStrings(_) => "RemoveStrings",
            OpPayload::ClearStringSet => "ClearStringSet",
            OpPayload::DeleteAttribute => "DeleteAttribute",
            OpPayload::UploadFile { .. } => "UploadFile",
            OpPayload::UploadFileContent { .. } => "UploadFileContent",
            OpPayload::UploadFileSet { .. } => "UploadFileSet",
            OpPayload::TrackFilesToArtifact { .. } => "TrackFilesToArtifact",
            OpPayload::DeleteFiles(_) => "DeleteFiles",
        }
    }

    /// Value kind this operation requires of its attribute. `None` for
    /// `DeleteAttribute`, which applies to any kind.
    pub fn required_kind(&self) -> Option<AttributeKind> {
        match self {
            OpPayload::AssignFloat(_) => Some(AttributeKind::Float),
            OpPayload::AssignInt(_) => Some(AttributeKind::Int),
            OpPayload::AssignBool(_) => Some(AttributeKind::Bool),
            OpPayload::AssignString(_) => Some(AttributeKind::String),
            OpPayload::AssignDatetime(_) => Some(AttributeKind::Datetime),
            OpPayload::AssignArtifact { .. } | OpPayload::TrackFilesToArtifact { .. } => {
                Some(AttributeKind::Artifact)
            }
            OpPayload::LogFloats(_) | OpPayload::ClearFloatSeries => {
                Some(AttributeKind::FloatSeries)
            }
            OpPayload::ConfigFloatSeries { .. } => Some(AttributeKind::FloatSeries),
            OpPayload::LogStrings(_) | OpPayload::ClearStringSeries => {
                Some(AttributeKind::StringSeries)
            }
            OpPayload::LogImages(_) | OpPayload::ClearImageSeries => {
                Some(AttributeKind::ImageSeries)
            }
            OpPayload::AddStrings(_) | OpPayload::RemoveStrings(_) | OpPayload::ClearStringSet => {
                Some(AttributeKind::StringSet)
            }
            OpPayload::UploadFile { .. } | OpPayload::UploadFileContent { .. } => {
                Some(AttributeKind::File)
            }
            OpPayload::UploadFileSet { .. } | OpPayload::DeleteFiles(_) => {
                Some(AttributeKind::FileSet)
            }
            OpPayload::DeleteAttribute => None,
        }
    }

    /// Whether this operation goes through the upload phase.
    pub fn is_upload_op(&self) -> bool {
        matches!(
            self,
            OpPayload::UploadFile { .. }
                | OpPayload::UploadFileContent { .. }
                | OpPayload::UploadFileSet { .. }
        )
    }

    /// Whether this operation goes through the artifact phase.
    pub fn is_artifact_tracking_op(&self) -> bool {
        matches!(self, OpPayload::TrackFilesToArtifact { .. })
    }

    /// Wire name in the batched envelope. Upload and artifact-tracking
    /// operations never reach it: they use specialized endpoints.
    pub fn api_name(&self) -> Result<&'static str> {
        let name = match self {
            OpPayload::AssignFloat(_) => "assignFloat",
            OpPayload::AssignInt(_) => "assignInt",
            OpPayload::AssignBool(_) => "assignBool",
            OpPayload::AssignString(_) => "assignString",
            OpPayload::AssignDatetime(_) => "assignDatetime",
            OpPayload::AssignArtifact { .. } => "assignArtifact",
            OpPayload::LogFloats(_) => "logFloats",
            OpPayload::LogStrings(_) => "logStrings",
            OpPayload::LogImages(_) => "logImages",
            OpPayload::ClearFloatSeries => "clearFloatSeries",
            OpPayload::ClearStringSeries => "clearStringSeries",
            OpPayload::ClearImageSeries => "clearImageSeries",
            OpPayload::ConfigFloatSeries { .. } => "configFloatSeries",
            OpPayload::AddStrings(_) => "insertStrings",
            OpPayload::RemoveStrings(_) => "removeStrings",
            OpPayload::ClearStringSet => "clearStringSet",
            OpPayload::DeleteAttribute => "deleteAttribute",
            OpPayload::DeleteFiles(_) => "deleteFiles",
            OpPayload::UploadFile { .. }
            | OpPayload::UploadFileContent { .. }
            | OpPayload::UploadFileSet { .. } => {
                return Err(Error::InternalClient(
                    "specialized endpoints should be used to upload file attributes".into(),
                ))
            }
            OpPayload::TrackFilesToArtifact { .. } => {
                return Err(Error::InternalClient(
                    "specialized endpoint should be used to track artifact files".into(),
                ))
            }
        };
        Ok(name)
    }

    /// Field object paired with `api_name` in the envelope.
    pub fn api_fields(&self) -> Result<Value> {
        let fields = match self {
            OpPayload::AssignFloat(value) => json!({ "value": value }),
            OpPayload::AssignInt(value) => json!({ "value": value }),
            OpPayload::AssignBool(value) => json!({ "value": value }),
            OpPayload::AssignString(value) => json!({ "value": value }),
            OpPayload::AssignDatetime(value) => {
                json!({ "valueMilliseconds": value.timestamp_millis() })
            }
            OpPayload::AssignArtifact { hash } => json!({ "hash": hash }),
            OpPayload::LogFloats(values) => json!({
                "entries": values
                    .iter()
                    .map(|v| json!({
                        "value": v.value,
                        "step": v.step,
                        "timestampMilliseconds": v.timestamp_ms,
                    }))
                    .collect::<Vec<_>>()
            }),
            OpPayload::LogStrings(values) => json!({
                "entries": values
                    .iter()
                    .map(|v| json!({
                        "value": v.value,
                        "step": v.step,
                        "timestampMilliseconds": v.timestamp_ms,
                    }))
                    .collect::<Vec<_>>()
            }),
            OpPayload::LogImages(values) => json!({
                "entries": values
                    .iter()
                    .map(|v| json!({
                        "value": {
                            "data": v.data,
                            "name": v.name,
                            "description": v.description,
                        },
                        "step": v.step,
                        "timestampMilliseconds": v.timestamp_ms,
                    }))
                    .collect::<Vec<_>>()
            }),
            OpPayload::ClearFloatSeries
            | OpPayload::ClearStringSeries
            | OpPayload::ClearImageSeries
            | OpPayload::ClearStringSet
            | OpPayload::DeleteAttribute => json!({}),
            OpPayload::ConfigFloatSeries { min, max, unit } => {
                json!({ "min": min, "max": max, "unit": unit })
            }
            OpPayload::AddStrings(values) | OpPayload::RemoveStrings(values) => {
                json!({ "values": values.iter().collect::<Vec<_>>() })
            }
            OpPayload::DeleteFiles(paths) => {
                json!({ "filePaths": paths.iter().collect::<Vec<_>>() })
            }
            OpPayload::UploadFile { .. }
            | OpPayload::UploadFileContent { .. }
            | OpPayload::UploadFileSet { .. }
            | OpPayload::TrackFilesToArtifact { .. } => {
                // api_name already rejects these.
                return Err(Error::InternalClient(format!(
                    "{} has no batched-envelope representation",
                    self.name()
                )));
            }
        };
        Ok(fields)
    }
}

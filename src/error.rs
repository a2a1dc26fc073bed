//! Error taxonomy for the write pipeline.
//!
//! One enum covers transport, protocol and per-operation failures. The
//! orchestrator distinguishes fatal errors (propagated) from per-operation
//! errors (collected and reported together at the end of a batch).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Retry budget exhausted on a transient transport failure.
    #[error("connection to the metadata store lost: {0}")]
    ConnectionLost(String),

    #[error("unauthorized: invalid or expired credentials")]
    Unauthorized,

    #[error("forbidden: insufficient permissions")]
    Forbidden,

    /// The parent run vanished server-side.
    #[error("run {0} no longer exists")]
    RunNotFound(String),

    #[error("storage or plan limit exceeded: {0}")]
    LimitExceeded(String),

    /// Per-path type mismatch or a server-reported per-operation error.
    /// Non-fatal: collected, sibling operations continue.
    #[error("metadata inconsistency: {0}")]
    MetadataInconsistency(String),

    /// Missing or unreadable upload source. Collected per entry.
    #[error("cannot upload {path}: {reason}")]
    FileUpload { path: String, reason: String },

    #[error("file of {size} bytes cannot be uploaded: exceeds {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },

    /// Fatal for the affected artifact operation only.
    #[error("artifact uploading error: {0}")]
    ArtifactUploading(String),

    #[error("no files found under {location} for artifact {namespace}")]
    EmptyArtifactLocation { location: String, namespace: String },

    /// Non-retryable 4xx response with its body preserved for inspection.
    #[error("server returned {status}: {response}")]
    ClientHttp { status: u16, response: String },

    /// Producer-side backpressure gave up waiting for queue capacity.
    #[error("operation queue still full after {0:?}")]
    QueueFull(std::time::Duration),

    #[error("internal client error: {0}")]
    InternalClient(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Server-side error code for a chunk whose length disagrees with its
/// declared byte range. Older backends only report it in prose.
const STREAM_LENGTH_MISMATCH_CODE: &str = "STREAM_LENGTH_MISMATCH";
const STREAM_LENGTH_MISMATCH_TEXT: &str = "Length of stream does not match given range";

impl Error {
    /// Whether a single RPC carrying this error may be re-issued.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConnectionLost(_) => true,
            Error::ClientHttp { status, .. } => {
                matches!(status, 408 | 429) || (500..=599).contains(status)
            }
            _ => false,
        }
    }

    /// The one batch-level retry exception: a 400 telling us the uploaded
    /// stream length disagreed with its range header.
    pub fn is_stream_length_mismatch(&self) -> bool {
        match self {
            Error::ClientHttp { status: 400, response } => {
                response.contains(STREAM_LENGTH_MISMATCH_CODE)
                    || response.contains(STREAM_LENGTH_MISMATCH_TEXT)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        let transient = Error::ClientHttp {
            status: 503,
            response: "unavailable".into(),
        };
        assert!(transient.is_retryable());
        assert!(Error::ClientHttp {
            status: 429,
            response: String::new()
        }
        .is_retryable());
        assert!(Error::ConnectionLost("timed out".into()).is_retryable());

        let fatal = Error::ClientHttp {
            status: 404,
            response: "not found".into(),
        };
        assert!(!fatal.is_retryable());
        assert!(!Error::Unauthorized.is_retryable());
    }

    #[test]
    fn test_stream_length_mismatch_detection() {
        let coded = Error::ClientHttp {
            status: 400,
            response: r#"{"errorCode":"STREAM_LENGTH_MISMATCH"}"#.into(),
        };
        assert!(coded.is_stream_length_mismatch());

        let prose = Error::ClientHttp {
            status: 400,
            response: "Length of stream does not match given range".into(),
        };
        assert!(prose.is_stream_length_mismatch());

        let other = Error::ClientHttp {
            status: 400,
            response: "malformed attribute path".into(),
        };
        assert!(!other.is_stream_length_mismatch());
    }
}

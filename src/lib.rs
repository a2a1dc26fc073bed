//! Client-side write pipeline for a remote run-metadata store.
//!
//! Callers submit small mutation intents against named attributes of a run:
//! scalar assigns, series logs, set edits, file uploads, content-addressed
//! artifact tracking. The pipeline compacts them per attribute path, then
//! executes one batch in phases: chunked/bulk file uploads first, artifact
//! hashing and registration next, and finally one batched operations RPC.
//! A bounded background worker sits on top for low-latency logging.
//!
//! Typical wiring:
//!
//! ```no_run
//! use runsync::{HttpApiClient, OperationsExecutor, PipelineConfig, RetryingClient};
//! use runsync::worker::{RunSink, WorkerHandle};
//! use std::sync::Arc;
//!
//! # fn main() -> runsync::Result<()> {
//! let config = PipelineConfig::default();
//! let client = RetryingClient::new(
//!     HttpApiClient::new("https://app.example.com", "token")?,
//!     config.retry.clone(),
//! );
//! let executor = OperationsExecutor::new(Arc::new(client), config.clone())?;
//! let worker = WorkerHandle::spawn(RunSink::new(executor, "RUN-1"), config.worker);
//! # let _ = worker;
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod backend;
pub mod config;
pub mod error;
pub mod operation;
pub mod path;
pub mod preprocessor;
pub mod upload;
pub mod worker;

pub use backend::executor::{ExecutionReport, OperationsExecutor};
pub use backend::http::HttpApiClient;
pub use backend::retry::RetryingClient;
pub use backend::ApiClient;
pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use operation::{OpPayload, Operation};
pub use path::AttributePath;

//! reqwest implementation of the backend trait.
//!
//! All URL, query and header construction lives here, behind the trait, so
//! the rest of the pipeline stays wire-agnostic.

use crate::artifact::ArtifactFileData;
use crate::backend::{ApiClient, ArtifactModel, ChunkMetadata};
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::path::AttributePath;
use crate::upload::chunker::FileChunk;
use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde_json::{json, Value};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const HEADER_FILENAME: &str = "Content-Filename";
const HEADER_RANGE: &str = "X-Range";
const HEADER_PERMISSIONS: &str = "X-File-Permissions";
const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Clone)]
pub struct HttpApiClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl HttpApiClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|err| Error::InternalClient(format!("invalid server URL: {err}")))?;
        Ok(HttpApiClient {
            http: reqwest::Client::new(),
            base_url,
            token: token.to_owned(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|err| Error::InternalClient(format!("failed to build API URL: {err}")))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Response> {
        let response = req
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| Error::ConnectionLost(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status.as_u16(), body))
        }
    }

    async fn send_json(&self, req: reqwest::RequestBuilder) -> Result<Value> {
        let response = self.send(req).await?;
        let body = response
            .text()
            .await
            .map_err(|err| Error::ConnectionLost(err.to_string()))?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    fn chunk_request(
        &self,
        url: Url,
        metadata: &ChunkMetadata,
        chunk: &FileChunk,
    ) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, OCTET_STREAM)
            .header(HEADER_FILENAME, metadata.filename.clone())
            .header(HEADER_RANGE, x_range_header(chunk, metadata.total_size));
        if let Some(permissions) = &metadata.permissions {
            req = req.header(HEADER_PERMISSIONS, permissions.clone());
        }
        req.body(chunk.data.clone())
    }
}

/// `bytes=<start>-<end-1>[/<total>]`, total omitted when unknown.
fn x_range_header(chunk: &FileChunk, total: Option<u64>) -> String {
    let end = chunk.end as i64 - 1;
    match total {
        Some(total) => format!("bytes={}-{}/{}", chunk.start, end, total),
        None => format!("bytes={}-{}", chunk.start, end),
    }
}

/// Maps a non-success status to the error taxonomy. 404 stays a plain client
/// error here; endpoints that give it a specific meaning handle it first.
fn classify_status(status: u16, body: String) -> Error {
    match status {
        401 => Error::Unauthorized,
        403 => Error::Forbidden,
        402 | 422 => {
            let title = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("title").and_then(Value::as_str).map(str::to_owned))
                .unwrap_or_else(|| "Unknown reason".to_owned());
            Error::LimitExceeded(title)
        }
        status => Error::ClientHttp {
            status,
            response: body,
        },
    }
}

/// Renders operations into the batched envelope:
/// `{"path": "a/b/c", "<apiOpName>": {fields}}`.
fn operations_to_json(operations: &[Operation]) -> Result<Value> {
    let mut rendered = Vec::with_capacity(operations.len());
    for op in operations {
        let mut envelope = serde_json::Map::new();
        envelope.insert("path".to_owned(), Value::String(op.path.to_string()));
        envelope.insert(op.payload.api_name()?.to_owned(), op.payload.api_fields()?);
        rendered.push(Value::Object(envelope));
    }
    Ok(Value::Array(rendered))
}

fn error_descriptions(response: &Value) -> Vec<String> {
    response
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("errorDescription"))
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn execute_operations(
        &self,
        run_id: &str,
        operations: &[Operation],
    ) -> Result<Vec<String>> {
        let url = self.url("api/leaderboard/v1/experiments/operations")?;
        let body = operations_to_json(operations)?;
        debug!(run_id, operations = operations.len(), "executing operation batch");
        let result = self
            .send_json(
                self.http
                    .post(url)
                    .query(&[("experimentId", run_id)])
                    .json(&body),
            )
            .await;
        match result {
            Ok(response) => Ok(error_descriptions(&response)),
            Err(Error::ClientHttp { status: 404, .. }) => {
                Err(Error::RunNotFound(run_id.to_owned()))
            }
            Err(err) => Err(err),
        }
    }

    async fn upload_attribute_chunk(
        &self,
        run_id: &str,
        attribute: &AttributePath,
        metadata: &ChunkMetadata,
        chunk: &FileChunk,
    ) -> Result<()> {
        let mut url = self.url("api/leaderboard/v1/attributes/upload")?;
        url.query_pairs_mut()
            .append_pair("experimentId", run_id)
            .append_pair("attribute", &attribute.to_string());
        self.send(self.chunk_request(url, metadata, chunk)).await?;
        Ok(())
    }

    async fn upload_file_set_chunk(
        &self,
        run_id: &str,
        attribute: &AttributePath,
        reset: bool,
        metadata: &ChunkMetadata,
        chunk: &FileChunk,
    ) -> Result<()> {
        let mut url = self.url("api/leaderboard/v1/attributes/uploadFileSetChunk")?;
        url.query_pairs_mut()
            .append_pair("experimentId", run_id)
            .append_pair("attribute", &attribute.to_string())
            .append_pair("subPath", &metadata.filename)
            .append_pair("reset", if reset { "true" } else { "false" });
        self.send(self.chunk_request(url, metadata, chunk)).await?;
        Ok(())
    }

    async fn upload_file_set_tar(
        &self,
        run_id: &str,
        attribute: &AttributePath,
        reset: bool,
        archive: bytes::Bytes,
    ) -> Result<()> {
        let mut url = self.url("api/leaderboard/v1/attributes/uploadFileSetTar")?;
        url.query_pairs_mut()
            .append_pair("experimentId", run_id)
            .append_pair("attribute", &attribute.to_string())
            .append_pair("reset", if reset { "true" } else { "false" });
        self.send(
            self.http
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, OCTET_STREAM)
                .body(archive),
        )
        .await?;
        Ok(())
    }

    async fn get_artifact_attribute(
        &self,
        run_id: &str,
        attribute: &AttributePath,
    ) -> Result<Option<String>> {
        let mut url = self.url("api/leaderboard/v1/attributes/artifact")?;
        url.query_pairs_mut()
            .append_pair("experimentId", run_id)
            .append_pair("attribute", &attribute.to_string());
        match self.send_json(self.http.get(url)).await {
            Ok(response) => Ok(response
                .get("hash")
                .and_then(Value::as_str)
                .map(str::to_owned)),
            Err(Error::ClientHttp { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create_artifact(
        &self,
        project_id: &str,
        run_id: &str,
        hash: &str,
        size: Option<u64>,
    ) -> Result<ArtifactModel> {
        let mut url = self.url("api/artifacts/v1/artifacts")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("projectIdentifier", project_id)
                .append_pair("parentIdentifier", run_id)
                .append_pair("hash", hash);
            if let Some(size) = size {
                pairs.append_pair("size", &size.to_string());
            }
        }
        let response = self.send_json(self.http.post(url)).await?;
        parse_artifact_model(&response)
    }

    async fn upload_artifact_files_metadata(
        &self,
        project_id: &str,
        hash: &str,
        files: &[ArtifactFileData],
    ) -> Result<ArtifactModel> {
        let mut url = self.url("api/artifacts/v1/artifacts/files")?;
        url.query_pairs_mut()
            .append_pair("projectIdentifier", project_id)
            .append_pair("hash", hash);
        let body = json!({ "files": files });
        let response = self.send_json(self.http.post(url).json(&body)).await?;
        parse_artifact_model(&response)
    }

    async fn create_artifact_version(
        &self,
        project_id: &str,
        run_id: &str,
        parent_hash: &str,
        files: &[ArtifactFileData],
    ) -> Result<ArtifactModel> {
        let mut url = self.url("api/artifacts/v1/versions")?;
        url.query_pairs_mut()
            .append_pair("projectIdentifier", project_id)
            .append_pair("parentIdentifier", run_id)
            .append_pair("hash", parent_hash);
        let body = json!({ "files": files });
        let response = self.send_json(self.http.post(url).json(&body)).await?;
        parse_artifact_model(&response)
    }

    async fn prepare_file_set_download(
        &self,
        run_id: &str,
        attribute: &AttributePath,
    ) -> Result<String> {
        let mut url = self.url("api/leaderboard/v1/attributes/downloadFileSet/prepare")?;
        url.query_pairs_mut()
            .append_pair("experimentId", run_id)
            .append_pair("attribute", &attribute.to_string());
        let response = self.send_json(self.http.post(url)).await?;
        response
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                Error::InternalClient(format!("unexpected response from server: {response}"))
            })
    }

    async fn download_request_status(
        &self,
        _run_id: &str,
        request_id: &str,
    ) -> Result<Option<String>> {
        let mut url = self.url("api/leaderboard/v1/attributes/downloadFileSet/status")?;
        url.query_pairs_mut().append_pair("id", request_id);
        let response = self.send_json(self.http.get(url)).await?;
        Ok(response
            .get("downloadUrl")
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    async fn download_url_to_file(&self, url: &str, destination: &Path) -> Result<()> {
        let mut response = self
            .send(self.http.get(url).header(reqwest::header::ACCEPT, "application/zip"))
            .await?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(destination).await?;
        while let Some(piece) = response
            .chunk()
            .await
            .map_err(|err| Error::ConnectionLost(err.to_string()))?
        {
            file.write_all(&piece).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

fn parse_artifact_model(response: &Value) -> Result<ArtifactModel> {
    let hash = response
        .get("artifactHash")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::InternalClient(format!("unexpected response from server: {response}"))
        })?;
    Ok(ArtifactModel {
        hash: hash.to_owned(),
        size: response.get("size").and_then(Value::as_u64),
        received_metadata: response
            .get("receivedMetadata")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

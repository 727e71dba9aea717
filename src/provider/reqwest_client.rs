//! Production `ProviderClient` backed by `reqwest`.
//!
//! Grounded in `http::ReqwestHttpClient`: one shared `reqwest::Client`, request-level timeout,
//! bearer auth header, `#[tracing::instrument]` per call, status mapped to an error kind rather
//! than surfaced as a raw reqwest error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{
    BatchStatus, CreatedBatch, FileMetadata, ProviderClient, ProviderError, ProviderResult,
    UploadedFile,
};
use crate::model::Endpoint;

#[derive(Clone)]
pub struct ReqwestProviderClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl ReqwestProviderClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout,
        }
    }

    fn status_to_error(status: reqwest::StatusCode, body: String) -> ProviderError {
        match status.as_u16() {
            401 | 403 => ProviderError::Unauthorized,
            404 => ProviderError::NotFound,
            400 | 422 => ProviderError::BadRequest(body),
            500..=599 => ProviderError::ServerError,
            other => ProviderError::HttpError(other),
        }
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> ProviderResult<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method, &url)
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", self.api_key));
        if let Some(body) = body {
            req = req.json(&body);
        }

        let response = req
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::status_to_error(status, text));
        }

        serde_json::from_str(&text).map_err(|e| ProviderError::RequestFailed(e.to_string()))
    }
}

#[async_trait]
impl ProviderClient for ReqwestProviderClient {
    #[tracing::instrument(skip(self), fields(path = %path.display()))]
    async fn upload_file(&self, path: &Path) -> ProviderResult<UploadedFile> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        let len = bytes.len() as u64;

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "batch.jsonl".to_string());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename);
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);

        let url = format!("{}/files", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(120).max(self.timeout))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::status_to_error(status, text));
        }

        let parsed: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        let input_file_id = parsed["id"]
            .as_str()
            .ok_or_else(|| ProviderError::RequestFailed("missing file id in response".into()))?
            .to_string();

        tracing::info!(input_file_id = %input_file_id, bytes = len, "uploaded batch file");
        Ok(UploadedFile { input_file_id, bytes: len })
    }

    #[tracing::instrument(skip(self))]
    async fn create_batch(
        &self,
        input_file_id: &str,
        endpoint: Endpoint,
        completion_window: &str,
    ) -> ProviderResult<CreatedBatch> {
        let body = serde_json::json!({
            "input_file_id": input_file_id,
            "endpoint": endpoint.as_str(),
            "completion_window": completion_window,
        });
        let parsed = self.send_json(reqwest::Method::POST, "/batches", Some(body)).await?;

        Ok(CreatedBatch {
            provider_batch_id: parsed["id"].as_str().unwrap_or_default().to_string(),
            status: parsed["status"].as_str().unwrap_or_default().to_string(),
            expires_at: parsed["expires_at"]
                .as_i64()
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn check_status(&self, provider_batch_id: &str) -> ProviderResult<BatchStatus> {
        let path = format!("/batches/{}", provider_batch_id);
        let parsed = self.send_json(reqwest::Method::GET, &path, None).await?;

        let usage = parsed.get("usage").map(|u| crate::model::TokenUsage {
            input: u["input_tokens"].as_u64().unwrap_or(0),
            cached: u["input_tokens_details"]["cached_tokens"].as_u64().unwrap_or(0),
            reasoning: u["output_tokens_details"]["reasoning_tokens"].as_u64().unwrap_or(0),
            output: u["output_tokens"].as_u64().unwrap_or(0),
        });

        Ok(BatchStatus {
            status: parsed["status"].as_str().unwrap_or_default().to_string(),
            output_file_id: parsed["output_file_id"].as_str().map(String::from),
            error_file_id: parsed["error_file_id"].as_str().map(String::from),
            usage,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn cancel_batch(&self, provider_batch_id: &str) -> ProviderResult<()> {
        let path = format!("/batches/{}/cancel", provider_batch_id);
        self.send_json(reqwest::Method::POST, &path, None).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(dest = %dest_path.display()))]
    async fn download_file(&self, file_id: &str, dest_path: &Path) -> ProviderResult<PathBuf> {
        let url = format!("{}/files/{}/content", self.base_url, file_id);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(120).max(self.timeout))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::status_to_error(status, text));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

        let mut file = tokio::fs::File::create(dest_path)
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

        Ok(dest_path.to_path_buf())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_file(&self, file_id: &str) -> ProviderResult<()> {
        let path = format!("/files/{}", file_id);
        match self.send_json(reqwest::Method::DELETE, &path, None).await {
            Ok(_) => Ok(()),
            Err(ProviderError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn retrieve_file_metadata(&self, file_id: &str) -> ProviderResult<FileMetadata> {
        let path = format!("/files/{}", file_id);
        let parsed = self.send_json(reqwest::Method::GET, &path, None).await?;

        Ok(FileMetadata {
            id: parsed["id"].as_str().unwrap_or_default().to_string(),
            bytes: parsed["bytes"].as_u64().unwrap_or(0),
            filename: parsed["filename"].as_str().unwrap_or_default().to_string(),
        })
    }
}

//! `ProviderClient` — the seven-method contract the Lifecycle Engine drives against an LLM
//! provider's async batch API (`SPEC_FULL.md` §6).
//!
//! Grounded in the teacher's `http::HttpClient` trait: one `#[async_trait]` abstraction with a
//! production `reqwest`-backed implementation and a keyed-response-queue mock, generalized from
//! `HttpClient`'s single `execute` method to the seven batch-lifecycle operations.

pub mod mock;
pub mod reqwest_client;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{Endpoint, TokenUsage};

pub use mock::MockProviderClient;
pub use reqwest_client::ReqwestProviderClient;

/// Error kinds a provider call can fail with (`SPEC_FULL.md` §6). Distinct from the crate-wide
/// [`crate::error::Error`]: the Lifecycle Engine branches on these kinds (e.g. `NotFound` on
/// `check_status` means the provider batch vanished upstream), so they're preserved structurally
/// rather than collapsed into `Error::Other` at the call site.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("server error")]
    ServerError,
    #[error("http error: {0}")]
    HttpError(u16),
    #[error("request failed: {0}")]
    RequestFailed(String),
}

impl From<ProviderError> for crate::error::Error {
    fn from(e: ProviderError) -> Self {
        crate::error::Error::Other(anyhow::anyhow!(e))
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub input_file_id: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedBatch {
    pub provider_batch_id: String,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchStatus {
    pub status: String,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub id: String,
    pub bytes: u64,
    pub filename: String,
}

/// The provider's async batch API, as the Lifecycle Engine needs it.
///
/// Implementations are responsible for their own transient-error retries; the core tolerates
/// either a retrying or a non-retrying implementation (`SPEC_FULL.md` §6).
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn upload_file(&self, path: &Path) -> ProviderResult<UploadedFile>;

    async fn create_batch(
        &self,
        input_file_id: &str,
        endpoint: Endpoint,
        completion_window: &str,
    ) -> ProviderResult<CreatedBatch>;

    async fn check_status(&self, provider_batch_id: &str) -> ProviderResult<BatchStatus>;

    async fn cancel_batch(&self, provider_batch_id: &str) -> ProviderResult<()>;

    async fn download_file(&self, file_id: &str, dest_path: &Path) -> ProviderResult<PathBuf>;

    async fn delete_file(&self, file_id: &str) -> ProviderResult<()>;

    async fn retrieve_file_metadata(&self, file_id: &str) -> ProviderResult<FileMetadata>;
}

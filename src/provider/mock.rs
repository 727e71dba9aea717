//! Test `ProviderClient` with a keyed, FIFO response queue.
//!
//! Grounded in `http::MockHttpClient`: responses are queued per method key and consumed in
//! order, every call is recorded for assertions, and an unconfigured call is a hard error rather
//! than a silent default — tests must stub exactly the calls they expect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    BatchStatus, CreatedBatch, FileMetadata, ProviderClient, ProviderError, ProviderResult,
    UploadedFile,
};
use crate::model::Endpoint;

#[derive(Debug, Clone)]
pub enum MockCall {
    UploadFile { path: PathBuf },
    CreateBatch { input_file_id: String, endpoint: Endpoint },
    CheckStatus { provider_batch_id: String },
    CancelBatch { provider_batch_id: String },
    DownloadFile { file_id: String },
    DeleteFile { file_id: String },
    RetrieveFileMetadata { file_id: String },
}

#[derive(Default)]
pub struct MockProviderClient {
    upload_file: Mutex<Vec<ProviderResult<UploadedFile>>>,
    create_batch: Mutex<Vec<ProviderResult<CreatedBatch>>>,
    check_status: Mutex<Vec<ProviderResult<BatchStatus>>>,
    cancel_batch: Mutex<Vec<ProviderResult<()>>>,
    download_file: Mutex<Vec<ProviderResult<Vec<u8>>>>,
    delete_file: Mutex<Vec<ProviderResult<()>>>,
    retrieve_file_metadata: Mutex<Vec<ProviderResult<FileMetadata>>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockProviderClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue_upload_file(&self, result: ProviderResult<UploadedFile>) {
        self.upload_file.lock().push(result);
    }

    pub fn queue_create_batch(&self, result: ProviderResult<CreatedBatch>) {
        self.create_batch.lock().push(result);
    }

    pub fn queue_check_status(&self, result: ProviderResult<BatchStatus>) {
        self.check_status.lock().push(result);
    }

    pub fn queue_cancel_batch(&self, result: ProviderResult<()>) {
        self.cancel_batch.lock().push(result);
    }

    /// Queues the bytes that `download_file` writes to the caller's `dest_path`.
    pub fn queue_download_file(&self, result: ProviderResult<Vec<u8>>) {
        self.download_file.lock().push(result);
    }

    pub fn queue_delete_file(&self, result: ProviderResult<()>) {
        self.delete_file.lock().push(result);
    }

    pub fn queue_retrieve_file_metadata(&self, result: ProviderResult<FileMetadata>) {
        self.retrieve_file_metadata.lock().push(result);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }
}

fn pop_or_unconfigured<T>(queue: &Mutex<Vec<ProviderResult<T>>>, what: &str) -> ProviderResult<T> {
    let mut queue = queue.lock();
    if queue.is_empty() {
        return Err(ProviderError::RequestFailed(format!(
            "no mock response configured for {what}"
        )));
    }
    queue.remove(0)
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    async fn upload_file(&self, path: &Path) -> ProviderResult<UploadedFile> {
        self.calls.lock().push(MockCall::UploadFile { path: path.to_path_buf() });
        pop_or_unconfigured(&self.upload_file, "upload_file")
    }

    async fn create_batch(
        &self,
        input_file_id: &str,
        endpoint: Endpoint,
        _completion_window: &str,
    ) -> ProviderResult<CreatedBatch> {
        self.calls.lock().push(MockCall::CreateBatch {
            input_file_id: input_file_id.to_string(),
            endpoint,
        });
        pop_or_unconfigured(&self.create_batch, "create_batch")
    }

    async fn check_status(&self, provider_batch_id: &str) -> ProviderResult<BatchStatus> {
        self.calls.lock().push(MockCall::CheckStatus {
            provider_batch_id: provider_batch_id.to_string(),
        });
        pop_or_unconfigured(&self.check_status, "check_status")
    }

    async fn cancel_batch(&self, provider_batch_id: &str) -> ProviderResult<()> {
        self.calls.lock().push(MockCall::CancelBatch {
            provider_batch_id: provider_batch_id.to_string(),
        });
        pop_or_unconfigured(&self.cancel_batch, "cancel_batch")
    }

    async fn download_file(&self, file_id: &str, dest_path: &Path) -> ProviderResult<PathBuf> {
        self.calls.lock().push(MockCall::DownloadFile { file_id: file_id.to_string() });
        let bytes = pop_or_unconfigured(&self.download_file, "download_file")?;
        tokio::fs::write(dest_path, bytes)
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        Ok(dest_path.to_path_buf())
    }

    async fn delete_file(&self, file_id: &str) -> ProviderResult<()> {
        self.calls.lock().push(MockCall::DeleteFile { file_id: file_id.to_string() });
        pop_or_unconfigured(&self.delete_file, "delete_file")
    }

    async fn retrieve_file_metadata(&self, file_id: &str) -> ProviderResult<FileMetadata> {
        self.calls
            .lock()
            .push(MockCall::RetrieveFileMetadata { file_id: file_id.to_string() });
        pop_or_unconfigured(&self.retrieve_file_metadata, "retrieve_file_metadata")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_responses_are_consumed_fifo() {
        let mock = MockProviderClient::new();
        mock.queue_upload_file(Ok(UploadedFile {
            input_file_id: "file-1".into(),
            bytes: 42,
        }));

        let result = mock.upload_file(Path::new("/tmp/batch.jsonl")).await.unwrap();
        assert_eq!(result.input_file_id, "file-1");
        assert_eq!(mock.calls().len(), 1);
    }

    #[tokio::test]
    async fn unconfigured_call_is_an_error() {
        let mock = MockProviderClient::new();
        let err = mock.cancel_batch("batch-x").await.unwrap_err();
        assert!(matches!(err, ProviderError::RequestFailed(_)));
    }
}

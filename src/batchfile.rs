//! NDJSON batch file I/O (`SPEC_FULL.md` §6).
//!
//! No direct teacher analogue — the teacher proxies requests one at a time and never writes a
//! provider-batch file. Built in the teacher's idiom (`Result<T>`-returning, `tracing`-
//! instrumented, streamed rather than buffered whole) since this is the one adapter boundary the
//! teacher doesn't already show a pattern for.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::Result;
use crate::model::{AnyRequest, BatchId};

/// One line of the batch file written for the provider (`SPEC_FULL.md` §6: "Batch file
/// format"): `custom_id`, `method:"POST"`, `url`, `body`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BatchFileLine {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: serde_json::Value,
}

pub fn batch_file_path(base: &Path, batch_id: BatchId) -> PathBuf {
    base.join(format!("batch_{}.jsonl", batch_id))
}

/// Writes one NDJSON line per Request. Requests must already be in the Batch's `(endpoint,
/// model)`; the caller (the `upload` Lifecycle action) is responsible for selecting them.
#[tracing::instrument(skip(requests))]
pub async fn write_batch_file(
    base: &Path,
    batch_id: BatchId,
    requests: &[AnyRequest],
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(base).await?;

    let total_size: u64 = requests.iter().map(|r| r.data().request_payload_size).sum();
    ensure_capacity(base, total_size)?;

    let path = batch_file_path(base, batch_id);
    let mut file = tokio::fs::File::create(&path).await?;

    for request in requests {
        let data = request.data();
        let line = BatchFileLine {
            custom_id: data.custom_id.clone(),
            method: "POST".to_string(),
            url: data.endpoint.as_path().to_string(),
            body: data.request_payload.clone(),
        };
        let mut serialized = serde_json::to_vec(&line)?;
        serialized.push(b'\n');
        file.write_all(&serialized).await?;
    }

    file.flush().await?;
    tracing::info!(%batch_id, lines = requests.len(), bytes = total_size, path = %path.display(), "wrote batch file");
    Ok(path)
}

/// Streams the lines back for verification (round-trip tests) rather than reading the whole
/// file into memory, matching how the Result Processor streams the much larger provider output
/// files.
pub async fn read_batch_file(path: &Path) -> Result<Vec<BatchFileLine>> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file).lines();

    let mut lines = Vec::new();
    while let Some(line) = reader.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        lines.push(serde_json::from_str(&line)?);
    }
    Ok(lines)
}

/// Best-effort capacity check. The dependency stack has no disk-usage crate, so this only
/// confirms `base` is a writable directory; it does not consult actual free space.
fn ensure_capacity(base: &Path, _required_bytes: u64) -> Result<()> {
    let metadata = std::fs::metadata(base)?;
    if !metadata.is_dir() {
        return Err(crate::error::Error::Other(anyhow::anyhow!(
            "{} is not a directory",
            base.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::request::Pending;
    use crate::model::{DeliveryConfig, Endpoint, Request, RequestData, RequestId};

    fn request(batch_id: BatchId, custom_id: &str) -> AnyRequest {
        let payload = serde_json::json!({"model": "gpt-4o-mini", "input": "hi"});
        let now = chrono::Utc::now();
        AnyRequest::Pending(Request {
            state: Pending {},
            data: RequestData {
                id: RequestId(1),
                batch_id,
                custom_id: custom_id.to_string(),
                endpoint: Endpoint::Responses,
                model: "gpt-4o-mini".into(),
                request_payload_size: RequestData::compute_payload_size(&payload).unwrap(),
                request_payload: payload,
                delivery_config: DeliveryConfig::Webhook {
                    url: "https://example.com/hook".into(),
                },
                response_payload: None,
                error_msg: None,
                created_at: now,
                updated_at: now,
            },
        })
    }

    #[tokio::test]
    async fn round_trips_requests_to_ndjson() {
        let dir = tempfile_dir();
        let batch_id = BatchId(7);
        let requests = vec![request(batch_id, "cid-1"), request(batch_id, "cid-2")];

        let path = write_batch_file(&dir, batch_id, &requests).await.unwrap();
        let lines = read_batch_file(&path).await.unwrap();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].custom_id, "cid-1");
        assert_eq!(lines[0].method, "POST");
        assert_eq!(lines[0].url, "/v1/responses");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    fn tempfile_dir() -> PathBuf {
        std::env::temp_dir().join(format!("batch-manager-test-{}", uuid::Uuid::new_v4()))
    }
}

//! Result Processor — `process_downloaded_file` (`SPEC_FULL.md` §4.5).
//!
//! No direct teacher analogue: the teacher proxies one request at a time and never parses a
//! provider-batch output file. Built in the teacher's idiom (`Result<T>`-returning,
//! `tracing`-instrumented, streamed line-by-line rather than buffered whole), informed by the
//! NDJSON streaming shape already established in `batchfile.rs`.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::bus::{Bus, BusEvent};
use crate::jobrunner::{Job, JobRunner};
use crate::model::AnyBatch;
use crate::model::BatchId;
use crate::provider::ProviderClient;
use crate::store::Store;

/// One line of the provider's output or error file (`SPEC_FULL.md` §6).
#[derive(Debug, Deserialize)]
struct OutputLine {
    custom_id: String,
    #[serde(default)]
    response: Option<ResponseBody>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    status_code: Option<u16>,
    body: Value,
}

/// Downloads the output (and error, if present) file, joins each line to its Request by
/// `custom_id`, transitions every matched Request, sweeps any Request left in
/// `provider_processing` to `failed`, then transitions the Batch to `ready_to_deliver` and
/// enqueues `start_delivering`.
///
/// Idempotent: a Request that already left `provider_processing` (because this job was
/// re-delivered after a partial run) is skipped rather than re-transitioned, since
/// `start_provider_processing`/`complete_processing`/`fail` are themselves guarded by the Store.
#[allow(clippy::too_many_arguments)]
pub async fn process_downloaded_file<St: Store, P: ProviderClient, JR: JobRunner, B: Bus>(
    store: &St,
    provider: &P,
    jobrunner: &JR,
    bus: &B,
    storage_base: &PathBuf,
    start_delivering_trigger: &(dyn Fn(BatchId) -> Job + Send + Sync),
    batch_id: BatchId,
) -> crate::error::Result<()> {
    let any = store.get_batch(batch_id).await?;
    let AnyBatch::Downloading(batch) = any else {
        tracing::debug!(%batch_id, state = any.state_name(), "process_downloaded_file: wrong state, skipping");
        return Ok(());
    };

    if let Err(e) = run(store, provider, storage_base, batch_id, &batch.data).await {
        tracing::error!(%batch_id, error = %e, "result processing failed, failing batch");
        let _ = batch.fail(store, format!("result processing failed: {e}")).await;
        let _ = bus
            .publish(BusEvent::BatchStateChanged { batch_id, state: "failed" })
            .await;
        return Err(e);
    }

    let any = store.get_batch(batch_id).await?;
    let AnyBatch::Downloading(batch) = any else {
        return Ok(());
    };
    let ready = batch.finalize(store).await?;
    let _ = bus
        .publish(BusEvent::BatchStateChanged { batch_id, state: ready.state.name() })
        .await;

    let ready_id = ready.data.id;
    let started = ready.start_delivering(store).await?;
    let _ = bus
        .publish(BusEvent::BatchStateChanged { batch_id: ready_id, state: started.state.name() })
        .await;
    jobrunner
        .enqueue("batch_processing", start_delivering_trigger(batch_id))
        .await?;

    Ok(())
}

async fn run<St: Store, P: ProviderClient>(
    store: &St,
    provider: &P,
    storage_base: &PathBuf,
    batch_id: BatchId,
    data: &crate::model::batch::BatchData,
) -> crate::error::Result<()> {
    tokio::fs::create_dir_all(storage_base).await?;

    let output_file_id = data
        .provider_output_file_id
        .clone()
        .ok_or_else(|| crate::error::Error::Other(anyhow::anyhow!("batch {batch_id} has no output file id")))?;

    let output_path = storage_base.join(format!("batch_{batch_id}_output.jsonl"));
    provider.download_file(&output_file_id, &output_path).await?;
    process_lines(store, batch_id, &output_path, true).await?;

    if let Some(error_file_id) = &data.provider_error_file_id {
        let error_path = storage_base.join(format!("batch_{batch_id}_error.jsonl"));
        provider.download_file(error_file_id, &error_path).await?;
        process_lines(store, batch_id, &error_path, false).await?;
        tokio::fs::remove_file(&error_path).await.ok();
    }

    tokio::fs::remove_file(&output_path).await.ok();

    // Any Request still `provider_processing` after both files got no result (`SPEC_FULL.md`
    // §4.5 step 5).
    for request in store.list_requests_in_state(batch_id, "provider_processing").await? {
        let Some(processing) = request.as_provider_processing().cloned() else {
            continue;
        };
        processing.fail(store, "no result returned").await?;
    }

    Ok(())
}

/// Parses one NDJSON file and applies its lines. `is_success_file` distinguishes the output file
/// (lines with a `response` are successes) from the error file (every line is a failure).
async fn process_lines<St: Store>(
    store: &St,
    batch_id: BatchId,
    path: &std::path::Path,
    is_success_file: bool,
) -> crate::error::Result<()> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: OutputLine = serde_json::from_str(&line)?;

        let Some(any) = store.get_request_by_custom_id(batch_id, &parsed.custom_id).await? else {
            tracing::warn!(%batch_id, custom_id = %parsed.custom_id, "output line has no matching request, skipping");
            continue;
        };
        let Some(processing) = any.as_provider_processing().cloned() else {
            // Already transitioned past `provider_processing` — a re-delivered job, or a line
            // for a Request this file already reported on. No-op.
            continue;
        };

        if is_success_file && parsed.error.is_none() {
            if let Some(response) = parsed.response {
                let mut data = processing.data.clone();
                data.response_payload = Some(response.body);
                let updated = crate::model::Request {
                    state: processing.state.clone(),
                    data,
                };
                updated.complete_processing(store).await?;
            } else {
                processing.fail(store, "output line missing response body").await?;
            }
        } else {
            let error_msg = parsed
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "provider reported an error for this request".to_string());
            processing.fail(store, error_msg).await?;
        }
    }

    Ok(())
}

//! Lifecycle Engine — one function per `SPEC_FULL.md` §4.4 row. Each is JobRunner-invoked and
//! idempotent: a re-delivered job that finds the Batch already past the expected state is a
//! silent no-op rather than an error, since the guarded `Store::persist_batch` call is what
//! actually enforces the state machine.
//!
//! Grounded on `daemon::mod::Daemon::run`'s claim → dispatch → guarded-transition → re-enqueue
//! shape, generalized from "one daemon loop polling one queue" to "one function per job type,
//! each scheduled on its own named queue by the JobRunner".

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use crate::bus::{Bus, BusEvent};
use crate::config::Config;
use crate::jobrunner::{Job, JobRunner};
use crate::model::batch::ProviderProcessing;
use crate::model::{AnyBatch, BatchId};
use crate::provider::ProviderClient;
use crate::store::Store;

const COMPLETION_WINDOW: &str = "24h";

/// `state = building AND age > building_batch_max_age`: delete empty Batches outright, upload
/// the rest. Triggered by a periodic sweep over `Store::list_building_batches_older_than`.
pub async fn expire_stale_building<St: Store, JR: JobRunner, B: Bus>(
    store: &St,
    jobrunner: &JR,
    bus: &B,
    config: &Config,
    upload_trigger: &(dyn Fn(BatchId) -> Job + Send + Sync),
) -> crate::error::Result<()> {
    let stale = store.list_building_batches_older_than(config.building_batch_max_age).await?;
    for batch in stale {
        let (count, _bytes) = store.batch_request_stats(batch.data.id).await?;
        if count == 0 {
            store.delete_batch(batch.data.id).await?;
            let _ = bus.publish(BusEvent::BatchDestroyed { batch_id: batch.data.id }).await;
            tracing::info!(batch_id = %batch.data.id, "deleted empty stale building batch");
            continue;
        }

        let batch_id = batch.data.id;
        let uploading = batch.start_upload(store).await?;
        let _ = bus
            .publish(BusEvent::BatchStateChanged { batch_id, state: "uploading" })
            .await;
        jobrunner.enqueue("batch_uploads", upload_trigger(batch_id)).await?;
        tracing::info!(%batch_id, state = uploading.state.name(), "force-closed stale building batch");
    }
    Ok(())
}

/// `state = uploading`: assemble the batch file, upload it, transition `uploaded`, enqueue
/// `create_provider`.
pub async fn upload<St: Store, P: ProviderClient, JR: JobRunner, B: Bus>(
    store: &St,
    provider: &P,
    jobrunner: &JR,
    bus: &B,
    storage_base: &PathBuf,
    create_provider_trigger: &(dyn Fn(BatchId) -> Job + Send + Sync),
    batch_id: BatchId,
) -> crate::error::Result<()> {
    let any = store.get_batch(batch_id).await?;
    let AnyBatch::Uploading(mut batch) = any else {
        tracing::debug!(%batch_id, state = any.state_name(), "upload: batch no longer uploading, skipping");
        return Ok(());
    };

    let requests = store.list_requests_for_batch(batch_id).await?;
    let path = crate::batchfile::write_batch_file(storage_base, batch_id, &requests).await?;
    let uploaded = provider.upload_file(&path).await?;

    batch.data.provider_input_file_id = Some(uploaded.input_file_id);
    batch.data.updated_at = Utc::now();

    let next = batch.upload(store).await?;
    let _ = bus
        .publish(BusEvent::BatchStateChanged { batch_id, state: "uploaded" })
        .await;
    jobrunner.enqueue("default", create_provider_trigger(batch_id)).await?;
    tracing::info!(%batch_id, state = next.state.name(), "uploaded batch file to provider");
    Ok(())
}

/// `state = uploaded|expired`: create the provider batch, transition `provider_processing`,
/// schedule the first status poll.
pub async fn create_provider<St: Store, P: ProviderClient, JR: JobRunner, B: Bus>(
    store: &St,
    provider: &P,
    jobrunner: &JR,
    bus: &B,
    check_status_trigger: &(dyn Fn(BatchId) -> Job + Send + Sync),
    batch_id: BatchId,
) -> crate::error::Result<()> {
    let any = store.get_batch(batch_id).await?;

    let (input_file_id, endpoint) = match &any {
        AnyBatch::Uploaded(b) => (b.data.provider_input_file_id.clone(), b.data.endpoint),
        AnyBatch::Expired(b) => (b.data.provider_input_file_id.clone(), b.data.endpoint),
        _ => {
            tracing::debug!(%batch_id, state = any.state_name(), "create_provider: wrong state, skipping");
            return Ok(());
        }
    };
    let Some(input_file_id) = input_file_id else {
        return Err(crate::error::Error::Other(anyhow::anyhow!(
            "batch {batch_id} has no provider_input_file_id"
        )));
    };

    let created = provider.create_batch(&input_file_id, endpoint, COMPLETION_WINDOW).await?;

    let state_name = match &any {
        AnyBatch::Uploaded(b) => {
            let mut b = b.clone();
            b.data.provider_batch_id = Some(created.provider_batch_id);
            b.data.expires_at = created.expires_at;
            b.data.updated_at = Utc::now();
            let next = b.create_provider(store).await?;
            next.state.name()
        }
        AnyBatch::Expired(b) => {
            let mut b = b.clone();
            b.data.provider_batch_id = Some(created.provider_batch_id);
            b.data.expires_at = created.expires_at;
            b.data.updated_at = Utc::now();
            let next = b.create_provider(store).await?;
            next.state.name()
        }
        _ => unreachable!(),
    };

    let _ = bus
        .publish(BusEvent::BatchStateChanged { batch_id, state: "provider_processing" })
        .await;

    // `pending -> provider_processing` on parent Batch `create_provider` (§4.3).
    for request in store.list_requests_in_state(batch_id, "pending").await? {
        let Some(pending) = request.as_pending().cloned() else {
            continue;
        };
        let request_id = pending.data.id;
        pending.start_provider_processing(store).await?;
        let _ = bus
            .publish(BusEvent::RequestStateChanged { request_id, state: "provider_processing" })
            .await;
    }

    jobrunner.enqueue("default", check_status_trigger(batch_id)).await?;
    tracing::info!(%batch_id, state = state_name, "created provider batch");
    Ok(())
}

/// `state = provider_processing` (periodic): poll the provider; branch on reported status.
pub async fn check_status<St: Store, P: ProviderClient, JR: JobRunner, B: Bus>(
    store: &St,
    provider: &P,
    jobrunner: &JR,
    bus: &B,
    start_downloading_trigger: &(dyn Fn(BatchId) -> Job + Send + Sync),
    create_provider_trigger: &(dyn Fn(BatchId) -> Job + Send + Sync),
    batch_id: BatchId,
) -> crate::error::Result<()> {
    let any = store.get_batch(batch_id).await?;
    let AnyBatch::ProviderProcessing(mut batch) = any else {
        tracing::debug!(%batch_id, state = any.state_name(), "check_status: wrong state, skipping");
        return Ok(());
    };

    let Some(provider_batch_id) = batch.data.provider_batch_id.clone() else {
        return Err(crate::error::Error::Other(anyhow::anyhow!(
            "batch {batch_id} has no provider_batch_id"
        )));
    };

    let status = provider.check_status(&provider_batch_id).await?;
    batch.data.provider_status_last_checked_at = Some(Utc::now());
    if let Some(usage) = status.usage {
        batch.data.usage = usage;
    }

    match status.status.as_str() {
        "completed" => {
            batch.data.provider_output_file_id = status.output_file_id;
            batch.data.provider_error_file_id = status.error_file_id;
            let next = batch.finish_processing(store).await?;
            let _ = bus
                .publish(BusEvent::BatchStateChanged { batch_id, state: next.state.name() })
                .await;
            jobrunner.enqueue("batch_processing", start_downloading_trigger(batch_id)).await?;
        }
        "expired" => {
            let next = batch.mark_expired(store).await?;
            let _ = bus
                .publish(BusEvent::BatchStateChanged { batch_id, state: next.state.name() })
                .await;
            // §4.2: "expired is a special non-terminal that loops back to provider_processing
            // via create_provider" — re-create from the same input file rather than waiting for
            // a caller to notice.
            jobrunner
                .enqueue("default", create_provider_trigger(batch_id))
                .await?;
        }
        "failed" => {
            let next = batch.fail(store, "provider reported batch failed").await?;
            let _ = bus
                .publish(BusEvent::BatchStateChanged { batch_id, state: next.state.name() })
                .await;
        }
        other => {
            // validating/in_progress/finalizing: persist the refreshed timestamp/usage and wait
            // for the next poll.
            batch.persist_unchanged(store).await?;
            tracing::debug!(%batch_id, provider_status = other, "batch still processing");
        }
    }

    Ok(())
}

impl crate::model::Batch<ProviderProcessing> {
    /// Re-persists the same state with updated common-field data (poll timestamp, usage) — used
    /// when `check_status` has nothing to transition yet.
    async fn persist_unchanged<St: Store>(&self, store: &St) -> crate::error::Result<()> {
        store.persist_batch("provider_processing", self).await
    }
}

/// Periodic sweep backing the `check_status` row's "(periodic)" trigger: polls every Batch
/// currently `provider_processing` rather than waiting on a per-batch self-reschedule.
pub async fn poll_provider_processing<St: Store, P: ProviderClient, JR: JobRunner, B: Bus>(
    store: &St,
    provider: &P,
    jobrunner: &JR,
    bus: &B,
    start_downloading_trigger: &(dyn Fn(BatchId) -> Job + Send + Sync),
    create_provider_trigger: &(dyn Fn(BatchId) -> Job + Send + Sync),
) -> crate::error::Result<()> {
    for batch_id in store.list_batches_in_state("provider_processing").await? {
        check_status(
            store,
            provider,
            jobrunner,
            bus,
            start_downloading_trigger,
            create_provider_trigger,
            batch_id,
        )
        .await?;
    }
    Ok(())
}

/// Periodic sweep backing the `expires_at < now` row: destroys any Batch whose provider-side
/// batch has expired, regardless of which state it's currently parked in.
pub async fn sweep_expired_batches<St: Store, P: ProviderClient, B: Bus>(
    store: &St,
    provider: &P,
    bus: &B,
) -> crate::error::Result<()> {
    for state_name in [
        "uploading",
        "uploaded",
        "provider_processing",
        "provider_completed",
        "downloading",
        "ready_to_deliver",
    ] {
        for batch_id in store.list_batches_in_state(state_name).await? {
            let any = store.get_batch(batch_id).await?;
            let expired = any.data().expires_at.is_some_and(|at| at < Utc::now());
            if expired {
                delete_expired_batch(store, provider, bus, batch_id).await?;
            }
        }
    }
    Ok(())
}

/// `state = provider_completed`: transition `downloading`, enqueue `process_downloaded_file`.
pub async fn start_downloading<St: Store, JR: JobRunner, B: Bus>(
    store: &St,
    jobrunner: &JR,
    bus: &B,
    process_downloaded_trigger: &(dyn Fn(BatchId) -> Job + Send + Sync),
    batch_id: BatchId,
) -> crate::error::Result<()> {
    let any = store.get_batch(batch_id).await?;
    let AnyBatch::ProviderCompleted(batch) = any else {
        tracing::debug!(%batch_id, state = any.state_name(), "start_downloading: wrong state, skipping");
        return Ok(());
    };

    let next = batch.start_downloading(store).await?;
    let _ = bus
        .publish(BusEvent::BatchStateChanged { batch_id, state: next.state.name() })
        .await;
    jobrunner
        .enqueue("batch_processing", process_downloaded_trigger(batch_id))
        .await?;
    Ok(())
}

/// `state = delivering`: aggregate terminal Request counts and resolve the Batch's final
/// delivery state per `SPEC_FULL.md` §4.7.
pub async fn check_delivery_completion<St: Store, B: Bus>(
    store: &St,
    bus: &B,
    batch_id: BatchId,
) -> crate::error::Result<()> {
    let any = store.get_batch(batch_id).await?;
    let AnyBatch::Delivering(batch) = any else {
        tracing::debug!(%batch_id, state = any.state_name(), "check_delivery_completion: wrong state, skipping");
        return Ok(());
    };

    let counts = store.delivery_completion_counts(batch_id).await?;
    if !counts.all_resolved() {
        tracing::debug!(%batch_id, ?counts, "delivery still in flight");
        return Ok(());
    }

    let state_name = if counts.delivered == counts.total {
        batch.mark_delivered(store).await?.state.name()
    } else if counts.delivered == 0 {
        batch.mark_delivery_failed(store).await?.state.name()
    } else {
        batch.mark_partial(store).await?.state.name()
    };

    let _ = bus
        .publish(BusEvent::BatchStateChanged { batch_id, state: state_name })
        .await;
    tracing::info!(%batch_id, state = state_name, ?counts, "batch delivery resolved");
    Ok(())
}

/// `expires_at < now`: best-effort cancel the upstream provider batch and delete its files, then
/// destroy the Batch (cascading to its Requests/Transitions/DeliveryAttempts).
pub async fn delete_expired_batch<St: Store, P: ProviderClient, B: Bus>(
    store: &St,
    provider: &P,
    bus: &B,
    batch_id: BatchId,
) -> crate::error::Result<()> {
    let any = store.get_batch(batch_id).await?;
    let data = any.data();

    if let Some(provider_batch_id) = &data.provider_batch_id {
        if let Err(e) = provider.cancel_batch(provider_batch_id).await {
            tracing::warn!(%batch_id, error = ?e, "failed to cancel upstream provider batch");
        }
    }
    for file_id in [&data.provider_input_file_id, &data.provider_output_file_id, &data.provider_error_file_id] {
        if let Some(file_id) = file_id {
            if let Err(e) = provider.delete_file(file_id).await {
                tracing::warn!(%batch_id, error = ?e, "failed to delete provider file");
            }
        }
    }

    store.delete_batch(batch_id).await?;
    let _ = bus.publish(BusEvent::BatchDestroyed { batch_id }).await;
    tracing::info!(%batch_id, "deleted expired batch");
    Ok(())
}

/// `state = downloading`: delegates to the Result Processor (`SPEC_FULL.md` §4.5).
pub async fn process_downloaded_file<St: Store, P: ProviderClient, JR: JobRunner, B: Bus>(
    store: &St,
    provider: &P,
    jobrunner: &JR,
    bus: &B,
    storage_base: &PathBuf,
    start_delivering_trigger: &(dyn Fn(BatchId) -> Job + Send + Sync),
    batch_id: BatchId,
) -> crate::error::Result<()> {
    crate::result_processor::process_downloaded_file(
        store,
        provider,
        jobrunner,
        bus,
        storage_base,
        start_delivering_trigger,
        batch_id,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::jobrunner::InMemoryJobRunner;
    use crate::model::Endpoint;
    use crate::provider::{BatchStatus, CreatedBatch, MockProviderClient, UploadedFile};
    use crate::store::in_memory::InMemoryStore;
    use std::sync::Arc;

    fn noop_trigger() -> Arc<dyn Fn(BatchId) -> Job + Send + Sync> {
        Arc::new(|_id: BatchId| -> Job { Box::pin(async { Ok(()) }) })
    }

    #[tokio::test]
    async fn upload_then_create_provider_reaches_processing() {
        let store = InMemoryStore::new();
        let bus = InMemoryBus::new();
        let jobrunner = InMemoryJobRunner::default();
        let provider = MockProviderClient::new();
        let dir = std::env::temp_dir().join(format!("batch-manager-lifecycle-{}", uuid::Uuid::new_v4()));

        let batch = store.create_building_batch(Endpoint::Responses, "gpt-4o-mini").await.unwrap();
        let uploading = batch.start_upload(&store).await.unwrap();
        let _ = uploading;

        provider.queue_upload_file(Ok(UploadedFile {
            input_file_id: "file-1".into(),
            bytes: 10,
        }));
        provider.queue_create_batch(Ok(CreatedBatch {
            provider_batch_id: "batch-x".into(),
            status: "validating".into(),
            expires_at: None,
        }));
        provider.queue_check_status(Ok(BatchStatus {
            status: "completed".into(),
            output_file_id: Some("out-1".into()),
            error_file_id: None,
            usage: None,
        }));

        let trigger = noop_trigger();
        let batch_id = store
            .list_batches_in_state("uploading")
            .await
            .unwrap()[0];

        upload(&store, &*provider, &jobrunner, &bus, &dir, trigger.as_ref(), batch_id)
            .await
            .unwrap();
        create_provider(&store, &*provider, &jobrunner, &bus, trigger.as_ref(), batch_id)
            .await
            .unwrap();
        check_status(&store, &*provider, &jobrunner, &bus, trigger.as_ref(), trigger.as_ref(), batch_id)
            .await
            .unwrap();

        let fetched = store.get_batch(batch_id).await.unwrap();
        assert_eq!(fetched.state_name(), "provider_completed");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}

//! Delivery Engine — per-Request delivery (`SPEC_FULL.md` §4.6) and redelivery (§4.7).
//!
//! Grounded in `request::transitions`'s per-state `impl` blocks for the transition shape and in
//! `daemon::mod`'s JoinSet dispatch loop for "one queued unit of work per Request, gated by a
//! named-queue concurrency limit" — generalized here from "dispatch an HTTP call" to "dispatch a
//! call through whichever `Sink` the Request's `DeliveryConfig` selects".

use std::time::Duration;

use serde_json::Value;

use crate::bus::{Bus, BusEvent};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::jobrunner::{Job, JobRunner};
use crate::model::{AnyBatch, AnyRequest, BatchId, RequestId};
use crate::sinks::{Outcome, Sink};
use crate::store::{DeliveryAttempt, Store};

/// Base/ceiling for delivery-retry backoff. Not specified numerically by `SPEC_FULL.md` §4.6
/// (only the queue-sink reconnect backoff is); chosen to match that same base/ceiling so the two
/// retry policies in this crate read the same way (see `DESIGN.md`).
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(30);

fn backoff_for_attempt(attempt_number: u32) -> Duration {
    let exp = attempt_number.min(5);
    let delay = RETRY_BASE.saturating_mul(1 << exp);
    delay.min(RETRY_MAX)
}

/// `state = delivering` (entered once per Batch, right after the Result Processor finishes):
/// enqueues one `deliver_one` job per Request currently `provider_processed`. A re-delivered job
/// for the same Batch only picks up Requests still in that state, so it's safe to run twice.
pub async fn dispatch_batch_deliveries<St: Store, JR: JobRunner>(
    store: &St,
    jobrunner: &JR,
    deliver_trigger: &(dyn Fn(RequestId) -> Job + Send + Sync),
    batch_id: BatchId,
) -> Result<()> {
    for request in store.list_requests_in_state(batch_id, "provider_processed").await? {
        jobrunner.enqueue("delivery", deliver_trigger(request.data().id)).await?;
    }
    Ok(())
}

/// Delivers one Request currently in `provider_processed`. A Request found in any other state is
/// a no-op (already delivered by a previous run of this same job, or raced by a concurrent
/// redelivery).
pub async fn deliver_one<St: Store, JR: JobRunner, B: Bus, Sk: Sink>(
    store: &St,
    jobrunner: &JR,
    bus: &B,
    sink: &Sk,
    config: &Config,
    retry_trigger: &(dyn Fn(RequestId) -> Job + Send + Sync),
    check_completion_trigger: &(dyn Fn(BatchId) -> Job + Send + Sync),
    request_id: RequestId,
) -> Result<()> {
    let any = store.get_request(request_id).await?;
    let AnyRequest::ProviderProcessed(processed) = any else {
        tracing::debug!(%request_id, state = any.state_name(), "deliver_one: wrong state, skipping");
        return Ok(());
    };

    let batch_id = processed.data.batch_id;
    let payload = processed.data.response_payload.clone().unwrap_or(Value::Null);
    let delivery_config = processed.data.delivery_config.clone();

    let delivering = processed.start_delivering(store).await?;
    let _ = bus
        .publish(BusEvent::RequestStateChanged { request_id, state: "delivering" })
        .await;

    let outcome = sink
        .deliver(&delivery_config, &payload)
        .await
        .unwrap_or_else(|e| Outcome::Other(e.to_string()));

    let attempt_number = store.delivery_attempt_count(request_id).await? + 1;
    store
        .insert_delivery_attempt(DeliveryAttempt {
            request_id,
            attempt_number,
            outcome: outcome.clone(),
            delivery_config: delivery_config.clone(),
            error_msg: outcome.error_msg(),
            at: chrono::Utc::now(),
        })
        .await?;

    if outcome == Outcome::Success {
        delivering.mark_delivered(store).await?;
        let _ = bus
            .publish(BusEvent::RequestStateChanged { request_id, state: "delivered" })
            .await;
        jobrunner
            .enqueue("batch_processing", check_completion_trigger(batch_id))
            .await?;
        return Ok(());
    }

    if attempt_number < config.effective_delivery_max_attempts() && outcome.is_transient() {
        let delay = backoff_for_attempt(attempt_number);
        tracing::warn!(%request_id, attempt_number, outcome = outcome.as_str(), ?delay, "delivery failed transiently, retrying");

        // Put the Request back in `provider_processed` so the retried job sees it as
        // deliverable again; a plain re-dispatch, not a `delivery_failed` excursion.
        delivering.retry_transient(store).await?;
        let _ = bus
            .publish(BusEvent::RequestStateChanged { request_id, state: "provider_processed" })
            .await;

        jobrunner
            .enqueue_after("delivery", delay, retry_trigger(request_id))
            .await?;
        return Ok(());
    }

    let error_msg = outcome.error_msg().unwrap_or_else(|| outcome.as_str().to_string());
    delivering.mark_delivery_failed(store, error_msg).await?;
    let _ = bus
        .publish(BusEvent::RequestStateChanged { request_id, state: "delivery_failed" })
        .await;
    jobrunner
        .enqueue("batch_processing", check_completion_trigger(batch_id))
        .await?;
    Ok(())
}

/// `retry_request_delivery` (`SPEC_FULL.md` §4.7 "Redelivery"): allowed only while the parent
/// Batch is `delivering`, `partially_delivered`, or `delivery_failed`.
pub async fn retry_request_delivery<St: Store, JR: JobRunner, B: Bus>(
    store: &St,
    jobrunner: &JR,
    bus: &B,
    retry_trigger: &(dyn Fn(RequestId) -> Job + Send + Sync),
    request_id: RequestId,
) -> Result<()> {
    let any_request = store.get_request(request_id).await?;
    let batch_id = any_request.data().batch_id;
    let any_batch = store.get_batch(batch_id).await?;

    match any_batch {
        AnyBatch::Delivering(_) => {}
        AnyBatch::PartiallyDelivered(b) => {
            let delivering = b.begin_redeliver(store).await?;
            let _ = bus
                .publish(BusEvent::BatchStateChanged { batch_id, state: delivering.state.name() })
                .await;
        }
        AnyBatch::DeliveryFailed(b) => {
            let delivering = b.begin_redeliver(store).await?;
            let _ = bus
                .publish(BusEvent::BatchStateChanged { batch_id, state: delivering.state.name() })
                .await;
        }
        other => {
            return Err(Error::WrongState {
                entity: "batch".to_string(),
                expected: "delivering|partially_delivered|delivery_failed".to_string(),
                found: other.state_name().to_string(),
            });
        }
    }

    let AnyRequest::DeliveryFailed(failed) = any_request else {
        return Err(Error::WrongState {
            entity: "request".to_string(),
            expected: "delivery_failed".to_string(),
            found: any_request.state_name().to_string(),
        });
    };

    failed.retry_delivery(store).await?;
    let _ = bus
        .publish(BusEvent::RequestStateChanged { request_id, state: "provider_processed" })
        .await;
    jobrunner.enqueue("delivery", retry_trigger(request_id)).await?;
    Ok(())
}

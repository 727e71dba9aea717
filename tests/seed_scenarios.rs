//! End-to-end seed scenarios (`SPEC_FULL.md` §8) driven straight through the public API:
//! `Intake` admits, `AggregatorRegistry::flush` force-closes the draft Batch, and each
//! Lifecycle/Delivery/Result-Processor function is called directly in sequence rather than
//! through `InMemoryJobRunner`'s background dispatch — the same determinism-over-polling choice
//! the crate's own unit tests make (see `lifecycle::tests`, `delivery::tests`).

use std::path::PathBuf;
use std::sync::Arc;

use batch_manager::aggregator::AggregatorRegistry;
use batch_manager::bus::InMemoryBus;
use batch_manager::config::Config;
use batch_manager::delivery;
use batch_manager::error::Result;
use batch_manager::jobrunner::{InMemoryJobRunner, Job};
use batch_manager::lifecycle;
use batch_manager::model::{BatchId, DeliveryConfig, Endpoint, QueueDelivery, RequestId};
use batch_manager::provider::{BatchStatus, CreatedBatch, MockProviderClient, UploadedFile};
use batch_manager::sinks::{DestinationCache, Outcome, Sink};
use batch_manager::store::in_memory::InMemoryStore;
use batch_manager::store::Store;
use batch_manager::{AdmitError, Intake, IntakeRequest};
use serde_json::Value;

fn noop_batch_trigger() -> Arc<dyn Fn(BatchId) -> Job + Send + Sync> {
    Arc::new(|_id: BatchId| -> Job { Box::pin(async { Ok(()) }) })
}

fn noop_request_trigger() -> Arc<dyn Fn(RequestId) -> Job + Send + Sync> {
    Arc::new(|_id: RequestId| -> Job { Box::pin(async { Ok(()) }) })
}

fn scratch_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("batch-manager-{name}-{}", uuid::Uuid::new_v4()))
}

/// Webhook sink whose outcome is decided by a marker substring in the URL, so a test can
/// script "this destination always fails" without a real HTTP server (same approach as
/// `delivery::tests::AlwaysSucceeds`, extended to branch per-destination).
struct ScriptedWebhookSink;

#[async_trait::async_trait]
impl Sink for ScriptedWebhookSink {
    async fn deliver(&self, config: &DeliveryConfig, _payload: &Value) -> Result<Outcome> {
        let DeliveryConfig::Webhook { url } = config else {
            return Ok(Outcome::Other("scripted sink invoked with non-webhook config".into()));
        };
        if url.contains("fail") {
            Ok(Outcome::HttpStatusNot2xx)
        } else {
            Ok(Outcome::Success)
        }
    }
}

/// Stands in for `QueueSink` without a real broker: a fixed set of "existing" queues, backed by
/// the real `DestinationCache` so the cache-hit/TTL/clear behavior under test is the genuine
/// article, only the "does this queue exist" broker round-trip is faked.
struct ScriptedQueueSink {
    cache: Arc<DestinationCache>,
    existing_queues: parking_lot::Mutex<std::collections::HashSet<String>>,
    broker_round_trips: std::sync::atomic::AtomicUsize,
}

impl ScriptedQueueSink {
    fn new(cache: Arc<DestinationCache>) -> Self {
        Self {
            cache,
            existing_queues: parking_lot::Mutex::new(std::collections::HashSet::new()),
            broker_round_trips: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn create_queue(&self, name: &str) {
        self.existing_queues.lock().insert(name.to_string());
    }

    fn round_trip_count(&self) -> usize {
        self.broker_round_trips.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Sink for ScriptedQueueSink {
    async fn deliver(&self, config: &DeliveryConfig, _payload: &Value) -> Result<Outcome> {
        let Some((exchange, routing_key)) = config.queue_destination_key() else {
            return Ok(Outcome::Other("scripted sink invoked with non-queue config".into()));
        };
        let DeliveryConfig::Queue(QueueDelivery::Named { queue_name }) = config else {
            return Ok(Outcome::Other("scripted sink only models named queues".into()));
        };

        if let Some(cached) = self.cache.lookup(&exchange, &routing_key) {
            return Ok(cached.err().unwrap_or(Outcome::Success));
        }

        self.broker_round_trips.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.existing_queues.lock().contains(queue_name) {
            self.cache.mark_validated(&exchange, &routing_key);
            Ok(Outcome::Success)
        } else {
            self.cache.mark_failed(&exchange, &routing_key, Outcome::QueueNotFound);
            Ok(Outcome::QueueNotFound)
        }
    }
}

fn webhook_delivery(marker: &str) -> DeliveryConfig {
    DeliveryConfig::Webhook {
        url: format!("https://example.com/hook-{marker}"),
    }
}

/// Builds the shared collaborators once per test and hands back the pieces a scenario needs —
/// `Intake`/`AggregatorRegistry` share one `Store`/`Bus`/`JobRunner`, matching how `main.rs`
/// wires the real worker.
fn build_harness(
    name: &str,
) -> (
    Arc<InMemoryStore>,
    Arc<InMemoryBus>,
    Arc<InMemoryJobRunner>,
    Arc<MockProviderClient>,
    Config,
    Intake<InMemoryStore, InMemoryJobRunner, InMemoryBus>,
    Arc<AggregatorRegistry<InMemoryStore, InMemoryJobRunner, InMemoryBus>>,
    PathBuf,
) {
    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let jobrunner = Arc::new(InMemoryJobRunner::default());
    let provider = MockProviderClient::new();
    let config = Config::default();
    let registry = Arc::new(AggregatorRegistry::new(
        store.clone(),
        jobrunner.clone(),
        bus.clone(),
        config.clone(),
        noop_batch_trigger(),
    ));
    let intake = Intake::new(registry.clone());
    let dir = scratch_dir(name);
    (store, bus, jobrunner, provider, config, intake, registry, dir)
}

async fn admit(
    intake: &Intake<InMemoryStore, InMemoryJobRunner, InMemoryBus>,
    custom_id: &str,
    delivery: DeliveryConfig,
) -> std::result::Result<RequestId, AdmitError> {
    intake
        .admit(IntakeRequest {
            custom_id: custom_id.to_string(),
            endpoint: Endpoint::Responses,
            model: "gpt-4o-mini".into(),
            request_payload: serde_json::json!({"model": "gpt-4o-mini", "input": custom_id}),
            delivery,
        })
        .await
        .map(|r| r.id())
}

/// Drives a closed Batch from `building` through `downloading`, returning its id. Every Request
/// ends up `provider_processed` with the given per-`custom_id` response/error outcome, ready for
/// the Delivery Engine.
async fn drive_to_ready_for_delivery(
    store: &InMemoryStore,
    bus: &InMemoryBus,
    jobrunner: &InMemoryJobRunner,
    provider: &MockProviderClient,
    dir: &PathBuf,
    outcomes: &[(&str, std::result::Result<Value, String>)],
) -> BatchId {
    let batch_id = store.list_batches_in_state("uploading").await.unwrap()[0];
    let noop = noop_batch_trigger();

    provider.queue_upload_file(Ok(UploadedFile { input_file_id: "file-1".into(), bytes: 10 }));
    lifecycle::upload(store, provider, jobrunner, bus, dir, noop.as_ref(), batch_id)
        .await
        .unwrap();

    provider.queue_create_batch(Ok(CreatedBatch {
        provider_batch_id: "provider-batch-1".into(),
        status: "validating".into(),
        expires_at: None,
    }));
    lifecycle::create_provider(store, provider, jobrunner, bus, noop.as_ref(), batch_id)
        .await
        .unwrap();

    provider.queue_check_status(Ok(BatchStatus {
        status: "completed".into(),
        output_file_id: Some("out-1".into()),
        error_file_id: if outcomes.iter().any(|(_, r)| r.is_err()) {
            Some("err-1".into())
        } else {
            None
        },
        usage: None,
    }));
    lifecycle::check_status(store, provider, jobrunner, bus, noop.as_ref(), noop.as_ref(), batch_id)
        .await
        .unwrap();

    lifecycle::start_downloading(store, jobrunner, bus, noop.as_ref(), batch_id)
        .await
        .unwrap();

    let mut output_lines = String::new();
    let mut error_lines = String::new();
    for (custom_id, outcome) in outcomes {
        match outcome {
            Ok(body) => {
                output_lines.push_str(
                    &serde_json::json!({
                        "custom_id": custom_id,
                        "response": {"status_code": 200, "body": body},
                        "error": null,
                    })
                    .to_string(),
                );
                output_lines.push('\n');
            }
            Err(msg) => {
                error_lines.push_str(
                    &serde_json::json!({"custom_id": custom_id, "error": {"message": msg}}).to_string(),
                );
                error_lines.push('\n');
            }
        }
    }

    provider.queue_download_file(Ok(output_lines.into_bytes()));
    if !error_lines.is_empty() {
        provider.queue_download_file(Ok(error_lines.into_bytes()));
    }
    lifecycle::process_downloaded_file(store, provider, jobrunner, bus, dir, noop.as_ref(), batch_id)
        .await
        .unwrap();

    batch_id
}

#[tokio::test]
async fn happy_path_all_webhooks_deliver() {
    let (store, bus, jobrunner, provider, config, intake, registry, dir) = build_harness("happy");

    admit(&intake, "cid-1", webhook_delivery("ok")).await.unwrap();
    admit(&intake, "cid-2", webhook_delivery("ok")).await.unwrap();
    admit(&intake, "cid-3", webhook_delivery("ok")).await.unwrap();
    registry.flush(Endpoint::Responses, "gpt-4o-mini").await.unwrap();

    let batch_id = drive_to_ready_for_delivery(
        &store,
        &bus,
        &jobrunner,
        &provider,
        &dir,
        &[
            ("cid-1", Ok(serde_json::json!({"ok": true}))),
            ("cid-2", Ok(serde_json::json!({"ok": true}))),
            ("cid-3", Ok(serde_json::json!({"ok": true}))),
        ],
    )
    .await;
    assert_eq!(store.get_batch(batch_id).await.unwrap().state_name(), "delivering");

    let sink = ScriptedWebhookSink;
    let retry = noop_request_trigger();
    let completion = noop_batch_trigger();
    for request in store.list_requests_in_state(batch_id, "provider_processed").await.unwrap() {
        delivery::deliver_one(&store, &jobrunner, &bus, &sink, &config, retry.as_ref(), completion.as_ref(), request.id())
            .await
            .unwrap();
    }
    lifecycle::check_delivery_completion(&store, &bus, batch_id).await.unwrap();

    assert_eq!(store.get_batch(batch_id).await.unwrap().state_name(), "delivered");
    for custom_id in ["cid-1", "cid-2", "cid-3"] {
        let request = store.get_request_by_custom_id(batch_id, custom_id).await.unwrap().unwrap();
        assert_eq!(request.state_name(), "delivered");
        assert_eq!(store.delivery_attempt_count(request.id()).await.unwrap(), 1);
    }

    tokio::fs::remove_dir_all(&dir).await.ok();
}

#[tokio::test]
async fn partial_delivery_one_request_exhausts_retries() {
    let (store, bus, jobrunner, provider, config, intake, registry, dir) = build_harness("partial");

    admit(&intake, "cid-1", webhook_delivery("ok")).await.unwrap();
    admit(&intake, "cid-2", webhook_delivery("fail")).await.unwrap();
    admit(&intake, "cid-3", webhook_delivery("ok")).await.unwrap();
    registry.flush(Endpoint::Responses, "gpt-4o-mini").await.unwrap();

    let batch_id = drive_to_ready_for_delivery(
        &store,
        &bus,
        &jobrunner,
        &provider,
        &dir,
        &[
            ("cid-1", Ok(serde_json::json!({"ok": true}))),
            ("cid-2", Ok(serde_json::json!({"ok": true}))),
            ("cid-3", Ok(serde_json::json!({"ok": true}))),
        ],
    )
    .await;

    let sink = ScriptedWebhookSink;
    let retry = noop_request_trigger();
    let completion = noop_batch_trigger();

    let cid1 = store.get_request_by_custom_id(batch_id, "cid-1").await.unwrap().unwrap().id();
    let cid2 = store.get_request_by_custom_id(batch_id, "cid-2").await.unwrap().unwrap().id();
    let cid3 = store.get_request_by_custom_id(batch_id, "cid-3").await.unwrap().unwrap().id();

    delivery::deliver_one(&store, &jobrunner, &bus, &sink, &config, retry.as_ref(), completion.as_ref(), cid1)
        .await
        .unwrap();
    delivery::deliver_one(&store, &jobrunner, &bus, &sink, &config, retry.as_ref(), completion.as_ref(), cid3)
        .await
        .unwrap();

    // `cid-2`'s destination always fails — drive it through all 3 allowed attempts by hand
    // rather than waiting on `JobRunner::enqueue_after`'s real backoff delay.
    for _ in 0..config.effective_delivery_max_attempts() {
        delivery::deliver_one(&store, &jobrunner, &bus, &sink, &config, retry.as_ref(), completion.as_ref(), cid2)
            .await
            .unwrap();
    }

    lifecycle::check_delivery_completion(&store, &bus, batch_id).await.unwrap();

    assert_eq!(store.get_batch(batch_id).await.unwrap().state_name(), "partially_delivered");
    assert_eq!(store.get_request(cid1).await.unwrap().state_name(), "delivered");
    assert_eq!(store.get_request(cid3).await.unwrap().state_name(), "delivered");
    assert_eq!(store.get_request(cid2).await.unwrap().state_name(), "delivery_failed");
    assert_eq!(store.delivery_attempt_count(cid2).await.unwrap(), 3);

    let cid2_attempts = store.list_delivery_attempts(cid2).await.unwrap();
    assert_eq!(cid2_attempts.len(), 3);
    assert!(
        cid2_attempts.iter().all(|a| a.outcome == Outcome::HttpStatusNot2xx),
        "all 3 of cid-2's attempts must record http_status_not_2xx: {cid2_attempts:?}"
    );

    tokio::fs::remove_dir_all(&dir).await.ok();
}

#[tokio::test]
async fn provider_side_error_for_one_request_fails_it_before_delivery() {
    let (store, bus, jobrunner, provider, config, intake, registry, dir) = build_harness("provider-error");

    admit(&intake, "cid-1", webhook_delivery("ok")).await.unwrap();
    admit(&intake, "cid-2", webhook_delivery("ok")).await.unwrap();
    registry.flush(Endpoint::Responses, "gpt-4o-mini").await.unwrap();

    let batch_id = drive_to_ready_for_delivery(
        &store,
        &bus,
        &jobrunner,
        &provider,
        &dir,
        &[
            ("cid-1", Err("rate limited upstream".to_string())),
            ("cid-2", Ok(serde_json::json!({"ok": true}))),
        ],
    )
    .await;

    let cid1 = store.get_request_by_custom_id(batch_id, "cid-1").await.unwrap().unwrap();
    assert_eq!(cid1.state_name(), "failed");
    assert_eq!(cid1.data().error_msg.as_deref(), Some("rate limited upstream"));

    let sink = ScriptedWebhookSink;
    let retry = noop_request_trigger();
    let completion = noop_batch_trigger();
    let cid2 = store.get_request_by_custom_id(batch_id, "cid-2").await.unwrap().unwrap().id();
    delivery::deliver_one(&store, &jobrunner, &bus, &sink, &config, retry.as_ref(), completion.as_ref(), cid2)
        .await
        .unwrap();

    lifecycle::check_delivery_completion(&store, &bus, batch_id).await.unwrap();
    assert_eq!(store.get_batch(batch_id).await.unwrap().state_name(), "partially_delivered");

    tokio::fs::remove_dir_all(&dir).await.ok();
}

#[tokio::test]
async fn expiry_loop_recreates_provider_batch_without_duplicating_requests() {
    let (store, bus, jobrunner, provider, _config, intake, registry, dir) = build_harness("expiry");

    admit(&intake, "cid-1", webhook_delivery("ok")).await.unwrap();
    registry.flush(Endpoint::Responses, "gpt-4o-mini").await.unwrap();

    let batch_id = store.list_batches_in_state("uploading").await.unwrap()[0];
    let noop = noop_batch_trigger();

    provider.queue_upload_file(Ok(UploadedFile { input_file_id: "file-1".into(), bytes: 10 }));
    lifecycle::upload(&store, &*provider, &jobrunner, &bus, &dir, noop.as_ref(), batch_id)
        .await
        .unwrap();

    provider.queue_create_batch(Ok(CreatedBatch {
        provider_batch_id: "provider-batch-1".into(),
        status: "validating".into(),
        expires_at: None,
    }));
    lifecycle::create_provider(&store, &*provider, &jobrunner, &bus, noop.as_ref(), batch_id)
        .await
        .unwrap();

    provider.queue_check_status(Ok(BatchStatus {
        status: "expired".into(),
        output_file_id: None,
        error_file_id: None,
        usage: None,
    }));
    lifecycle::check_status(&store, &*provider, &jobrunner, &bus, noop.as_ref(), noop.as_ref(), batch_id)
        .await
        .unwrap();
    assert_eq!(store.get_batch(batch_id).await.unwrap().state_name(), "expired");

    // §4.2: `expired` loops back to `provider_processing` via `create_provider` against the same
    // input file — simulating the automatic retry the Lifecycle Engine enqueues.
    provider.queue_create_batch(Ok(CreatedBatch {
        provider_batch_id: "provider-batch-2".into(),
        status: "validating".into(),
        expires_at: None,
    }));
    lifecycle::create_provider(&store, &*provider, &jobrunner, &bus, noop.as_ref(), batch_id)
        .await
        .unwrap();

    let batch = store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.state_name(), "provider_processing");
    assert_eq!(batch.data().provider_batch_id.as_deref(), Some("provider-batch-2"));

    let requests = store.list_requests_for_batch(batch_id).await.unwrap();
    assert_eq!(requests.len(), 1, "create_provider must not duplicate Requests on retry");

    tokio::fs::remove_dir_all(&dir).await.ok();
}

#[tokio::test]
async fn duplicate_custom_id_is_rejected_without_a_second_request_row() {
    let (store, _bus, _jobrunner, _provider, _config, intake, _registry, dir) = build_harness("duplicate");

    let first = admit(&intake, "cid-1", webhook_delivery("ok")).await.unwrap();
    let batch_id = store.get_request(first).await.unwrap().data().batch_id;

    let err = admit(&intake, "cid-1", webhook_delivery("ok")).await.unwrap_err();
    assert!(matches!(err, AdmitError::CustomIdAlreadyTaken(_)));

    let requests = store.list_requests_for_batch(batch_id).await.unwrap();
    assert_eq!(requests.len(), 1);

    // The Batch's own creation is its only transition row so far; the rejected admit never
    // touched the Batch's state.
    let transitions = store.get_batch_transitions(batch_id).await.unwrap();
    assert!(transitions.is_empty(), "a fresh building Batch has no transitions yet");

    tokio::fs::remove_dir_all(&dir).await.ok();
}

#[tokio::test]
async fn queue_destination_cache_short_circuits_repeat_lookups() {
    let cache = Arc::new(DestinationCache::new(std::time::Duration::from_secs(300)));
    let sink = ScriptedQueueSink::new(cache.clone());

    let bad_config = DeliveryConfig::Queue(QueueDelivery::Named { queue_name: "nope".into() });
    let first = sink.deliver(&bad_config, &serde_json::json!({})).await.unwrap();
    assert_eq!(first, Outcome::QueueNotFound);
    assert_eq!(sink.round_trip_count(), 1);

    // Cached failure: no further broker round-trip.
    let second = sink.deliver(&bad_config, &serde_json::json!({})).await.unwrap();
    assert_eq!(second, Outcome::QueueNotFound);
    assert_eq!(sink.round_trip_count(), 1);

    // Operator creates the queue and clears the cache; the next publish re-checks the broker
    // and succeeds.
    sink.create_queue("nope");
    cache.clear_destination_cache("", "nope");
    let third = sink.deliver(&bad_config, &serde_json::json!({})).await.unwrap();
    assert_eq!(third, Outcome::Success);
    assert_eq!(sink.round_trip_count(), 2);
}

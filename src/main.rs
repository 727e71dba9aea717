//! Worker process: wires the reference collaborators together and runs the Lifecycle/Delivery
//! Engines against them.
//!
//! There is deliberately no HTTP surface here — `SPEC_FULL.md` §1 names "exposing an HTTP/admin
//! server" a Non-goal; edges embed this crate and drive [`batch_manager::Intake`] directly. This
//! binary demonstrates that embedding and keeps the background engines (upload/poll/download/
//! deliver) running against whichever Store/JobRunner/Bus/ProviderClient/Sinks are configured.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use batch_manager::aggregator::AggregatorRegistry;
use batch_manager::bus::InMemoryBus;
use batch_manager::delivery;
use batch_manager::jobrunner::{InMemoryJobRunner, Job, JobRunner as _};
use batch_manager::lifecycle;
use batch_manager::model::{BatchId, DeliveryConfig, Endpoint, RequestId};
use batch_manager::provider::ReqwestProviderClient;
use batch_manager::sinks::{DestinationCache, QueueSink, SinkRouter, WebhookSink};
use batch_manager::store::in_memory::InMemoryStore;
use batch_manager::{Config, Intake, IntakeRequest};

/// Everything a trigger closure needs to enqueue the next Lifecycle/Delivery step. Cheap to
/// clone (every field is an `Arc` or, for `Config`, plain data), so each trigger constructor
/// below just captures a clone of it.
#[derive(Clone)]
struct Runtime {
    store: Arc<InMemoryStore>,
    jobrunner: Arc<InMemoryJobRunner>,
    bus: Arc<InMemoryBus>,
    provider: Arc<ReqwestProviderClient>,
    sinks: Arc<SinkRouter>,
    config: Config,
    storage_base: Arc<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("batch_manager=info,info")
        .init();

    let config = Config::from_env();

    let destination_cache = Arc::new(DestinationCache::new(config.queue_failure_ttl));
    let mut queue_concurrency = std::collections::HashMap::new();
    queue_concurrency.insert("batch_uploads".to_string(), 1);
    queue_concurrency.insert("batch_processing".to_string(), 1);

    let rt = Runtime {
        store: Arc::new(InMemoryStore::new()),
        jobrunner: Arc::new(InMemoryJobRunner::new(queue_concurrency, 10)),
        bus: Arc::new(InMemoryBus::new()),
        provider: Arc::new(ReqwestProviderClient::new(
            std::env::var("PROVIDER_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            std::env::var("PROVIDER_API_KEY").unwrap_or_default(),
            Duration::from_secs(30),
        )),
        sinks: Arc::new(SinkRouter {
            webhook: WebhookSink::new(Duration::from_secs(30)),
            queue: QueueSink::new(
                std::env::var("QUEUE_BROKER_URI").ok(),
                destination_cache,
                config.queue_publisher_pool_size,
            ),
        }),
        storage_base: Arc::new(config.batch_storage_base.clone()),
        config,
    };

    let registry = Arc::new(AggregatorRegistry::new(
        rt.store.clone(),
        rt.jobrunner.clone(),
        rt.bus.clone(),
        rt.config.clone(),
        upload_trigger(rt.clone()),
    ));
    let intake = Arc::new(Intake::new(registry));

    // Staleness + expiry sweeps, every minute; `provider_processing` poll, every 30s
    // (`SPEC_FULL.md` §4.4's "(periodic)" triggers).
    {
        let rt = rt.clone();
        rt.jobrunner.schedule_periodic(
            "default",
            Duration::from_secs(60),
            Arc::new(move || -> Job {
                let rt = rt.clone();
                let upload_trigger = upload_trigger(rt.clone());
                Box::pin(async move {
                    lifecycle::expire_stale_building(&*rt.store, &*rt.jobrunner, &*rt.bus, &rt.config, upload_trigger.as_ref()).await
                })
            }),
        );
    }
    {
        let rt = rt.clone();
        rt.jobrunner.schedule_periodic(
            "default",
            Duration::from_secs(60),
            Arc::new(move || -> Job {
                let rt = rt.clone();
                Box::pin(async move { lifecycle::sweep_expired_batches(&*rt.store, &*rt.provider, &*rt.bus).await })
            }),
        );
    }
    {
        let rt = rt.clone();
        rt.jobrunner.schedule_periodic(
            "default",
            Duration::from_secs(30),
            Arc::new(move || -> Job {
                let rt = rt.clone();
                let start_downloading_trigger = start_downloading_trigger(rt.clone());
                let create_provider_trigger = create_provider_trigger(rt.clone());
                Box::pin(async move {
                    lifecycle::poll_provider_processing(
                        &*rt.store,
                        &*rt.provider,
                        &*rt.jobrunner,
                        &*rt.bus,
                        start_downloading_trigger.as_ref(),
                        create_provider_trigger.as_ref(),
                    )
                    .await
                })
            }),
        );
    }

    tracing::info!("batch-manager worker started");

    // Demo admission, gated behind an env var so a bare run with no provider credentials
    // configured doesn't attempt to talk to a real endpoint.
    if std::env::var("BATCH_MANAGER_DEMO_ADMIT").is_ok() {
        let accepted = intake
            .admit(IntakeRequest {
                custom_id: "demo-1".into(),
                endpoint: Endpoint::Responses,
                model: "gpt-4o-mini".into(),
                request_payload: serde_json::json!({"model": "gpt-4o-mini", "input": "hello"}),
                delivery: DeliveryConfig::Webhook { url: "https://example.com/hook".into() },
            })
            .await?;
        tracing::info!(request_id = %accepted.data().id, "admitted demo request");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}

// Each constructor below builds a fresh boxed closure capturing a `Runtime` clone. A trigger's
// body constructs the *next* trigger the same way right before calling into the Lifecycle/
// Delivery Engine function that needs it — there's no cycle at construction time, only at the
// type level (each module only ever sees the trigger as `&(dyn Fn(...) -> Job + Send + Sync)`).

fn upload_trigger(rt: Runtime) -> Arc<dyn Fn(BatchId) -> Job + Send + Sync> {
    Arc::new(move |batch_id: BatchId| -> Job {
        let rt = rt.clone();
        Box::pin(async move {
            let create_provider_trigger = create_provider_trigger(rt.clone());
            lifecycle::upload(&*rt.store, &*rt.provider, &*rt.jobrunner, &*rt.bus, &rt.storage_base, create_provider_trigger.as_ref(), batch_id).await
        })
    })
}

fn create_provider_trigger(rt: Runtime) -> Arc<dyn Fn(BatchId) -> Job + Send + Sync> {
    Arc::new(move |batch_id: BatchId| -> Job {
        let rt = rt.clone();
        Box::pin(async move {
            let check_status_trigger = check_status_trigger(rt.clone());
            lifecycle::create_provider(&*rt.store, &*rt.provider, &*rt.jobrunner, &*rt.bus, check_status_trigger.as_ref(), batch_id).await
        })
    })
}

fn check_status_trigger(rt: Runtime) -> Arc<dyn Fn(BatchId) -> Job + Send + Sync> {
    Arc::new(move |batch_id: BatchId| -> Job {
        let rt = rt.clone();
        Box::pin(async move {
            let start_downloading_trigger = start_downloading_trigger(rt.clone());
            let create_provider_trigger = create_provider_trigger(rt.clone());
            lifecycle::check_status(
                &*rt.store,
                &*rt.provider,
                &*rt.jobrunner,
                &*rt.bus,
                start_downloading_trigger.as_ref(),
                create_provider_trigger.as_ref(),
                batch_id,
            )
            .await
        })
    })
}

fn start_downloading_trigger(rt: Runtime) -> Arc<dyn Fn(BatchId) -> Job + Send + Sync> {
    Arc::new(move |batch_id: BatchId| -> Job {
        let rt = rt.clone();
        Box::pin(async move {
            let process_downloaded_trigger = process_downloaded_trigger(rt.clone());
            lifecycle::start_downloading(&*rt.store, &*rt.jobrunner, &*rt.bus, process_downloaded_trigger.as_ref(), batch_id).await
        })
    })
}

fn process_downloaded_trigger(rt: Runtime) -> Arc<dyn Fn(BatchId) -> Job + Send + Sync> {
    Arc::new(move |batch_id: BatchId| -> Job {
        let rt = rt.clone();
        Box::pin(async move {
            let start_delivering_trigger = start_delivering_trigger(rt.clone());
            lifecycle::process_downloaded_file(&*rt.store, &*rt.provider, &*rt.jobrunner, &*rt.bus, &rt.storage_base, start_delivering_trigger.as_ref(), batch_id).await
        })
    })
}

fn start_delivering_trigger(rt: Runtime) -> Arc<dyn Fn(BatchId) -> Job + Send + Sync> {
    Arc::new(move |batch_id: BatchId| -> Job {
        let rt = rt.clone();
        Box::pin(async move {
            let deliver_trigger = deliver_trigger(rt.clone());
            delivery::dispatch_batch_deliveries(&*rt.store, &*rt.jobrunner, deliver_trigger.as_ref(), batch_id).await
        })
    })
}

fn check_completion_trigger(rt: Runtime) -> Arc<dyn Fn(BatchId) -> Job + Send + Sync> {
    Arc::new(move |batch_id: BatchId| -> Job {
        let rt = rt.clone();
        Box::pin(async move { lifecycle::check_delivery_completion(&*rt.store, &*rt.bus, batch_id).await })
    })
}

/// Delivers (or redelivers, on backoff) one Request. Doubles as the retry trigger
/// `delivery::deliver_one` re-enqueues on transient failure.
fn deliver_trigger(rt: Runtime) -> Arc<dyn Fn(RequestId) -> Job + Send + Sync> {
    Arc::new(move |request_id: RequestId| -> Job {
        let rt = rt.clone();
        Box::pin(async move {
            let retry_trigger = deliver_trigger(rt.clone());
            let completion_trigger = check_completion_trigger(rt.clone());
            delivery::deliver_one(
                &*rt.store,
                &*rt.jobrunner,
                &*rt.bus,
                &*rt.sinks,
                &rt.config,
                retry_trigger.as_ref(),
                completion_trigger.as_ref(),
                request_id,
            )
            .await
        })
    })
}

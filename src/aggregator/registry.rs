//! `AggregatorRegistry` — create-or-get actor-per-`(endpoint, model)` lookup.
//!
//! Grounded in `daemon::mod::Daemon`'s `get_semaphore` (`DashMap`-guarded lazy creation), here
//! generalized to spawn and hand back a live actor task instead of a semaphore permit source.

use std::sync::Arc;

use dashmap::DashMap;

use crate::bus::Bus;
use crate::config::Config;
use crate::error::AdmitError;
use crate::jobrunner::{Job, JobRunner};
use crate::model::{BatchId, Endpoint};
use crate::store::Store;

use super::{AdmitRequest, AggregatorActor, AggregatorHandle};

type Key = (Endpoint, String);

pub struct AggregatorRegistry<St: Store, JR: JobRunner, B: Bus> {
    actors: DashMap<Key, AggregatorHandle>,
    store: Arc<St>,
    jobrunner: Arc<JR>,
    bus: Arc<B>,
    config: Config,
    upload_trigger: Arc<dyn Fn(BatchId) -> Job + Send + Sync>,
}

impl<St: Store + 'static, JR: JobRunner + 'static, B: Bus + 'static> AggregatorRegistry<St, JR, B> {
    pub fn new(
        store: Arc<St>,
        jobrunner: Arc<JR>,
        bus: Arc<B>,
        config: Config,
        upload_trigger: Arc<dyn Fn(BatchId) -> Job + Send + Sync>,
    ) -> Self {
        Self {
            actors: DashMap::new(),
            store,
            jobrunner,
            bus,
            config,
            upload_trigger,
        }
    }

    /// Admits a request into the currently-open Batch for `(endpoint, model)`, spawning an
    /// Aggregator actor on first use or after the previous one closed its Batch.
    pub async fn admit(
        &self,
        endpoint: Endpoint,
        model: &str,
        request: AdmitRequest,
    ) -> std::result::Result<crate::model::AnyRequest, AdmitError> {
        let handle = self.get_or_spawn(endpoint, model).await.map_err(|e| {
            AdmitError::ValidationFailed(e.to_string())
        })?;
        handle.admit(request).await
    }

    pub async fn flush(&self, endpoint: Endpoint, model: &str) -> std::result::Result<(), AdmitError> {
        let key = (endpoint, model.to_string());
        if let Some(handle) = self.actors.get(&key).map(|h| h.clone()) {
            if !handle.is_closed() {
                return handle.flush().await;
            }
        }
        Ok(())
    }

    pub async fn state(&self, endpoint: Endpoint, model: &str) -> Option<super::AggregatorSnapshot> {
        let key = (endpoint, model.to_string());
        let handle = self.actors.get(&key).map(|h| h.clone())?;
        handle.state().await
    }

    async fn get_or_spawn(&self, endpoint: Endpoint, model: &str) -> crate::error::Result<AggregatorHandle> {
        let key = (endpoint, model.to_string());

        if let Some(handle) = self.actors.get(&key).map(|h| h.clone()) {
            if !handle.is_closed() {
                return Ok(handle);
            }
        }

        let (batch_id, count, bytes) = AggregatorActor::<St, JR, B>::bootstrap(&self.store, endpoint, model).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let actor = AggregatorActor {
            store: self.store.clone(),
            jobrunner: self.jobrunner.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            endpoint,
            model: model.to_string(),
            upload_trigger: self.upload_trigger.clone(),
            batch_id,
            count,
            bytes,
        };
        tokio::spawn(actor.run(rx));

        let handle = AggregatorHandle { tx };
        self.actors.insert(key, handle.clone());
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::jobrunner::InMemoryJobRunner;
    use crate::store::in_memory::InMemoryStore;

    fn registry() -> AggregatorRegistry<InMemoryStore, InMemoryJobRunner, InMemoryBus> {
        AggregatorRegistry::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryJobRunner::default()),
            Arc::new(InMemoryBus::new()),
            Config::default(),
            Arc::new(|_batch_id: BatchId| -> Job { Box::pin(async { Ok(()) }) }),
        )
    }

    #[tokio::test]
    async fn admits_and_rejects_duplicate_custom_id() {
        let registry = registry();
        let req = AdmitRequest {
            custom_id: "cid-1".into(),
            request_payload: serde_json::json!({"model": "gpt-4o-mini"}),
            delivery_config: crate::model::DeliveryConfig::Webhook {
                url: "https://example.com/hook".into(),
            },
        };

        registry
            .admit(Endpoint::Responses, "gpt-4o-mini", req.clone())
            .await
            .unwrap();

        let err = registry
            .admit(Endpoint::Responses, "gpt-4o-mini", req)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmitError::CustomIdAlreadyTaken(_)));
    }

    #[tokio::test]
    async fn closing_batch_spawns_fresh_aggregator_on_next_admit() {
        let mut config = Config::default();
        config.max_requests_per_batch = 1;

        let registry = AggregatorRegistry::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryJobRunner::default()),
            Arc::new(InMemoryBus::new()),
            config,
            Arc::new(|_batch_id: BatchId| -> Job { Box::pin(async { Ok(()) }) }),
        );

        let first = registry
            .admit(
                Endpoint::Responses,
                "gpt-4o-mini",
                AdmitRequest {
                    custom_id: "cid-1".into(),
                    request_payload: serde_json::json!({}),
                    delivery_config: crate::model::DeliveryConfig::Webhook {
                        url: "https://example.com/hook".into(),
                    },
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let second = registry
            .admit(
                Endpoint::Responses,
                "gpt-4o-mini",
                AdmitRequest {
                    custom_id: "cid-2".into(),
                    request_payload: serde_json::json!({}),
                    delivery_config: crate::model::DeliveryConfig::Webhook {
                        url: "https://example.com/hook".into(),
                    },
                },
            )
            .await
            .unwrap();

        assert_ne!(first.data().batch_id, second.data().batch_id);
    }

    /// `SPEC_FULL.md` §4.1 Concurrency: the Aggregator subscribes to its Batch's Bus topic and
    /// self-terminates if the Batch advances out-of-band (e.g. the staleness sweep force-closing
    /// it directly through the Store, bypassing this actor's mailbox entirely).
    #[tokio::test]
    async fn batch_advancing_out_of_band_terminates_the_actor() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let registry = AggregatorRegistry::new(
            store.clone(),
            Arc::new(InMemoryJobRunner::default()),
            bus.clone(),
            Config::default(),
            Arc::new(|_batch_id: BatchId| -> Job { Box::pin(async { Ok(()) }) }),
        );

        let admitted = registry
            .admit(
                Endpoint::Responses,
                "gpt-4o-mini",
                AdmitRequest {
                    custom_id: "cid-1".into(),
                    request_payload: serde_json::json!({}),
                    delivery_config: crate::model::DeliveryConfig::Webhook {
                        url: "https://example.com/hook".into(),
                    },
                },
            )
            .await
            .unwrap();
        let first_batch_id = admitted.data().batch_id;

        let handle = registry
            .actors
            .get(&(Endpoint::Responses, "gpt-4o-mini".to_string()))
            .map(|h| h.clone())
            .unwrap();
        assert!(!handle.is_closed());

        // Out-of-band: something other than this actor (a sweep, an admin action) moves the
        // Batch off `building` directly through the Store and announces it on the Bus.
        use crate::model::batch::Building;
        let batch = crate::model::Batch::<Building> {
            state: Building {},
            data: store.get_batch(first_batch_id).await.unwrap().data().clone(),
        };
        batch.start_upload(&*store).await.unwrap();
        bus.publish(crate::bus::BusEvent::BatchStateChanged { batch_id: first_batch_id, state: "uploading" })
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(handle.is_closed(), "actor must self-terminate once its Batch leaves building out-of-band");

        let second = registry
            .admit(
                Endpoint::Responses,
                "gpt-4o-mini",
                AdmitRequest {
                    custom_id: "cid-2".into(),
                    request_payload: serde_json::json!({}),
                    delivery_config: crate::model::DeliveryConfig::Webhook {
                        url: "https://example.com/hook".into(),
                    },
                },
            )
            .await
            .unwrap();
        assert_ne!(first_batch_id, second.data().batch_id);
    }
}

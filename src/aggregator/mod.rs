//! Per-`(endpoint, model)` admission actor (`SPEC_FULL.md` §4.1).
//!
//! Grounded in Design Notes §9's actor-per-key guidance, implemented the way the teacher's
//! `daemon::mod` implements its per-model semaphore registry (lazy, key-guarded creation) —
//! generalized here from a semaphore to an owned mailbox task, since admission needs to
//! serialize more than a permit count (duplicate-`custom_id` checks, capacity accounting).

pub mod registry;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::bus::{Bus, BusEvent};
use crate::config::Config;
use crate::error::{AdmitError, Result};
use crate::jobrunner::{Job, JobRunner};
use crate::model::batch::Building;
use crate::model::request::Pending;
use crate::model::{AnyRequest, BatchId, DeliveryConfig, Endpoint, Request, RequestData};
use crate::store::Store;

pub use registry::AggregatorRegistry;

/// A validated request ready for admission; the caller (Intake Facade) has already schema- and
/// delivery-config-validated it.
#[derive(Debug, Clone)]
pub struct AdmitRequest {
    pub custom_id: String,
    pub request_payload: Value,
    pub delivery_config: DeliveryConfig,
}

/// Read-only introspection of an Aggregator's current draft Batch.
#[derive(Debug, Clone)]
pub struct AggregatorSnapshot {
    pub batch_id: BatchId,
    pub request_count: usize,
    pub total_bytes: u64,
}

enum AggregatorMessage {
    Admit {
        request: AdmitRequest,
        reply: oneshot::Sender<std::result::Result<AnyRequest, AdmitError>>,
    },
    Flush {
        reply: oneshot::Sender<std::result::Result<(), AdmitError>>,
    },
    State {
        reply: oneshot::Sender<AggregatorSnapshot>,
    },
}

/// A live handle to a running Aggregator actor. Cloning shares the same mailbox.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<AggregatorMessage>,
}

impl AggregatorHandle {
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn admit(&self, request: AdmitRequest) -> std::result::Result<AnyRequest, AdmitError> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(AggregatorMessage::Admit { request, reply })
            .await
            .is_err()
        {
            return Err(AdmitError::BatchNotBuilding);
        }
        rx.await.unwrap_or(Err(AdmitError::BatchNotBuilding))
    }

    pub async fn flush(&self) -> std::result::Result<(), AdmitError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(AggregatorMessage::Flush { reply }).await.is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    pub async fn state(&self) -> Option<AggregatorSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(AggregatorMessage::State { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Owns the current draft Batch for one `(endpoint, model)` key and serializes admission into
/// it. Terminates itself (dropping its mailbox) once the Batch closes, so the registry spawns a
/// fresh actor + Batch on the next admit for this key — "restart: temporary" per Design Notes §9.
struct AggregatorActor<St: Store, JR: JobRunner, B: Bus> {
    store: Arc<St>,
    jobrunner: Arc<JR>,
    bus: Arc<B>,
    config: Config,
    endpoint: Endpoint,
    model: String,
    upload_trigger: Arc<dyn Fn(BatchId) -> Job + Send + Sync>,
    batch_id: BatchId,
    count: usize,
    bytes: u64,
}

impl<St: Store + 'static, JR: JobRunner + 'static, B: Bus + 'static> AggregatorActor<St, JR, B> {
    async fn bootstrap(
        store: &St,
        endpoint: Endpoint,
        model: &str,
    ) -> Result<(BatchId, usize, u64)> {
        let batch = match store.get_building_batch(endpoint, model).await? {
            Some(batch) => batch,
            None => store.create_building_batch(endpoint, model).await?,
        };
        let (count, bytes) = store.batch_request_stats(batch.data.id).await?;
        Ok((batch.data.id, count, bytes))
    }

    /// Runs until the Batch closes (capacity reached or explicit flush), until the Batch advances
    /// or is deleted out-of-band (`SPEC_FULL.md` §4.1 Concurrency: subscribed via
    /// `Bus::subscribe_batch` so a sweep force-closing this same Batch behind its back doesn't
    /// leave the actor admitting into a row that's already left `building`), or an unrecoverable
    /// Store error occurs.
    async fn run(mut self, mut rx: mpsc::Receiver<AggregatorMessage>) {
        use futures::StreamExt;
        let mut batch_events = self.bus.subscribe_batch(self.batch_id);

        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    match message {
                        AggregatorMessage::Admit { request, reply } => {
                            let outcome = self.handle_admit(request).await;
                            let should_close = matches!(&outcome, Ok(_)) && self.should_close();
                            let _ = reply.send(outcome);
                            if should_close {
                                let _ = self.close().await;
                                break;
                            }
                        }
                        AggregatorMessage::Flush { reply } => {
                            let result = self.close().await;
                            let _ = reply.send(result);
                            break;
                        }
                        AggregatorMessage::State { reply } => {
                            let _ = reply.send(AggregatorSnapshot {
                                batch_id: self.batch_id,
                                request_count: self.count,
                                total_bytes: self.bytes,
                            });
                        }
                    }
                }
                event = batch_events.next() => {
                    match event {
                        Some(BusEvent::BatchDestroyed { .. }) => {
                            tracing::debug!(batch_id = %self.batch_id, "aggregator: batch destroyed out-of-band, terminating");
                            break;
                        }
                        Some(BusEvent::BatchStateChanged { state, .. }) if state != "building" => {
                            tracing::debug!(batch_id = %self.batch_id, state, "aggregator: batch left building out-of-band, terminating");
                            break;
                        }
                        Some(_) => continue,
                        None => break,
                    }
                }
            }
        }
    }

    fn should_close(&self) -> bool {
        self.count >= self.config.max_requests_per_batch
            || self.bytes >= self.config.max_batch_size_bytes
    }

    async fn handle_admit(
        &mut self,
        request: AdmitRequest,
    ) -> std::result::Result<AnyRequest, AdmitError> {
        if self
            .store
            .get_request_by_custom_id(self.batch_id, &request.custom_id)
            .await
            .map_err(|e| AdmitError::ValidationFailed(e.to_string()))?
            .is_some()
        {
            return Err(AdmitError::CustomIdAlreadyTaken(request.custom_id));
        }

        let size = RequestData::compute_payload_size(&request.request_payload)
            .map_err(|e| AdmitError::ValidationFailed(e.to_string()))?;

        if self.count + 1 > self.config.max_requests_per_batch
            || self.bytes + size > self.config.max_batch_size_bytes
        {
            return Err(AdmitError::BatchFull);
        }

        let now = chrono::Utc::now();
        let data = RequestData {
            id: crate::model::RequestId(0),
            batch_id: self.batch_id,
            custom_id: request.custom_id,
            endpoint: self.endpoint,
            model: self.model.clone(),
            request_payload: request.request_payload,
            request_payload_size: size,
            delivery_config: request.delivery_config,
            response_payload: None,
            error_msg: None,
            created_at: now,
            updated_at: now,
        };
        let custom_id = data.custom_id.clone();
        let pending: Request<Pending> = Request {
            state: Pending {},
            data,
        };

        self.store
            .insert_request(pending)
            .await
            .map_err(|e| AdmitError::ValidationFailed(e.to_string()))?;

        self.count += 1;
        self.bytes += size;

        // `insert_request` assigns the real id; re-fetch rather than guess it here.
        let stored = self
            .store
            .get_request_by_custom_id(self.batch_id, &custom_id)
            .await
            .map_err(|e| AdmitError::ValidationFailed(e.to_string()))?
            .ok_or_else(|| AdmitError::ValidationFailed("request vanished after insert".into()))?;

        let _ = self
            .bus
            .publish(BusEvent::RequestStateChanged {
                request_id: stored.id(),
                state: "pending",
            })
            .await;

        Ok(stored)
    }

    async fn close(&mut self) -> std::result::Result<(), AdmitError> {
        let batch: crate::model::Batch<Building> = crate::model::Batch {
            state: Building {},
            data: self
                .store
                .get_batch(self.batch_id)
                .await
                .map_err(|e| AdmitError::ValidationFailed(e.to_string()))?
                .data()
                .clone(),
        };

        let uploading = batch
            .start_upload(&*self.store)
            .await
            .map_err(|e| AdmitError::ValidationFailed(e.to_string()))?;

        let _ = self
            .bus
            .publish(BusEvent::BatchStateChanged {
                batch_id: self.batch_id,
                state: "uploading",
            })
            .await;

        let batch_id = self.batch_id;
        let job = (self.upload_trigger)(batch_id);
        let _ = self.jobrunner.enqueue("batch_uploads", job).await;
        let _ = uploading;

        Ok(())
    }
}

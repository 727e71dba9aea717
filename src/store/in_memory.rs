//! In-memory Store implementation, for tests and single-process deployments.
//!
//! Mirrors the teacher's `storage::in_memory::InMemoryStorage`: a `parking_lot::RwLock`-guarded
//! `HashMap`, with the guard-on-current-state check done in plain Rust instead of SQL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;

use crate::error::Error;
use crate::model::batch::{Building, TokenUsage};
use crate::model::request::Pending;
use crate::model::{AnyBatch, AnyRequest, Batch, BatchData, BatchId, BatchState, Endpoint, Request, RequestId, RequestState};

use super::{DeliveryAttempt, DeliveryCounts, Store, TransitionRecord};

struct StoredBatch {
    batch: AnyBatch,
    transitions: Vec<TransitionRecord>,
}

struct StoredRequest {
    request: AnyRequest,
    transitions: Vec<TransitionRecord>,
}

/// In-memory implementation of `Store`.
#[derive(Clone)]
pub struct InMemoryStore {
    batches: Arc<RwLock<HashMap<BatchId, StoredBatch>>>,
    requests: Arc<RwLock<HashMap<RequestId, StoredRequest>>>,
    delivery_attempts: Arc<RwLock<HashMap<RequestId, Vec<DeliveryAttempt>>>>,
    next_batch_id: Arc<AtomicI64>,
    next_request_id: Arc<AtomicI64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            batches: Arc::new(RwLock::new(HashMap::new())),
            requests: Arc::new(RwLock::new(HashMap::new())),
            delivery_attempts: Arc::new(RwLock::new(HashMap::new())),
            next_batch_id: Arc::new(AtomicI64::new(1)),
            next_request_id: Arc::new(AtomicI64::new(1)),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for InMemoryStore {
    async fn get_building_batch(&self, endpoint: Endpoint, model: &str) -> crate::error::Result<Option<Batch<Building>>> {
        let batches = self.batches.read();
        Ok(batches.values().find_map(|stored| match &stored.batch {
            AnyBatch::Building(b) if b.data.endpoint == endpoint && b.data.model == model => Some(b.clone()),
            _ => None,
        }))
    }

    async fn create_building_batch(&self, endpoint: Endpoint, model: &str) -> crate::error::Result<Batch<Building>> {
        let id = BatchId(self.next_batch_id.fetch_add(1, Ordering::Relaxed));
        let now = Utc::now();
        let batch = Batch {
            state: Building {},
            data: BatchData {
                id,
                endpoint,
                model: model.to_string(),
                provider_input_file_id: None,
                provider_output_file_id: None,
                provider_error_file_id: None,
                provider_batch_id: None,
                provider_status_last_checked_at: None,
                expires_at: None,
                usage: TokenUsage::default(),
                error_msg: None,
                created_at: now,
                updated_at: now,
            },
        };

        self.batches.write().insert(
            id,
            StoredBatch {
                batch: AnyBatch::from(batch.clone()),
                transitions: Vec::new(),
            },
        );

        Ok(batch)
    }

    async fn batch_request_stats(&self, batch_id: BatchId) -> crate::error::Result<(usize, u64)> {
        let requests = self.requests.read();
        let (count, bytes) = requests
            .values()
            .filter(|stored| stored.request.data().batch_id == batch_id)
            .fold((0usize, 0u64), |(count, bytes), stored| {
                (count + 1, bytes + stored.request.data().request_payload_size)
            });
        Ok((count, bytes))
    }

    async fn insert_request(&self, request: Request<Pending>) -> crate::error::Result<()> {
        let mut requests = self.requests.write();

        let duplicate = requests.values().any(|stored| {
            stored.request.data().batch_id == request.data.batch_id
                && stored.request.data().custom_id == request.data.custom_id
        });
        if duplicate {
            return Err(Error::Other(anyhow::anyhow!(
                "custom_id '{}' already exists in batch {}",
                request.data.custom_id,
                request.data.batch_id
            )));
        }

        let id = RequestId(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let mut request = request;
        request.data.id = id;

        requests.insert(
            id,
            StoredRequest {
                request: AnyRequest::from(request),
                transitions: Vec::new(),
            },
        );
        Ok(())
    }

    async fn persist_batch<S: BatchState + Clone>(&self, from: &'static str, batch: &Batch<S>) -> crate::error::Result<()>
    where
        AnyBatch: From<Batch<S>>,
    {
        let mut batches = self.batches.write();
        let stored = batches
            .get_mut(&batch.data.id)
            .ok_or(Error::BatchNotFound(batch.data.id))?;

        let current = stored.batch.state_name();
        if current != from {
            return Err(Error::WrongState {
                entity: format!("batch {}", batch.data.id),
                expected: from.to_string(),
                found: current.to_string(),
            });
        }

        let to = batch.state.name();
        stored.batch = AnyBatch::from(batch.clone());
        stored.transitions.push(TransitionRecord {
            from_state: from.to_string(),
            to_state: to.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn persist_request<S: RequestState + Clone>(&self, from: &'static str, request: &Request<S>) -> crate::error::Result<()>
    where
        AnyRequest: From<Request<S>>,
    {
        let mut requests = self.requests.write();
        let stored = requests
            .get_mut(&request.data.id)
            .ok_or(Error::RequestNotFound(request.data.id))?;

        let current = stored.request.state_name();
        if current != from {
            return Err(Error::WrongState {
                entity: format!("request {}", request.data.id),
                expected: from.to_string(),
                found: current.to_string(),
            });
        }

        let to = request.state.name();
        stored.request = AnyRequest::from(request.clone());
        stored.transitions.push(TransitionRecord {
            from_state: from.to_string(),
            to_state: to.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn get_batch(&self, id: BatchId) -> crate::error::Result<AnyBatch> {
        self.batches
            .read()
            .get(&id)
            .map(|stored| stored.batch.clone())
            .ok_or(Error::BatchNotFound(id))
    }

    async fn get_request(&self, id: RequestId) -> crate::error::Result<AnyRequest> {
        self.requests
            .read()
            .get(&id)
            .map(|stored| stored.request.clone())
            .ok_or(Error::RequestNotFound(id))
    }

    async fn get_request_by_custom_id(&self, batch_id: BatchId, custom_id: &str) -> crate::error::Result<Option<AnyRequest>> {
        let requests = self.requests.read();
        Ok(requests
            .values()
            .find(|stored| stored.request.data().batch_id == batch_id && stored.request.data().custom_id == custom_id)
            .map(|stored| stored.request.clone()))
    }

    async fn list_requests_for_batch(&self, batch_id: BatchId) -> crate::error::Result<Vec<AnyRequest>> {
        let requests = self.requests.read();
        Ok(requests
            .values()
            .filter(|stored| stored.request.data().batch_id == batch_id)
            .map(|stored| stored.request.clone())
            .collect())
    }

    async fn list_requests_in_state(&self, batch_id: BatchId, state_name: &'static str) -> crate::error::Result<Vec<AnyRequest>> {
        let requests = self.requests.read();
        Ok(requests
            .values()
            .filter(|stored| stored.request.data().batch_id == batch_id && stored.request.state_name() == state_name)
            .map(|stored| stored.request.clone())
            .collect())
    }

    async fn delete_batch(&self, id: BatchId) -> crate::error::Result<()> {
        self.batches.write().remove(&id);
        let mut requests = self.requests.write();
        let dead: Vec<RequestId> = requests
            .values()
            .filter(|stored| stored.request.data().batch_id == id)
            .map(|stored| stored.request.id())
            .collect();
        for request_id in &dead {
            requests.remove(request_id);
        }
        drop(requests);
        let mut attempts = self.delivery_attempts.write();
        for request_id in &dead {
            attempts.remove(request_id);
        }
        Ok(())
    }

    async fn insert_delivery_attempt(&self, attempt: DeliveryAttempt) -> crate::error::Result<()> {
        self.delivery_attempts
            .write()
            .entry(attempt.request_id)
            .or_default()
            .push(attempt);
        Ok(())
    }

    async fn delivery_completion_counts(&self, batch_id: BatchId) -> crate::error::Result<DeliveryCounts> {
        let requests = self.requests.read();
        let mut counts = DeliveryCounts::default();
        for stored in requests.values().filter(|stored| stored.request.data().batch_id == batch_id) {
            counts.total += 1;
            if stored.request.is_delivered() {
                counts.delivered += 1;
            } else if stored.request.is_terminal() {
                counts.terminal_failed += 1;
            }
        }
        Ok(counts)
    }

    async fn delivery_attempt_count(&self, request_id: RequestId) -> crate::error::Result<u32> {
        Ok(self
            .delivery_attempts
            .read()
            .get(&request_id)
            .map(|attempts| attempts.len() as u32)
            .unwrap_or(0))
    }

    async fn list_delivery_attempts(&self, request_id: RequestId) -> crate::error::Result<Vec<DeliveryAttempt>> {
        Ok(self
            .delivery_attempts
            .read()
            .get(&request_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_building_batches_older_than(&self, age: Duration) -> crate::error::Result<Vec<Batch<Building>>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero());
        let batches = self.batches.read();
        Ok(batches
            .values()
            .filter_map(|stored| match &stored.batch {
                AnyBatch::Building(b) if b.data.created_at < cutoff => Some(b.clone()),
                _ => None,
            })
            .collect())
    }

    async fn list_batches_in_state(&self, state_name: &'static str) -> crate::error::Result<Vec<BatchId>> {
        let batches = self.batches.read();
        Ok(batches
            .values()
            .filter(|stored| stored.batch.state_name() == state_name)
            .map(|stored| stored.batch.id())
            .collect())
    }

    async fn get_batch_transitions(&self, id: BatchId) -> crate::error::Result<Vec<TransitionRecord>> {
        self.batches
            .read()
            .get(&id)
            .map(|stored| stored.transitions.clone())
            .ok_or(Error::BatchNotFound(id))
    }

    async fn get_request_transitions(&self, id: RequestId) -> crate::error::Result<Vec<TransitionRecord>> {
        self.requests
            .read()
            .get(&id)
            .map(|stored| stored.transitions.clone())
            .ok_or(Error::RequestNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::request::RequestData;
    use crate::model::{DeliveryConfig, Endpoint};

    fn sample_payload() -> serde_json::Value {
        serde_json::json!({"model": "gpt-4o-mini"})
    }

    fn pending_request(batch_id: BatchId, custom_id: &str) -> Request<Pending> {
        let now = Utc::now();
        Request {
            state: Pending {},
            data: RequestData {
                id: RequestId(0),
                batch_id,
                custom_id: custom_id.to_string(),
                endpoint: Endpoint::Responses,
                model: "gpt-4o-mini".to_string(),
                request_payload: sample_payload(),
                request_payload_size: RequestData::compute_payload_size(&sample_payload()).unwrap(),
                delivery_config: DeliveryConfig::Webhook {
                    url: "https://example.com/hook".into(),
                },
                response_payload: None,
                error_msg: None,
                created_at: now,
                updated_at: now,
            },
        }
    }

    #[tokio::test]
    async fn insert_request_rejects_duplicate_custom_id() {
        let store = InMemoryStore::new();
        let batch = store.create_building_batch(Endpoint::Responses, "gpt-4o-mini").await.unwrap();
        store.insert_request(pending_request(batch.data.id, "cid-1")).await.unwrap();

        let second = Request {
            state: Pending {},
            data: RequestData {
                id: RequestId(0),
                batch_id: batch.data.id,
                custom_id: "cid-1".to_string(),
                endpoint: Endpoint::Responses,
                model: "gpt-4o-mini".to_string(),
                request_payload: sample_payload(),
                request_payload_size: 10,
                delivery_config: DeliveryConfig::Webhook {
                    url: "https://example.com/hook".into(),
                },
                response_payload: None,
                error_msg: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        };
        assert!(store.insert_request(second).await.is_err());
    }

    #[tokio::test]
    async fn persist_batch_rejects_stale_guard() {
        let store = InMemoryStore::new();
        let batch = store.create_building_batch(Endpoint::Responses, "gpt-4o-mini").await.unwrap();

        let uploading = Batch {
            state: crate::model::batch::Uploading {},
            data: batch.data.clone(),
        };
        store.persist_batch("building", &uploading).await.unwrap();

        let err = store.persist_batch("building", &uploading).await.unwrap_err();
        assert!(matches!(err, Error::WrongState { .. }));
    }

    #[tokio::test]
    async fn delivery_completion_counts_tally_delivered_and_failed() {
        let store = InMemoryStore::new();
        let batch = store.create_building_batch(Endpoint::Responses, "gpt-4o-mini").await.unwrap();
        store.insert_request(pending_request(batch.data.id, "cid-1")).await.unwrap();

        let counts = store.delivery_completion_counts(batch.data.id).await.unwrap();
        assert_eq!(counts.total, 1);
        assert_eq!(counts.delivered, 0);
    }
}

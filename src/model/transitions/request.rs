//! Guarded Request transitions (`SPEC_FULL.md` §4.3).
//!
//! Same shape as `batch.rs`: each function consumes a `Request<From>` and calls
//! `Store::persist_request` with the expected prior-state tag.

use chrono::Utc;

use crate::error::Result;
use crate::model::request::*;
use crate::store::Store;

impl Request<Pending> {
    pub async fn start_provider_processing<St: Store>(self, store: &St) -> Result<Request<ProviderProcessing>> {
        let next = Request { state: ProviderProcessing {}, data: self.data };
        store.persist_request("pending", &next).await?;
        Ok(next)
    }

    /// Valid from a processing state per §4.3 ("`mark_expired` valid from processing states");
    /// a Request still `pending` when its parent Batch is force-expired counts as one.
    pub async fn mark_expired<St: Store>(self, store: &St) -> Result<Request<Expired>> {
        let next = Request {
            state: Expired { at: Utc::now() },
            data: self.data,
        };
        store.persist_request("pending", &next).await?;
        Ok(next)
    }

    pub async fn cancel<St: Store>(self, store: &St) -> Result<Request<Cancelled>> {
        let next = Request {
            state: Cancelled { at: Utc::now() },
            data: self.data,
        };
        store.persist_request("pending", &next).await?;
        Ok(next)
    }
}

impl Request<ProviderProcessing> {
    /// Result Processor recorded a successful response for this `custom_id`.
    pub async fn complete_processing<St: Store>(self, store: &St) -> Result<Request<ProviderProcessed>> {
        let next = Request { state: ProviderProcessed {}, data: self.data };
        store.persist_request("provider_processing", &next).await?;
        Ok(next)
    }

    /// The provider-error-file listed this `custom_id`.
    pub async fn fail<St: Store>(self, store: &St, error_msg: impl Into<String>) -> Result<Request<Failed>> {
        let mut data = self.data;
        data.error_msg = Some(error_msg.into());
        let next = Request {
            state: Failed { at: Utc::now() },
            data,
        };
        store.persist_request("provider_processing", &next).await?;
        Ok(next)
    }

    pub async fn mark_expired<St: Store>(self, store: &St) -> Result<Request<Expired>> {
        let next = Request {
            state: Expired { at: Utc::now() },
            data: self.data,
        };
        store.persist_request("provider_processing", &next).await?;
        Ok(next)
    }

    pub async fn cancel<St: Store>(self, store: &St) -> Result<Request<Cancelled>> {
        let next = Request {
            state: Cancelled { at: Utc::now() },
            data: self.data,
        };
        store.persist_request("provider_processing", &next).await?;
        Ok(next)
    }
}

impl Request<ProviderProcessed> {
    pub async fn start_delivering<St: Store>(self, store: &St) -> Result<Request<Delivering>> {
        let next = Request { state: Delivering {}, data: self.data };
        store.persist_request("provider_processed", &next).await?;
        Ok(next)
    }

    pub async fn cancel<St: Store>(self, store: &St) -> Result<Request<Cancelled>> {
        let next = Request {
            state: Cancelled { at: Utc::now() },
            data: self.data,
        };
        store.persist_request("provider_processed", &next).await?;
        Ok(next)
    }
}

impl Request<Delivering> {
    pub async fn mark_delivered<St: Store>(self, store: &St) -> Result<Request<Delivered>> {
        let next = Request {
            state: Delivered { at: Utc::now() },
            data: self.data,
        };
        store.persist_request("delivering", &next).await?;
        Ok(next)
    }

    pub async fn mark_delivery_failed<St: Store>(self, store: &St, error_msg: impl Into<String>) -> Result<Request<DeliveryFailed>> {
        let mut data = self.data;
        data.error_msg = Some(error_msg.into());
        let next = Request {
            state: DeliveryFailed { at: Utc::now() },
            data,
        };
        store.persist_request("delivering", &next).await?;
        Ok(next)
    }

    /// `retry_transient`: a re-dispatch after a transient delivery failure, not a terminal
    /// failure followed by redelivery (`SPEC_FULL.md` §4.6 step 6 — "let the JobRunner retry
    /// with backoff" — and §4.3, which reserves `delivery_failed` for exhausted retries). A
    /// direct `delivering -> provider_processed` edge so the audit trail reads as one retry, not
    /// a `delivery_failed` row plus a `retry_delivery` row.
    pub async fn retry_transient<St: Store>(self, store: &St) -> Result<Request<ProviderProcessed>> {
        let next = Request { state: ProviderProcessed {}, data: self.data };
        store.persist_request("delivering", &next).await?;
        Ok(next)
    }

    pub async fn cancel<St: Store>(self, store: &St) -> Result<Request<Cancelled>> {
        let next = Request {
            state: Cancelled { at: Utc::now() },
            data: self.data,
        };
        store.persist_request("delivering", &next).await?;
        Ok(next)
    }
}

impl Request<DeliveryFailed> {
    /// `retry_delivery`: resets to `provider_processed`, clearing `error_msg`, so the
    /// Delivery Engine redispatches it (`SPEC_FULL.md` §4.3, §4.7 "Redelivery").
    pub async fn retry_delivery<St: Store>(self, store: &St) -> Result<Request<ProviderProcessed>> {
        let mut data = self.data;
        data.error_msg = None;
        let next = Request { state: ProviderProcessed {}, data };
        store.persist_request("delivery_failed", &next).await?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::request::RequestData;
    use crate::model::{BatchId, DeliveryConfig, Endpoint, RequestId};
    use crate::store::in_memory::InMemoryStore;
    use crate::store::Store as _;

    fn pending_request(batch_id: BatchId) -> Request<Pending> {
        let payload = serde_json::json!({"model": "gpt-4o-mini"});
        let now = Utc::now();
        Request {
            state: Pending {},
            data: RequestData {
                id: RequestId(0),
                batch_id,
                custom_id: "cid-1".into(),
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
        }
    }

    #[tokio::test]
    async fn happy_path_to_delivered() {
        let store = InMemoryStore::new();
        let batch = store.create_building_batch(Endpoint::Responses, "gpt-4o-mini").await.unwrap();
        store.insert_request(pending_request(batch.data.id)).await.unwrap();
        let any = store.get_request_by_custom_id(batch.data.id, "cid-1").await.unwrap().unwrap();
        let pending = any.as_pending().unwrap().clone();

        let processing = pending.start_provider_processing(&store).await.unwrap();
        let processed = processing.complete_processing(&store).await.unwrap();
        let delivering = processed.start_delivering(&store).await.unwrap();
        let delivered = delivering.mark_delivered(&store).await.unwrap();

        let fetched = store.get_request(delivered.data.id).await.unwrap();
        assert!(fetched.is_delivered());
    }

    #[tokio::test]
    async fn retry_delivery_clears_error_and_reopens_for_delivery() {
        let store = InMemoryStore::new();
        let batch = store.create_building_batch(Endpoint::Responses, "gpt-4o-mini").await.unwrap();
        store.insert_request(pending_request(batch.data.id)).await.unwrap();
        let any = store.get_request_by_custom_id(batch.data.id, "cid-1").await.unwrap().unwrap();
        let pending = any.as_pending().unwrap().clone();

        let processing = pending.start_provider_processing(&store).await.unwrap();
        let processed = processing.complete_processing(&store).await.unwrap();
        let delivering = processed.start_delivering(&store).await.unwrap();
        let failed = delivering.mark_delivery_failed(&store, "connection_error").await.unwrap();

        let retried = failed.retry_delivery(&store).await.unwrap();
        assert!(retried.data.error_msg.is_none());
    }
}

//! Guarded Batch transitions (`SPEC_FULL.md` §4.2).
//!
//! Each function takes a `Batch<From>` — already carrying whatever field updates the calling
//! Lifecycle Engine action made (e.g. `provider_batch_id` before `create_provider`) — and
//! performs the state change: build the `Batch<To>`, call `Store::persist_batch` with the
//! expected prior-state tag, and return it. `persist_batch` does the guarded
//! `UPDATE ... WHERE state = $expected` + transition-row insert atomically, so a concurrent
//! transition of the same Batch surfaces as `Error::WrongState` here rather than silently
//! clobbering it.
//!
//! Grounded in the teacher's `request::transitions` (`impl Request<Pending> { pub async fn
//! claim(self, storage) -> Result<Request<Claimed>> }`), generalized from one state machine to
//! the Batch machine's 14 states and >20 edges.

use chrono::Utc;

use crate::error::Result;
use crate::model::batch::*;
use crate::store::Store;

impl Batch<Building> {
    pub async fn start_upload<St: Store>(self, store: &St) -> Result<Batch<Uploading>> {
        let next = Batch { state: Uploading {}, data: self.data };
        store.persist_batch("building", &next).await?;
        Ok(next)
    }
}

impl Batch<Uploading> {
    pub async fn upload<St: Store>(self, store: &St) -> Result<Batch<Uploaded>> {
        let next = Batch { state: Uploaded {}, data: self.data };
        store.persist_batch("uploading", &next).await?;
        Ok(next)
    }
}

impl Batch<Uploaded> {
    pub async fn create_provider<St: Store>(self, store: &St) -> Result<Batch<ProviderProcessing>> {
        let next = Batch { state: ProviderProcessing {}, data: self.data };
        store.persist_batch("uploaded", &next).await?;
        Ok(next)
    }
}

impl Batch<Expired> {
    pub async fn create_provider<St: Store>(self, store: &St) -> Result<Batch<ProviderProcessing>> {
        let next = Batch { state: ProviderProcessing {}, data: self.data };
        store.persist_batch("expired", &next).await?;
        Ok(next)
    }
}

impl Batch<ProviderProcessing> {
    pub async fn mark_expired<St: Store>(self, store: &St) -> Result<Batch<Expired>> {
        let next = Batch { state: Expired {}, data: self.data };
        store.persist_batch("provider_processing", &next).await?;
        Ok(next)
    }

    pub async fn finish_processing<St: Store>(self, store: &St) -> Result<Batch<ProviderCompleted>> {
        let next = Batch { state: ProviderCompleted {}, data: self.data };
        store.persist_batch("provider_processing", &next).await?;
        Ok(next)
    }
}

impl Batch<ProviderCompleted> {
    pub async fn start_downloading<St: Store>(self, store: &St) -> Result<Batch<Downloading>> {
        let next = Batch { state: Downloading {}, data: self.data };
        store.persist_batch("provider_completed", &next).await?;
        Ok(next)
    }
}

impl Batch<Downloading> {
    pub async fn finalize<St: Store>(self, store: &St) -> Result<Batch<ReadyToDeliver>> {
        let next = Batch { state: ReadyToDeliver {}, data: self.data };
        store.persist_batch("downloading", &next).await?;
        Ok(next)
    }
}

impl Batch<ReadyToDeliver> {
    pub async fn start_delivering<St: Store>(self, store: &St) -> Result<Batch<Delivering>> {
        let next = Batch { state: Delivering {}, data: self.data };
        store.persist_batch("ready_to_deliver", &next).await?;
        Ok(next)
    }
}

impl Batch<Delivering> {
    pub async fn mark_delivered<St: Store>(self, store: &St) -> Result<Batch<Delivered>> {
        let next = Batch {
            state: Delivered { at: Utc::now() },
            data: self.data,
        };
        store.persist_batch("delivering", &next).await?;
        Ok(next)
    }

    pub async fn mark_partial<St: Store>(self, store: &St) -> Result<Batch<PartiallyDelivered>> {
        let next = Batch {
            state: PartiallyDelivered { at: Utc::now() },
            data: self.data,
        };
        store.persist_batch("delivering", &next).await?;
        Ok(next)
    }

    pub async fn mark_delivery_failed<St: Store>(self, store: &St) -> Result<Batch<DeliveryFailed>> {
        let next = Batch {
            state: DeliveryFailed { at: Utc::now() },
            data: self.data,
        };
        store.persist_batch("delivering", &next).await?;
        Ok(next)
    }
}

impl Batch<PartiallyDelivered> {
    pub async fn begin_redeliver<St: Store>(self, store: &St) -> Result<Batch<Delivering>> {
        let next = Batch { state: Delivering {}, data: self.data };
        store.persist_batch("partially_delivered", &next).await?;
        Ok(next)
    }
}

impl Batch<DeliveryFailed> {
    pub async fn begin_redeliver<St: Store>(self, store: &St) -> Result<Batch<Delivering>> {
        let next = Batch { state: Delivering {}, data: self.data };
        store.persist_batch("delivery_failed", &next).await?;
        Ok(next)
    }
}

macro_rules! batch_fail_and_cancel {
    ($from:ident, $tag:literal) => {
        impl Batch<$from> {
            /// `fail`: valid from any non-terminal state except `delivered`/`cancelled`
            /// (`SPEC_FULL.md` §4.2).
            pub async fn fail<St: Store>(self, store: &St, error_msg: impl Into<String>) -> Result<Batch<Failed>> {
                let mut data = self.data;
                data.error_msg = Some(error_msg.into());
                let next = Batch {
                    state: Failed { at: Utc::now() },
                    data,
                };
                store.persist_batch($tag, &next).await?;
                Ok(next)
            }

            /// `cancel`: valid from any non-terminal state.
            pub async fn cancel<St: Store>(self, store: &St) -> Result<Batch<Cancelled>> {
                let next = Batch {
                    state: Cancelled { at: Utc::now() },
                    data: self.data,
                };
                store.persist_batch($tag, &next).await?;
                Ok(next)
            }
        }
    };
}

batch_fail_and_cancel!(Building, "building");
batch_fail_and_cancel!(Uploading, "uploading");
batch_fail_and_cancel!(Uploaded, "uploaded");
batch_fail_and_cancel!(ProviderProcessing, "provider_processing");
batch_fail_and_cancel!(Expired, "expired");
batch_fail_and_cancel!(ProviderCompleted, "provider_completed");
batch_fail_and_cancel!(Downloading, "downloading");
batch_fail_and_cancel!(ReadyToDeliver, "ready_to_deliver");
batch_fail_and_cancel!(Delivering, "delivering");
batch_fail_and_cancel!(PartiallyDelivered, "partially_delivered");
batch_fail_and_cancel!(DeliveryFailed, "delivery_failed");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Endpoint;
    use crate::store::in_memory::InMemoryStore;
    use crate::store::Store as _;

    #[tokio::test]
    async fn happy_path_through_upload_and_provider_processing() {
        let store = InMemoryStore::new();
        let building = store.create_building_batch(Endpoint::Responses, "gpt-4o-mini").await.unwrap();

        let uploading = building.start_upload(&store).await.unwrap();
        let uploaded = uploading.upload(&store).await.unwrap();
        let processing = uploaded.create_provider(&store).await.unwrap();

        let fetched = store.get_batch(processing.data.id).await.unwrap();
        assert_eq!(fetched.state_name(), "provider_processing");
    }

    #[tokio::test]
    async fn fail_records_error_msg_and_terminal_state() {
        let store = InMemoryStore::new();
        let building = store.create_building_batch(Endpoint::Responses, "gpt-4o-mini").await.unwrap();

        let failed = building.fail(&store, "boom").await.unwrap();
        assert_eq!(failed.data.error_msg.as_deref(), Some("boom"));

        let fetched = store.get_batch(failed.data.id).await.unwrap();
        assert!(fetched.is_terminal());
    }

    #[tokio::test]
    async fn stale_guard_is_rejected() {
        let store = InMemoryStore::new();
        let building = store.create_building_batch(Endpoint::Responses, "gpt-4o-mini").await.unwrap();
        let stale = building.clone();

        let _uploading = building.start_upload(&store).await.unwrap();

        let err = stale.start_upload(&store).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::WrongState { .. }));
    }
}

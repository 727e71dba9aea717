//! The Request typestate: one LLM call, identified externally by `custom_id`.
//!
//! Directly generalizes the teacher's `request::types` (`RequestState` trait, `Request<T>`,
//! `AnyRequest`) from the teacher's 6 states to the 9 states of `SPEC_FULL.md` §4.3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::delivery::DeliveryConfig;
use super::endpoint::Endpoint;
use super::ids::{BatchId, RequestId};

/// Marker trait for valid Request states.
pub trait RequestState: Send + Sync + Clone {
    fn name(&self) -> &'static str;
}

/// Fields common to a Request regardless of state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    pub id: RequestId,
    pub batch_id: BatchId,
    pub custom_id: String,
    pub endpoint: Endpoint,
    pub model: String,
    pub request_payload: Value,
    pub request_payload_size: u64,
    pub delivery_config: DeliveryConfig,
    pub response_payload: Option<Value>,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestData {
    /// `request_payload_size = byte_size(canonical_serialize(request_payload))`,
    /// per `SPEC_FULL.md` §3/§8 invariant 4.
    pub fn compute_payload_size(payload: &Value) -> crate::error::Result<u64> {
        Ok(serde_json::to_vec(payload)?.len() as u64)
    }
}

/// A Request in a particular, type-checked state.
#[derive(Debug, Clone)]
pub struct Request<T: RequestState> {
    pub state: T,
    pub data: RequestData,
}

macro_rules! request_state {
    ($name:ident, $tag:literal) => {
        #[derive(Debug, Clone, Default)]
        pub struct $name {}

        impl RequestState for $name {
            fn name(&self) -> &'static str {
                $tag
            }
        }
    };
    ($name:ident, $tag:literal, { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone)]
        pub struct $name {
            $(pub $field: $ty),*
        }

        impl RequestState for $name {
            fn name(&self) -> &'static str {
                $tag
            }
        }
    };
}

request_state!(Pending, "pending");
request_state!(ProviderProcessing, "provider_processing");
request_state!(ProviderProcessed, "provider_processed");
request_state!(Delivering, "delivering");
request_state!(Delivered, "delivered", { at: DateTime<Utc> });
request_state!(Failed, "failed", { at: DateTime<Utc> });
request_state!(DeliveryFailed, "delivery_failed", { at: DateTime<Utc> });
request_state!(Expired, "expired", { at: DateTime<Utc> });
request_state!(Cancelled, "cancelled", { at: DateTime<Utc> });

/// The full set of Request states, for storage and cross-state code.
#[derive(Debug, Clone)]
pub enum AnyRequest {
    Pending(Request<Pending>),
    ProviderProcessing(Request<ProviderProcessing>),
    ProviderProcessed(Request<ProviderProcessed>),
    Delivering(Request<Delivering>),
    Delivered(Request<Delivered>),
    Failed(Request<Failed>),
    DeliveryFailed(Request<DeliveryFailed>),
    Expired(Request<Expired>),
    Cancelled(Request<Cancelled>),
}

macro_rules! any_request_from {
    ($state:ident) => {
        impl From<Request<$state>> for AnyRequest {
            fn from(r: Request<$state>) -> Self {
                AnyRequest::$state(r)
            }
        }
    };
}

any_request_from!(Pending);
any_request_from!(ProviderProcessing);
any_request_from!(ProviderProcessed);
any_request_from!(Delivering);
any_request_from!(Delivered);
any_request_from!(Failed);
any_request_from!(DeliveryFailed);
any_request_from!(Expired);
any_request_from!(Cancelled);

impl AnyRequest {
    pub fn id(&self) -> RequestId {
        self.data().id
    }

    pub fn data(&self) -> &RequestData {
        match self {
            AnyRequest::Pending(r) => &r.data,
            AnyRequest::ProviderProcessing(r) => &r.data,
            AnyRequest::ProviderProcessed(r) => &r.data,
            AnyRequest::Delivering(r) => &r.data,
            AnyRequest::Delivered(r) => &r.data,
            AnyRequest::Failed(r) => &r.data,
            AnyRequest::DeliveryFailed(r) => &r.data,
            AnyRequest::Expired(r) => &r.data,
            AnyRequest::Cancelled(r) => &r.data,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            AnyRequest::Pending(r) => r.state.name(),
            AnyRequest::ProviderProcessing(r) => r.state.name(),
            AnyRequest::ProviderProcessed(r) => r.state.name(),
            AnyRequest::Delivering(r) => r.state.name(),
            AnyRequest::Delivered(r) => r.state.name(),
            AnyRequest::Failed(r) => r.state.name(),
            AnyRequest::DeliveryFailed(r) => r.state.name(),
            AnyRequest::Expired(r) => r.state.name(),
            AnyRequest::Cancelled(r) => r.state.name(),
        }
    }

    /// Terminal states per `SPEC_FULL.md` §4.3.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnyRequest::Delivered(_)
                | AnyRequest::Failed(_)
                | AnyRequest::DeliveryFailed(_)
                | AnyRequest::Expired(_)
                | AnyRequest::Cancelled(_)
        )
    }

    /// Whether this Request counts as successfully delivered for batch-completion accounting
    /// (`SPEC_FULL.md` §4.7).
    pub fn is_delivered(&self) -> bool {
        matches!(self, AnyRequest::Delivered(_))
    }

    pub fn as_pending(&self) -> Option<&Request<Pending>> {
        match self {
            AnyRequest::Pending(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_provider_processing(&self) -> Option<&Request<ProviderProcessing>> {
        match self {
            AnyRequest::ProviderProcessing(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_provider_processed(&self) -> Option<&Request<ProviderProcessed>> {
        match self {
            AnyRequest::ProviderProcessed(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_size_matches_serialized_bytes() {
        let payload = serde_json::json!({"model": "gpt-4o-mini", "messages": []});
        let size = RequestData::compute_payload_size(&payload).unwrap();
        assert_eq!(size, serde_json::to_vec(&payload).unwrap().len() as u64);
    }

    #[test]
    fn terminal_states_match_spec() {
        let now = Utc::now();
        assert!(AnyRequest::from(Request {
            state: Delivered { at: now },
            data: sample_data(),
        })
        .is_terminal());
        assert!(!AnyRequest::from(Request {
            state: ProviderProcessed {},
            data: sample_data(),
        })
        .is_terminal());
    }

    fn sample_data() -> RequestData {
        RequestData {
            id: RequestId(1),
            batch_id: BatchId(1),
            custom_id: "cid-1".into(),
            endpoint: Endpoint::Responses,
            model: "gpt-4o-mini".into(),
            request_payload: serde_json::json!({}),
            request_payload_size: 2,
            delivery_config: DeliveryConfig::Webhook {
                url: "https://example.com/hook".into(),
            },
            response_payload: None,
            error_msg: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

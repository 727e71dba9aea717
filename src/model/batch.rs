//! The Batch typestate: a draft file groups Requests for one `(endpoint, model)` and carries
//! them through upload, remote processing, download, and delivery.
//!
//! Follows the same typestate shape as the teacher's `request::types` (a marker trait plus one
//! zero/small-field struct per state, generic `Batch<S>`, and a tagged `AnyBatch` for storage
//! and cross-state handling), generalized from the teacher's 6 Request states to the 14 Batch
//! states in `SPEC_FULL.md` §4.2.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::endpoint::Endpoint;
use super::ids::BatchId;

/// Marker trait for valid Batch states.
pub trait BatchState: Send + Sync + Clone {
    /// The lowercase name used in storage and in `WrongState` errors.
    fn name(&self) -> &'static str;
}

/// Token-usage counters reported by `ProviderClient::check_status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub cached: u64,
    pub reasoning: u64,
    pub output: u64,
}

/// Fields common to a Batch regardless of state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchData {
    pub id: BatchId,
    pub endpoint: Endpoint,
    pub model: String,
    pub provider_input_file_id: Option<String>,
    pub provider_output_file_id: Option<String>,
    pub provider_error_file_id: Option<String>,
    pub provider_batch_id: Option<String>,
    pub provider_status_last_checked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage: TokenUsage,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A Batch in a particular, type-checked state.
#[derive(Debug, Clone)]
pub struct Batch<S: BatchState> {
    pub state: S,
    pub data: BatchData,
}

macro_rules! batch_state {
    ($name:ident, $tag:literal) => {
        #[derive(Debug, Clone, Default)]
        pub struct $name {}

        impl BatchState for $name {
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

        impl BatchState for $name {
            fn name(&self) -> &'static str {
                $tag
            }
        }
    };
}

batch_state!(Building, "building");
batch_state!(Uploading, "uploading");
batch_state!(Uploaded, "uploaded");
batch_state!(ProviderProcessing, "provider_processing");
batch_state!(Expired, "expired");
batch_state!(ProviderCompleted, "provider_completed");
batch_state!(Downloading, "downloading");
batch_state!(ReadyToDeliver, "ready_to_deliver");
batch_state!(Delivering, "delivering");
batch_state!(Delivered, "delivered", { at: DateTime<Utc> });
batch_state!(PartiallyDelivered, "partially_delivered", { at: DateTime<Utc> });
batch_state!(DeliveryFailed, "delivery_failed", { at: DateTime<Utc> });
batch_state!(Failed, "failed", { at: DateTime<Utc> });
batch_state!(Cancelled, "cancelled", { at: DateTime<Utc> });

/// The full set of Batch states a Batch terminates or moves through, for storage and
/// cross-state code (the Lifecycle Engine dispatches on this).
#[derive(Debug, Clone)]
pub enum AnyBatch {
    Building(Batch<Building>),
    Uploading(Batch<Uploading>),
    Uploaded(Batch<Uploaded>),
    ProviderProcessing(Batch<ProviderProcessing>),
    Expired(Batch<Expired>),
    ProviderCompleted(Batch<ProviderCompleted>),
    Downloading(Batch<Downloading>),
    ReadyToDeliver(Batch<ReadyToDeliver>),
    Delivering(Batch<Delivering>),
    Delivered(Batch<Delivered>),
    PartiallyDelivered(Batch<PartiallyDelivered>),
    DeliveryFailed(Batch<DeliveryFailed>),
    Failed(Batch<Failed>),
    Cancelled(Batch<Cancelled>),
}

macro_rules! any_batch_from {
    ($state:ident) => {
        impl From<Batch<$state>> for AnyBatch {
            fn from(b: Batch<$state>) -> Self {
                AnyBatch::$state(b)
            }
        }
    };
}

any_batch_from!(Building);
any_batch_from!(Uploading);
any_batch_from!(Uploaded);
any_batch_from!(ProviderProcessing);
any_batch_from!(Expired);
any_batch_from!(ProviderCompleted);
any_batch_from!(Downloading);
any_batch_from!(ReadyToDeliver);
any_batch_from!(Delivering);
any_batch_from!(Delivered);
any_batch_from!(PartiallyDelivered);
any_batch_from!(DeliveryFailed);
any_batch_from!(Failed);
any_batch_from!(Cancelled);

impl AnyBatch {
    pub fn id(&self) -> BatchId {
        self.data().id
    }

    pub fn data(&self) -> &BatchData {
        match self {
            AnyBatch::Building(b) => &b.data,
            AnyBatch::Uploading(b) => &b.data,
            AnyBatch::Uploaded(b) => &b.data,
            AnyBatch::ProviderProcessing(b) => &b.data,
            AnyBatch::Expired(b) => &b.data,
            AnyBatch::ProviderCompleted(b) => &b.data,
            AnyBatch::Downloading(b) => &b.data,
            AnyBatch::ReadyToDeliver(b) => &b.data,
            AnyBatch::Delivering(b) => &b.data,
            AnyBatch::Delivered(b) => &b.data,
            AnyBatch::PartiallyDelivered(b) => &b.data,
            AnyBatch::DeliveryFailed(b) => &b.data,
            AnyBatch::Failed(b) => &b.data,
            AnyBatch::Cancelled(b) => &b.data,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            AnyBatch::Building(b) => b.state.name(),
            AnyBatch::Uploading(b) => b.state.name(),
            AnyBatch::Uploaded(b) => b.state.name(),
            AnyBatch::ProviderProcessing(b) => b.state.name(),
            AnyBatch::Expired(b) => b.state.name(),
            AnyBatch::ProviderCompleted(b) => b.state.name(),
            AnyBatch::Downloading(b) => b.state.name(),
            AnyBatch::ReadyToDeliver(b) => b.state.name(),
            AnyBatch::Delivering(b) => b.state.name(),
            AnyBatch::Delivered(b) => b.state.name(),
            AnyBatch::PartiallyDelivered(b) => b.state.name(),
            AnyBatch::DeliveryFailed(b) => b.state.name(),
            AnyBatch::Failed(b) => b.state.name(),
            AnyBatch::Cancelled(b) => b.state.name(),
        }
    }

    /// Terminal states per `SPEC_FULL.md` §4.2: `delivered`, `failed`, `cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnyBatch::Delivered(_) | AnyBatch::Failed(_) | AnyBatch::Cancelled(_)
        )
    }

    pub fn as_building(&self) -> Option<&Batch<Building>> {
        match self {
            AnyBatch::Building(b) => Some(b),
            _ => None,
        }
    }
}

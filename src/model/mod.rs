//! Core domain types: the Batch/Request typestates, delivery configuration, and identifiers.

pub mod batch;
pub mod delivery;
pub mod endpoint;
pub mod ids;
pub mod request;
pub mod transitions;

pub use batch::{AnyBatch, Batch, BatchData, BatchState, TokenUsage};
pub use delivery::{DeliveryConfig, QueueDelivery};
pub use endpoint::Endpoint;
pub use ids::{BatchId, DaemonId, RequestId};
pub use request::{AnyRequest, Request, RequestData, RequestState};

//! Persistence trait for Batches and Requests.
//!
//! Generalizes the teacher's `storage::Storage` trait: the teacher's `persist<T>` writes every
//! column for a request's new state unconditionally. Here each transition also carries the
//! *expected* prior state, so `persist_batch`/`persist_request` can perform the guarded
//! `UPDATE ... WHERE state = $expected` + transition-row insert that `SPEC_FULL.md` §4.1/§4.8
//! requires: a transition whose guard has gone false (a concurrent writer beat us to it) is a
//! `WrongState` error, not a silent overwrite.
//!
//! Like the teacher's trait, this uses native `async fn`-in-trait (RPITIT) rather than
//! `async_trait`, because `persist_batch`/`persist_request` are generic over the target state.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::batch::Building;
use crate::model::request::Pending;
use crate::model::{
    AnyBatch, AnyRequest, Batch, BatchId, BatchState, DeliveryConfig, Endpoint, Request, RequestId, RequestState,
};
use crate::sinks::Outcome;

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// One row of a Batch's or Request's transition history, written atomically with every
/// guarded state change (`SPEC_FULL.md` §4.1: "Every transition writes ... Transition atomically
/// with the state change").
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from_state: String,
    pub to_state: String,
    pub at: DateTime<Utc>,
}

/// Running tallies of how a Batch's Requests have resolved, used to decide between
/// `delivered`, `partially_delivered`, and `delivery_failed` at batch completion
/// (`SPEC_FULL.md` §4.7).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryCounts {
    pub total: usize,
    pub delivered: usize,
    pub terminal_failed: usize,
}

impl DeliveryCounts {
    pub fn all_resolved(&self) -> bool {
        self.delivered + self.terminal_failed >= self.total
    }
}

/// A single delivery attempt against a Request's delivery config, recorded for audit and for
/// deriving retry counts (`SPEC_FULL.md` §4.6). Carries the closed `Outcome` classification and a
/// snapshot of the `DeliveryConfig` used for the attempt (`SPEC_FULL.md` §3, §4.6 step 4) rather
/// than collapsing the outcome to a bare success/failure bit.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub request_id: RequestId,
    pub attempt_number: u32,
    pub outcome: Outcome,
    pub delivery_config: DeliveryConfig,
    pub error_msg: Option<String>,
    pub at: DateTime<Utc>,
}

/// Persistence contract for Batches and Requests.
///
/// The type system guarantees a caller can only ask to persist a state reachable from a real
/// `Batch<S>`/`Request<T>` value, so implementations don't validate the shape of the new
/// state — only that the row was still in the state the caller started from.
pub trait Store: Send + Sync {
    /// Return the single `building` Batch for `(endpoint, model)`, if one exists. Aggregators
    /// use this to find the batch they should admit into.
    fn get_building_batch(
        &self,
        endpoint: Endpoint,
        model: &str,
    ) -> impl Future<Output = Result<Option<Batch<Building>>>> + Send;

    /// Create a new `building` Batch for `(endpoint, model)`. Callers must have already
    /// established (e.g. via the per-key Aggregator actor) that no other `building` Batch
    /// exists for this key.
    fn create_building_batch(
        &self,
        endpoint: Endpoint,
        model: &str,
    ) -> impl Future<Output = Result<Batch<Building>>> + Send;

    /// Current request count and total `request_payload_size` for a Batch, used to enforce
    /// the count/byte caps during admission (`SPEC_FULL.md` §4.1 invariant).
    fn batch_request_stats(&self, batch_id: BatchId) -> impl Future<Output = Result<(usize, u64)>> + Send;

    /// Insert a newly admitted `pending` Request.
    ///
    /// # Errors
    /// - `Other` wrapping a uniqueness violation if `(batch_id, custom_id)` already exists.
    fn insert_request(&self, request: Request<Pending>) -> impl Future<Output = Result<()>> + Send;

    /// Persist a Batch's new state, guarded on the Batch still being in `from`.
    ///
    /// Performs the conditional `UPDATE ... WHERE id = $id AND state = $from` and inserts the
    /// matching `TransitionRecord`, atomically. Zero rows affected by the update is a
    /// `WrongState` error, not a silent no-op (`SPEC_FULL.md` §4.1, §9 Design Notes).
    fn persist_batch<S: BatchState + Clone>(
        &self,
        from: &'static str,
        batch: &Batch<S>,
    ) -> impl Future<Output = Result<()>> + Send
    where
        AnyBatch: From<Batch<S>>;

    /// Persist a Request's new state, guarded on the Request still being in `from`. See
    /// `persist_batch` for the guard semantics.
    fn persist_request<S: RequestState + Clone>(
        &self,
        from: &'static str,
        request: &Request<S>,
    ) -> impl Future<Output = Result<()>> + Send
    where
        AnyRequest: From<Request<S>>;

    /// Fetch a Batch in whatever state it currently holds.
    fn get_batch(&self, id: BatchId) -> impl Future<Output = Result<AnyBatch>> + Send;

    /// Fetch a Request in whatever state it currently holds.
    fn get_request(&self, id: RequestId) -> impl Future<Output = Result<AnyRequest>> + Send;

    /// Look up a Request by its caller-facing `custom_id` within a Batch, used to reject
    /// duplicate `custom_id`s during admission.
    fn get_request_by_custom_id(
        &self,
        batch_id: BatchId,
        custom_id: &str,
    ) -> impl Future<Output = Result<Option<AnyRequest>>> + Send;

    /// All Requests belonging to a Batch, in whatever state each currently holds.
    fn list_requests_for_batch(&self, batch_id: BatchId) -> impl Future<Output = Result<Vec<AnyRequest>>> + Send;

    /// Requests belonging to a Batch that are currently in the named state (used by the
    /// result processor and by the delivery sweep).
    fn list_requests_in_state(
        &self,
        batch_id: BatchId,
        state_name: &'static str,
    ) -> impl Future<Output = Result<Vec<AnyRequest>>> + Send;

    /// Delete a Batch and cascade-delete its Requests, transition rows, and delivery attempts
    /// (`SPEC_FULL.md` §4.1's retention/cleanup action).
    fn delete_batch(&self, id: BatchId) -> impl Future<Output = Result<()>> + Send;

    /// Record a delivery attempt against a Request.
    fn insert_delivery_attempt(&self, attempt: DeliveryAttempt) -> impl Future<Output = Result<()>> + Send;

    /// How many of a Batch's Requests have resolved (delivered or terminally failed), for
    /// deciding batch-level completion state.
    fn delivery_completion_counts(&self, batch_id: BatchId) -> impl Future<Output = Result<DeliveryCounts>> + Send;

    /// Number of delivery attempts already recorded for a Request, used to decide whether a
    /// further retry is allowed under `Config::delivery_max_attempts`.
    fn delivery_attempt_count(&self, request_id: RequestId) -> impl Future<Output = Result<u32>> + Send;

    /// A Request's full delivery-attempt history, oldest first, for audit and debugging
    /// (`SPEC_FULL.md` §3's `RequestDeliveryAttempt`).
    fn list_delivery_attempts(&self, request_id: RequestId) -> impl Future<Output = Result<Vec<DeliveryAttempt>>> + Send;

    /// `building` Batches whose `created_at` is older than `age`, for the staleness sweep that
    /// force-closes abandoned batches (`SPEC_FULL.md` §4.4).
    fn list_building_batches_older_than(
        &self,
        age: Duration,
    ) -> impl Future<Output = Result<Vec<Batch<Building>>>> + Send;

    /// IDs of every Batch currently in the named state, for generic state-polling jobs.
    fn list_batches_in_state(&self, state_name: &'static str) -> impl Future<Output = Result<Vec<BatchId>>> + Send;

    /// A Batch's full transition history, oldest first.
    fn get_batch_transitions(&self, id: BatchId) -> impl Future<Output = Result<Vec<TransitionRecord>>> + Send;

    /// A Request's full transition history, oldest first.
    fn get_request_transitions(&self, id: RequestId) -> impl Future<Output = Result<Vec<TransitionRecord>>> + Send;
}

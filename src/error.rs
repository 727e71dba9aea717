//! Crate-wide error taxonomy.

use thiserror::Error;

use crate::model::{BatchId, RequestId};

/// Result type for batch-manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the batch-manager core.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed.
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An HTTP call (provider client or webhook sink) failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local file I/O failed (batch file write/read, temp download).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// No Request with this id exists in the Store.
    #[error("request not found: {0}")]
    RequestNotFound(RequestId),

    /// No Batch with this id exists in the Store.
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    /// A transition was attempted whose guard did not hold — the conditional
    /// `UPDATE ... WHERE state = expected` touched zero rows.
    #[error("wrong state: {entity} expected {expected}, found {found}")]
    WrongState {
        entity: String,
        expected: String,
        found: String,
    },

    /// Adapter-level failure (ProviderClient, Sink) that doesn't warrant its own variant.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced to the Intake Facade's caller. Deliberately narrower than
/// [`Error`] — admission never leaks internal storage/transport failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmitError {
    /// A Request with this `custom_id` already exists in the open Batch.
    #[error("custom_id already taken: {0}")]
    CustomIdAlreadyTaken(String),

    /// Admitting this request would exceed `MAX_REQUESTS_PER_BATCH` or `MAX_BATCH_SIZE_BYTES`.
    #[error("batch full")]
    BatchFull,

    /// The open Batch changed state concurrently with this admit; caller should retry once.
    #[error("batch not building")]
    BatchNotBuilding,

    /// The request or its delivery config failed validation.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The maintenance gate is on; intake is refused.
    #[error("maintenance mode")]
    MaintenanceMode,
}

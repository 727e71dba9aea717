//! Delivery sinks — where a Request's response ends up (`SPEC_FULL.md` §4.6).
//!
//! Grounded in `http::HttpClient`'s shape (one async trait, a production adapter, a mock) but a
//! new contract: sinks don't return raw status/body, they classify the result into the closed
//! `Outcome` set the Delivery Engine branches on (retry vs. terminal-fail).

pub mod cache;
pub mod queue;
pub mod webhook;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::model::DeliveryConfig;

pub use cache::DestinationCache;
pub use queue::QueueSink;
pub use webhook::WebhookSink;

/// Closed set of delivery results (`SPEC_FULL.md` §4.6). `is_transient` drives whether the
/// Delivery Engine retries or moves the Request straight to `delivery_failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    AuthorizationError,
    HttpStatusNot2xx,
    Timeout,
    ConnectionError,
    ExchangeNotFound,
    QueueNotFound,
    RabbitmqNotConfigured,
    Other(String),
}

impl Outcome {
    pub fn is_transient(&self) -> bool {
        matches!(self, Outcome::HttpStatusNot2xx | Outcome::Timeout | Outcome::ConnectionError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::AuthorizationError => "authorization_error",
            Outcome::HttpStatusNot2xx => "http_status_not_2xx",
            Outcome::Timeout => "timeout",
            Outcome::ConnectionError => "connection_error",
            Outcome::ExchangeNotFound => "exchange_not_found",
            Outcome::QueueNotFound => "queue_not_found",
            Outcome::RabbitmqNotConfigured => "rabbitmq_not_configured",
            Outcome::Other(_) => "other",
        }
    }

    pub fn error_msg(&self) -> Option<String> {
        match self {
            Outcome::Other(msg) => Some(msg.clone()),
            Outcome::Success => None,
            other => Some(other.as_str().to_string()),
        }
    }

    /// Reconstructs an `Outcome` from a persisted `(outcome, error_msg)` pair — the inverse of
    /// `as_str()`/`error_msg()`, needed because `Other`'s message isn't recoverable from the
    /// discriminant column alone.
    pub fn from_row(outcome: &str, error_msg: Option<&str>) -> std::result::Result<Self, String> {
        match outcome {
            "success" => Ok(Outcome::Success),
            "authorization_error" => Ok(Outcome::AuthorizationError),
            "http_status_not_2xx" => Ok(Outcome::HttpStatusNot2xx),
            "timeout" => Ok(Outcome::Timeout),
            "connection_error" => Ok(Outcome::ConnectionError),
            "exchange_not_found" => Ok(Outcome::ExchangeNotFound),
            "queue_not_found" => Ok(Outcome::QueueNotFound),
            "rabbitmq_not_configured" => Ok(Outcome::RabbitmqNotConfigured),
            "other" => Ok(Outcome::Other(error_msg.unwrap_or_default().to_string())),
            other => Err(format!("unknown delivery outcome in db: {other}")),
        }
    }
}

/// A delivery destination. `deliver` never returns `Err` for ordinary delivery failures — those
/// are `Outcome` variants; `Err` is reserved for adapter-internal faults (e.g. serialization).
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, config: &DeliveryConfig, payload: &Value) -> Result<Outcome>;
}

/// Dispatches to `WebhookSink`/`QueueSink` by `DeliveryConfig` variant.
pub struct SinkRouter {
    pub webhook: WebhookSink,
    pub queue: QueueSink,
}

#[async_trait]
impl Sink for SinkRouter {
    async fn deliver(&self, config: &DeliveryConfig, payload: &Value) -> Result<Outcome> {
        match config {
            DeliveryConfig::Webhook { .. } => self.webhook.deliver(config, payload).await,
            DeliveryConfig::Queue(_) => self.queue.deliver(config, payload).await,
        }
    }
}

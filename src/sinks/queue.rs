//! AMQP-style queue sink.
//!
//! The teacher repo carries no message-queue dependency, so this adapter's crate (`lapin`) is
//! sourced from the wider ecosystem rather than invented (see DESIGN.md's "Dependency
//! deviations"). Shape follows `WebhookSink`/`http::ReqwestHttpClient`: one shared client handle
//! behind a lock, `#[tracing::instrument]`, failures mapped to `Outcome` rather than bubbled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use super::{DestinationCache, Outcome, Sink};
use crate::error::Result;
use crate::model::{DeliveryConfig, QueueDelivery};

const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

struct ReconnectState {
    backoff: Duration,
    next_attempt_at: Option<Instant>,
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self {
            backoff: RECONNECT_BASE,
            next_attempt_at: None,
        }
    }
}

/// Publishes are partitioned by a hash of the destination key so that per-destination ordering
/// is preserved (same key always lands on the same partition's lock) while unrelated
/// destinations proceed in parallel (`SPEC_FULL.md` §4.6 "Ordering (queue sink)").
pub struct QueueSink {
    uri: Option<String>,
    connection: AsyncMutex<Option<Connection>>,
    reconnect: Mutex<ReconnectState>,
    partitions: Vec<Arc<AsyncMutex<()>>>,
    cache: Arc<DestinationCache>,
}

impl QueueSink {
    /// `uri = None` means no broker is configured; every publish yields
    /// `rabbitmq_not_configured`.
    pub fn new(uri: Option<String>, cache: Arc<DestinationCache>, partition_count: usize) -> Self {
        let partitions = (0..partition_count.max(1))
            .map(|_| Arc::new(AsyncMutex::new(())))
            .collect();
        Self {
            uri,
            connection: AsyncMutex::new(None),
            reconnect: Mutex::new(ReconnectState::default()),
            partitions,
            cache,
        }
    }

    pub fn connected(&self) -> bool {
        self.uri.is_some()
    }

    pub fn clear_destination_cache(&self, exchange: &str, routing_key: &str) {
        self.cache.clear_destination_cache(exchange, routing_key);
    }

    pub fn clear_all_cache(&self) {
        self.cache.clear_all();
    }

    fn partition_for(&self, exchange: &str, routing_key: &str) -> Arc<AsyncMutex<()>> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        (exchange, routing_key).hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.partitions.len();
        self.partitions[idx].clone()
    }

    async fn channel(&self) -> std::result::Result<Channel, Outcome> {
        let uri = self.uri.as_ref().ok_or(Outcome::RabbitmqNotConfigured)?;

        {
            let gate = self.reconnect.lock();
            if let Some(next) = gate.next_attempt_at {
                if Instant::now() < next {
                    return Err(Outcome::ConnectionError);
                }
            }
        }

        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if let Ok(ch) = conn.create_channel().await {
                return Ok(ch);
            }
        }

        match Connection::connect(uri, ConnectionProperties::default()).await {
            Ok(conn) => {
                let ch = conn.create_channel().await.map_err(|_| Outcome::ConnectionError)?;
                *guard = Some(conn);
                let mut gate = self.reconnect.lock();
                *gate = ReconnectState::default();
                Ok(ch)
            }
            Err(_) => {
                let mut gate = self.reconnect.lock();
                gate.next_attempt_at = Some(Instant::now() + gate.backoff);
                gate.backoff = (gate.backoff * 2).min(RECONNECT_MAX);
                Err(Outcome::ConnectionError)
            }
        }
    }

    async fn passive_declare(
        &self,
        channel: &Channel,
        exchange: &str,
        queue_name: Option<&str>,
    ) -> std::result::Result<(), Outcome> {
        if !exchange.is_empty() {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        passive: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|_| Outcome::ExchangeNotFound)?;
        }

        if let Some(queue_name) = queue_name {
            channel
                .queue_declare(
                    queue_name,
                    QueueDeclareOptions {
                        passive: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|_| Outcome::QueueNotFound)?;
        }

        Ok(())
    }
}

#[async_trait]
impl Sink for QueueSink {
    #[tracing::instrument(skip(self, payload))]
    async fn deliver(&self, config: &DeliveryConfig, payload: &Value) -> Result<Outcome> {
        let DeliveryConfig::Queue(delivery) = config else {
            return Ok(Outcome::Other("queue sink invoked with non-queue config".into()));
        };

        let (exchange, routing_key, queue_name) = match delivery {
            QueueDelivery::Named { queue_name } => (String::new(), queue_name.clone(), Some(queue_name.clone())),
            QueueDelivery::Routed { exchange, routing_key, queue_name } => {
                (exchange.clone(), routing_key.clone(), queue_name.clone())
            }
        };

        if let Some(cached) = self.cache.lookup(&exchange, &routing_key) {
            if let Err(outcome) = cached {
                tracing::debug!(%exchange, %routing_key, "destination cache hit: failed");
                return Ok(outcome);
            }
            tracing::trace!(%exchange, %routing_key, "destination cache hit: validated");
        } else {
            let channel = match self.channel().await {
                Ok(ch) => ch,
                Err(outcome) => return Ok(outcome),
            };
            if let Err(outcome) = self
                .passive_declare(&channel, &exchange, queue_name.as_deref())
                .await
            {
                self.cache.mark_failed(&exchange, &routing_key, outcome.clone());
                return Ok(outcome);
            }
            self.cache.mark_validated(&exchange, &routing_key);
        }

        let partition = self.partition_for(&exchange, &routing_key);
        let _guard = partition.lock().await;

        let channel = match self.channel().await {
            Ok(ch) => ch,
            Err(outcome) => return Ok(outcome),
        };

        let body = serde_json::to_vec(payload)?;
        let publish = channel.basic_publish(
            &exchange,
            &routing_key,
            BasicPublishOptions::default(),
            &body,
            BasicProperties::default(),
        );

        match tokio::time::timeout(CONFIRM_TIMEOUT, publish).await {
            Ok(Ok(confirm)) => match confirm.await {
                Ok(_) => Ok(Outcome::Success),
                Err(e) => {
                    tracing::warn!(error = %e, "publisher confirm failed");
                    Ok(Outcome::Other(e.to_string()))
                }
            },
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "publish failed");
                Ok(Outcome::ConnectionError)
            }
            Err(_) => {
                tracing::warn!("publish confirm timed out");
                Ok(Outcome::Timeout)
            }
        }
    }
}

//! Topic pub/sub for intra-process coordination (`SPEC_FULL.md` §4.1, §10.5).
//!
//! The Aggregator subscribes to `batch.state_changed(id)`/`batch.destroyed(id)` for its current
//! Batch so it self-terminates if the Batch advances or is deleted out-of-band. Generalizes the
//! teacher's `manager::{in_memory, postgres}` status-update streams — there, one fixed stream of
//! `AnyRequest` updates; here, a topic-keyed pub/sub so unrelated Aggregators don't wake each
//! other up.

use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::Stream;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::model::{BatchId, RequestId};

/// An event published on the Bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    BatchStateChanged { batch_id: BatchId, state: &'static str },
    BatchDestroyed { batch_id: BatchId },
    RequestStateChanged { request_id: RequestId, state: &'static str },
}

impl BusEvent {
    fn batch_id(&self) -> Option<BatchId> {
        match self {
            BusEvent::BatchStateChanged { batch_id, .. } => Some(*batch_id),
            BusEvent::BatchDestroyed { batch_id } => Some(*batch_id),
            BusEvent::RequestStateChanged { .. } => None,
        }
    }
}

/// Pub/sub contract used for Aggregator self-termination and status-update streaming.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, event: BusEvent) -> Result<()>;

    /// A stream of every event concerning one Batch (`batch.state_changed`/`batch.destroyed`).
    fn subscribe_batch(&self, batch_id: BatchId) -> Pin<Box<dyn Stream<Item = BusEvent> + Send>>;
}

/// In-memory Bus backed by a `tokio::sync::broadcast` channel, filtered per-subscription.
///
/// Grounded in `manager::in_memory::InMemoryRequestManager`'s `status_tx`/`get_status_updates`
/// (`broadcast::channel` + `async_stream::stream!` turning `rx.recv()` into a `Stream`).
#[derive(Clone)]
pub struct InMemoryBus {
    tx: broadcast::Sender<BusEvent>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(4096);
        Self { tx }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, event: BusEvent) -> Result<()> {
        // No subscribers is not an error: the Bus is fire-and-forget.
        let _ = self.tx.send(event);
        Ok(())
    }

    fn subscribe_batch(&self, batch_id: BatchId) -> Pin<Box<dyn Stream<Item = BusEvent> + Send>> {
        let mut rx = self.tx.subscribe();

        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) if event.batch_id() == Some(batch_id) => yield event,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged_count = n, "bus subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Postgres LISTEN/NOTIFY-backed Bus, reusing the Store's connection pool.
///
/// Grounded in `manager::postgres::PostgresRequestManager::get_status_updates` (`PgListener`,
/// `listener.listen(channel)`, `listener.recv()` loop, payload carries the row id).
#[cfg(feature = "postgres")]
pub struct PostgresBus {
    store: crate::store::postgres::PostgresStore,
}

#[cfg(feature = "postgres")]
impl PostgresBus {
    pub fn new(store: crate::store::postgres::PostgresStore) -> Self {
        Self { store }
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl Bus for PostgresBus {
    async fn publish(&self, _event: BusEvent) -> Result<()> {
        // Row changes are published by the `notify_batch_change`/`notify_request_change`
        // triggers in `migrations/0001_init.sql` as part of the same transaction that performs
        // the write; an explicit publish() from application code has nothing left to do.
        Ok(())
    }

    fn subscribe_batch(&self, batch_id: BatchId) -> Pin<Box<dyn Stream<Item = BusEvent> + Send>> {
        let store = self.store.clone();

        Box::pin(async_stream::stream! {
            let mut listener = match store.create_listener().await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(error = %e, "failed to create bus listener");
                    return;
                }
            };

            if let Err(e) = listener.listen("batch_updates").await {
                tracing::error!(error = %e, "failed to LISTEN on batch_updates");
                return;
            }

            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let Ok(id) = notification.payload().parse::<i64>() else {
                            continue;
                        };
                        if id != batch_id.0 {
                            continue;
                        }
                        match store.get_batch(batch_id).await {
                            Ok(batch) => yield BusEvent::BatchStateChanged {
                                batch_id,
                                state: batch.state_name(),
                            },
                            Err(crate::error::Error::BatchNotFound(_)) => {
                                yield BusEvent::BatchDestroyed { batch_id };
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, %batch_id, "failed to fetch batch after notification");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "error receiving bus notification");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_only_see_events_for_their_batch() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe_batch(BatchId(1));

        bus.publish(BusEvent::BatchStateChanged {
            batch_id: BatchId(2),
            state: "uploading",
        })
        .await
        .unwrap();
        bus.publish(BusEvent::BatchStateChanged {
            batch_id: BatchId(1),
            state: "uploading",
        })
        .await
        .unwrap();

        use futures::StreamExt;
        let event = stream.next().await.unwrap();
        assert!(matches!(event, BusEvent::BatchStateChanged { batch_id, .. } if batch_id == BatchId(1)));
    }
}

//! PostgreSQL Store implementation.
//!
//! Grounded in the teacher's `storage::postgres::PostgresStorage`: a `PgPool`, `SELECT ... FOR
//! UPDATE SKIP LOCKED` for atomic claims, and a `PgListener` helper for change notification.
//! `persist_batch`/`persist_request` generalize the teacher's per-variant `persist` match arms
//! into one statement over the common columns (`BatchData`/`RequestData` carry every field any
//! state needs, so one conditional `UPDATE ... WHERE state = $expected` covers all 14/9 states)
//! rather than writing a bespoke `UPDATE` per state as the teacher does for its 6 Request states.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPool};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::batch::{Building, TokenUsage};
use crate::model::request::Pending;
use crate::model::{
    AnyBatch, AnyRequest, Batch, BatchData, BatchId, BatchState, DeliveryConfig, Endpoint, Request, RequestData,
    RequestId, RequestState,
};
use crate::sinks::Outcome;

use super::{DeliveryAttempt, DeliveryCounts, Store, TransitionRecord};

/// PostgreSQL-backed Store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// A listener subscribed to row-change notifications, for a Postgres-notify-backed `Bus`.
    ///
    /// # Example
    /// ```ignore
    /// let mut listener = store.create_listener().await?;
    /// listener.listen("batch_updates").await?;
    /// while let Some(n) = listener.recv().await.ok() {
    ///     println!("batch changed: {}", n.payload());
    /// }
    /// ```
    pub async fn create_listener(&self) -> Result<PgListener> {
        PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| Error::Other(anyhow!("failed to create listener: {e}")))
    }
}

struct BatchRow {
    id: i64,
    state: String,
    endpoint: String,
    model: String,
    provider_input_file_id: Option<String>,
    provider_output_file_id: Option<String>,
    provider_error_file_id: Option<String>,
    provider_batch_id: Option<String>,
    provider_status_last_checked_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    usage_input_tokens: i64,
    usage_cached_tokens: i64,
    usage_reasoning_tokens: i64,
    usage_output_tokens: i64,
    error_msg: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BatchRow {
    fn into_data(self) -> Result<BatchData> {
        Ok(BatchData {
            id: BatchId(self.id),
            endpoint: self
                .endpoint
                .parse()
                .map_err(|e| Error::Other(anyhow!("bad endpoint in db: {e}")))?,
            model: self.model,
            provider_input_file_id: self.provider_input_file_id,
            provider_output_file_id: self.provider_output_file_id,
            provider_error_file_id: self.provider_error_file_id,
            provider_batch_id: self.provider_batch_id,
            provider_status_last_checked_at: self.provider_status_last_checked_at,
            expires_at: self.expires_at,
            usage: TokenUsage {
                input: self.usage_input_tokens as u64,
                cached: self.usage_cached_tokens as u64,
                reasoning: self.usage_reasoning_tokens as u64,
                output: self.usage_output_tokens as u64,
            },
            error_msg: self.error_msg,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    fn into_any(self) -> Result<AnyBatch> {
        let state = self.state.clone();
        let data = self.into_data()?;
        any_batch_for_state(&state, data)
    }
}

fn any_batch_for_state(state: &str, data: BatchData) -> Result<AnyBatch> {
    use crate::model::batch::*;

    let at = data.updated_at;
    Ok(match state {
        "building" => AnyBatch::Building(Batch { state: Building {}, data }),
        "uploading" => AnyBatch::Uploading(Batch { state: Uploading {}, data }),
        "uploaded" => AnyBatch::Uploaded(Batch { state: Uploaded {}, data }),
        "provider_processing" => AnyBatch::ProviderProcessing(Batch { state: ProviderProcessing {}, data }),
        "expired" => AnyBatch::Expired(Batch { state: Expired {}, data }),
        "provider_completed" => AnyBatch::ProviderCompleted(Batch { state: ProviderCompleted {}, data }),
        "downloading" => AnyBatch::Downloading(Batch { state: Downloading {}, data }),
        "ready_to_deliver" => AnyBatch::ReadyToDeliver(Batch { state: ReadyToDeliver {}, data }),
        "delivering" => AnyBatch::Delivering(Batch { state: Delivering {}, data }),
        "delivered" => AnyBatch::Delivered(Batch { state: Delivered { at }, data }),
        "partially_delivered" => AnyBatch::PartiallyDelivered(Batch { state: PartiallyDelivered { at }, data }),
        "delivery_failed" => AnyBatch::DeliveryFailed(Batch { state: DeliveryFailed { at }, data }),
        "failed" => AnyBatch::Failed(Batch { state: Failed { at }, data }),
        "cancelled" => AnyBatch::Cancelled(Batch { state: Cancelled { at }, data }),
        other => return Err(Error::Other(anyhow!("unknown batch state in db: {other}"))),
    })
}

struct RequestRow {
    id: i64,
    batch_id: i64,
    state: String,
    custom_id: String,
    endpoint: String,
    model: String,
    request_payload: serde_json::Value,
    request_payload_size: i64,
    delivery_config: serde_json::Value,
    response_payload: Option<serde_json::Value>,
    error_msg: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RequestRow {
    fn into_data(self) -> Result<RequestData> {
        Ok(RequestData {
            id: RequestId(self.id),
            batch_id: BatchId(self.batch_id),
            custom_id: self.custom_id,
            endpoint: self
                .endpoint
                .parse()
                .map_err(|e| Error::Other(anyhow!("bad endpoint in db: {e}")))?,
            model: self.model,
            request_payload: self.request_payload,
            request_payload_size: self.request_payload_size as u64,
            delivery_config: serde_json::from_value(self.delivery_config)?,
            response_payload: self.response_payload,
            error_msg: self.error_msg,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    fn into_any(self) -> Result<AnyRequest> {
        let state = self.state.clone();
        let data = self.into_data()?;
        any_request_for_state(&state, data)
    }
}

fn any_request_for_state(state: &str, data: RequestData) -> Result<AnyRequest> {
    use crate::model::request::*;

    let at = data.updated_at;
    Ok(match state {
        "pending" => AnyRequest::Pending(Request { state: Pending {}, data }),
        "provider_processing" => AnyRequest::ProviderProcessing(Request { state: ProviderProcessing {}, data }),
        "provider_processed" => AnyRequest::ProviderProcessed(Request { state: ProviderProcessed {}, data }),
        "delivering" => AnyRequest::Delivering(Request { state: Delivering {}, data }),
        "delivered" => AnyRequest::Delivered(Request { state: Delivered { at }, data }),
        "failed" => AnyRequest::Failed(Request { state: Failed { at }, data }),
        "delivery_failed" => AnyRequest::DeliveryFailed(Request { state: DeliveryFailed { at }, data }),
        "expired" => AnyRequest::Expired(Request { state: Expired { at }, data }),
        "cancelled" => AnyRequest::Cancelled(Request { state: Cancelled { at }, data }),
        other => return Err(Error::Other(anyhow!("unknown request state in db: {other}"))),
    })
}

impl Store for PostgresStore {
    async fn get_building_batch(&self, endpoint: Endpoint, model: &str) -> Result<Option<Batch<Building>>> {
        let row = sqlx::query_as!(
            BatchRow,
            r#"
            SELECT id, state, endpoint, model, provider_input_file_id, provider_output_file_id,
                provider_error_file_id, provider_batch_id, provider_status_last_checked_at,
                expires_at, usage_input_tokens, usage_cached_tokens, usage_reasoning_tokens,
                usage_output_tokens, error_msg, created_at, updated_at
            FROM batches
            WHERE state = 'building' AND endpoint = $1 AND model = $2
            "#,
            endpoint.as_str(),
            model,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(|r| r.into_data().map(|data| Batch { state: Building {}, data }))
            .transpose()
    }

    async fn create_building_batch(&self, endpoint: Endpoint, model: &str) -> Result<Batch<Building>> {
        let row = sqlx::query_as!(
            BatchRow,
            r#"
            INSERT INTO batches (state, endpoint, model)
            VALUES ('building', $1, $2)
            RETURNING id, state, endpoint, model, provider_input_file_id, provider_output_file_id,
                provider_error_file_id, provider_batch_id, provider_status_last_checked_at,
                expires_at, usage_input_tokens, usage_cached_tokens, usage_reasoning_tokens,
                usage_output_tokens, error_msg, created_at, updated_at
            "#,
            endpoint.as_str(),
            model,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(Batch {
            state: Building {},
            data: row.into_data()?,
        })
    }

    async fn batch_request_stats(&self, batch_id: BatchId) -> Result<(usize, u64)> {
        let row = sqlx::query!(
            r#"
            SELECT COUNT(*) AS "count!", COALESCE(SUM(request_payload_size), 0) AS "bytes!"
            FROM requests WHERE batch_id = $1
            "#,
            batch_id.0,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok((row.count as usize, row.bytes as u64))
    }

    async fn insert_request(&self, request: Request<Pending>) -> Result<()> {
        let delivery_config = serde_json::to_value(&request.data.delivery_config)?;

        sqlx::query!(
            r#"
            INSERT INTO requests (
                batch_id, state, custom_id, endpoint, model, request_payload,
                request_payload_size, delivery_config
            ) VALUES ($1, 'pending', $2, $3, $4, $5, $6, $7)
            "#,
            request.data.batch_id.0,
            request.data.custom_id,
            request.data.endpoint.as_str(),
            request.data.model,
            request.data.request_payload,
            request.data.request_payload_size as i64,
            delivery_config,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Other(anyhow!("failed to insert request: {e}")))?;

        Ok(())
    }

    async fn persist_batch<S: BatchState + Clone>(&self, from: &'static str, batch: &Batch<S>) -> Result<()>
    where
        AnyBatch: From<Batch<S>>,
    {
        let data = &batch.data;
        let to = batch.state.name();

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let rows_affected = sqlx::query!(
            r#"
            UPDATE batches SET
                state = $1,
                provider_input_file_id = $2,
                provider_output_file_id = $3,
                provider_error_file_id = $4,
                provider_batch_id = $5,
                provider_status_last_checked_at = $6,
                expires_at = $7,
                usage_input_tokens = $8,
                usage_cached_tokens = $9,
                usage_reasoning_tokens = $10,
                usage_output_tokens = $11,
                error_msg = $12,
                updated_at = now()
            WHERE id = $13 AND state = $14
            "#,
            to,
            data.provider_input_file_id,
            data.provider_output_file_id,
            data.provider_error_file_id,
            data.provider_batch_id,
            data.provider_status_last_checked_at,
            data.expires_at,
            data.usage.input as i64,
            data.usage.cached as i64,
            data.usage.reasoning as i64,
            data.usage.output as i64,
            data.error_msg,
            data.id.0,
            from,
        )
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        if rows_affected == 0 {
            return Err(wrong_state_or_not_found(&mut tx, "batches", data.id.0, from).await?);
        }

        sqlx::query!(
            "INSERT INTO batch_transitions (batch_id, from_state, to_state) VALUES ($1, $2, $3)",
            data.id.0,
            from,
            to,
        )
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn persist_request<S: RequestState + Clone>(&self, from: &'static str, request: &Request<S>) -> Result<()>
    where
        AnyRequest: From<Request<S>>,
    {
        let data = &request.data;
        let to = request.state.name();
        let delivery_config = serde_json::to_value(&data.delivery_config)?;

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let rows_affected = sqlx::query!(
            r#"
            UPDATE requests SET
                state = $1,
                delivery_config = $2,
                response_payload = $3,
                error_msg = $4,
                updated_at = now()
            WHERE id = $5 AND state = $6
            "#,
            to,
            delivery_config,
            data.response_payload,
            data.error_msg,
            data.id.0,
            from,
        )
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        if rows_affected == 0 {
            return Err(wrong_state_or_not_found(&mut tx, "requests", data.id.0, from).await?);
        }

        sqlx::query!(
            "INSERT INTO request_transitions (request_id, from_state, to_state) VALUES ($1, $2, $3)",
            data.id.0,
            from,
            to,
        )
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn get_batch(&self, id: BatchId) -> Result<AnyBatch> {
        let row = sqlx::query_as!(
            BatchRow,
            r#"
            SELECT id, state, endpoint, model, provider_input_file_id, provider_output_file_id,
                provider_error_file_id, provider_batch_id, provider_status_last_checked_at,
                expires_at, usage_input_tokens, usage_cached_tokens, usage_reasoning_tokens,
                usage_output_tokens, error_msg, created_at, updated_at
            FROM batches WHERE id = $1
            "#,
            id.0,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::BatchNotFound(id))?;

        row.into_any()
    }

    async fn get_request(&self, id: RequestId) -> Result<AnyRequest> {
        let row = sqlx::query_as!(
            RequestRow,
            r#"
            SELECT id, batch_id, state, custom_id, endpoint, model, request_payload,
                request_payload_size, delivery_config, response_payload, error_msg,
                created_at, updated_at
            FROM requests WHERE id = $1
            "#,
            id.0,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::RequestNotFound(id))?;

        row.into_any()
    }

    async fn get_request_by_custom_id(&self, batch_id: BatchId, custom_id: &str) -> Result<Option<AnyRequest>> {
        let row = sqlx::query_as!(
            RequestRow,
            r#"
            SELECT id, batch_id, state, custom_id, endpoint, model, request_payload,
                request_payload_size, delivery_config, response_payload, error_msg,
                created_at, updated_at
            FROM requests WHERE batch_id = $1 AND custom_id = $2
            "#,
            batch_id.0,
            custom_id,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(RequestRow::into_any).transpose()
    }

    async fn list_requests_for_batch(&self, batch_id: BatchId) -> Result<Vec<AnyRequest>> {
        let rows = sqlx::query_as!(
            RequestRow,
            r#"
            SELECT id, batch_id, state, custom_id, endpoint, model, request_payload,
                request_payload_size, delivery_config, response_payload, error_msg,
                created_at, updated_at
            FROM requests WHERE batch_id = $1
            "#,
            batch_id.0,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(RequestRow::into_any).collect()
    }

    async fn list_requests_in_state(&self, batch_id: BatchId, state_name: &'static str) -> Result<Vec<AnyRequest>> {
        let rows = sqlx::query_as!(
            RequestRow,
            r#"
            SELECT id, batch_id, state, custom_id, endpoint, model, request_payload,
                request_payload_size, delivery_config, response_payload, error_msg,
                created_at, updated_at
            FROM requests WHERE batch_id = $1 AND state = $2
            "#,
            batch_id.0,
            state_name,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(RequestRow::into_any).collect()
    }

    async fn delete_batch(&self, id: BatchId) -> Result<()> {
        sqlx::query!("DELETE FROM batches WHERE id = $1", id.0)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn insert_delivery_attempt(&self, attempt: DeliveryAttempt) -> Result<()> {
        let delivery_config = serde_json::to_value(&attempt.delivery_config)?;

        sqlx::query!(
            r#"
            INSERT INTO request_delivery_attempts (request_id, attempt_number, outcome, delivery_config, error_msg, at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            attempt.request_id.0,
            attempt.attempt_number as i32,
            attempt.outcome.as_str(),
            delivery_config,
            attempt.error_msg,
            attempt.at,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn delivery_completion_counts(&self, batch_id: BatchId) -> Result<DeliveryCounts> {
        let row = sqlx::query!(
            r#"
            SELECT
                COUNT(*) AS "total!",
                COUNT(*) FILTER (WHERE state = 'delivered') AS "delivered!",
                COUNT(*) FILTER (WHERE state IN ('failed', 'delivery_failed', 'expired', 'cancelled')) AS "terminal_failed!"
            FROM requests WHERE batch_id = $1
            "#,
            batch_id.0,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(DeliveryCounts {
            total: row.total as usize,
            delivered: row.delivered as usize,
            terminal_failed: row.terminal_failed as usize,
        })
    }

    async fn delivery_attempt_count(&self, request_id: RequestId) -> Result<u32> {
        let row = sqlx::query!(
            r#"SELECT COUNT(*) AS "count!" FROM request_delivery_attempts WHERE request_id = $1"#,
            request_id.0,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.count as u32)
    }

    async fn list_delivery_attempts(&self, request_id: RequestId) -> Result<Vec<DeliveryAttempt>> {
        let rows = sqlx::query!(
            r#"
            SELECT attempt_number, outcome, delivery_config, error_msg, at
            FROM request_delivery_attempts WHERE request_id = $1 ORDER BY attempt_number ASC
            "#,
            request_id.0,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter()
            .map(|r| {
                let outcome = Outcome::from_row(&r.outcome, r.error_msg.as_deref())
                    .map_err(|e| Error::Other(anyhow!(e)))?;
                Ok(DeliveryAttempt {
                    request_id,
                    attempt_number: r.attempt_number as u32,
                    outcome,
                    delivery_config: serde_json::from_value(r.delivery_config)?,
                    error_msg: r.error_msg,
                    at: r.at,
                })
            })
            .collect()
    }

    async fn list_building_batches_older_than(&self, age: Duration) -> Result<Vec<Batch<Building>>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero());

        let rows = sqlx::query_as!(
            BatchRow,
            r#"
            SELECT id, state, endpoint, model, provider_input_file_id, provider_output_file_id,
                provider_error_file_id, provider_batch_id, provider_status_last_checked_at,
                expires_at, usage_input_tokens, usage_cached_tokens, usage_reasoning_tokens,
                usage_output_tokens, error_msg, created_at, updated_at
            FROM batches WHERE state = 'building' AND created_at < $1
            "#,
            cutoff,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter()
            .map(|row| row.into_data().map(|data| Batch { state: Building {}, data }))
            .collect()
    }

    async fn list_batches_in_state(&self, state_name: &'static str) -> Result<Vec<BatchId>> {
        let rows = sqlx::query!("SELECT id FROM batches WHERE state = $1", state_name)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(rows.into_iter().map(|r| BatchId(r.id)).collect())
    }

    async fn get_batch_transitions(&self, id: BatchId) -> Result<Vec<TransitionRecord>> {
        let rows = sqlx::query!(
            "SELECT from_state, to_state, at FROM batch_transitions WHERE batch_id = $1 ORDER BY at ASC",
            id.0,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| TransitionRecord {
                from_state: r.from_state,
                to_state: r.to_state,
                at: r.at,
            })
            .collect())
    }

    async fn get_request_transitions(&self, id: RequestId) -> Result<Vec<TransitionRecord>> {
        let rows = sqlx::query!(
            "SELECT from_state, to_state, at FROM request_transitions WHERE request_id = $1 ORDER BY at ASC",
            id.0,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| TransitionRecord {
                from_state: r.from_state,
                to_state: r.to_state,
                at: r.at,
            })
            .collect())
    }
}

/// After a guarded update affects zero rows, distinguish "row doesn't exist" from "row exists
/// but is in a different state" so callers get `BatchNotFound`/`RequestNotFound` rather than a
/// misleading `WrongState`.
async fn wrong_state_or_not_found(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: &'static str,
    id: i64,
    expected: &'static str,
) -> Result<Error> {
    let current_state: Option<String> = match table {
        "batches" => sqlx::query_scalar!("SELECT state FROM batches WHERE id = $1", id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?,
        _ => sqlx::query_scalar!("SELECT state FROM requests WHERE id = $1", id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?,
    };

    Ok(match current_state {
        Some(found) => Error::WrongState {
            entity: format!("{table} {id}"),
            expected: expected.to_string(),
            found,
        },
        None if table == "batches" => Error::BatchNotFound(BatchId(id)),
        None => Error::RequestNotFound(RequestId(id)),
    })
}

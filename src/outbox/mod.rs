//! Transactional outbox for SMS publication intents.
//!
//! An event row is inserted in the same database transaction that charges
//! the customer and creates the pending delivery rows, so the bus never
//! sees a message that was not paid for and a customer is never charged
//! for a message that was not durably enqueued. A background publisher
//! (see [`publisher`]) claims pending rows and pushes them to the bus.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers always get
//! disjoint batches, and marks claimed rows `processing` as a soft lock.
//! `processed` and `failed` are terminal; nothing transitions out of them.

pub mod publisher;

use chrono::{DateTime, Utc};
use sea_query::{
    ColumnDef, Expr, Iden, Index, PostgresQueryBuilder, Query, Table,
};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction as PgTransaction};
use tracing::info;

use crate::model::Sms;

/// Event type emitted for every accepted send request.
pub const SMS_SEND_EVENT: &str = "sms.send";

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("aggregate_type, aggregate_id, and event_type are required")]
    IncompleteEvent,

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Row status; `processing` is a soft lock held by a publisher worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Processed => "processed",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// A publication intent to be inserted.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
}

impl OutboxEvent {
    /// Build an `sms.send` event carrying the full publication payload.
    pub fn sms_send(sms: &Sms, payload: &SmsSendPayload) -> Result<Self> {
        Ok(Self {
            aggregate_type: "sms".to_string(),
            aggregate_id: sms.sms_identifier.clone(),
            event_type: SMS_SEND_EVENT.to_string(),
            payload: serde_json::to_value(payload)?,
            priority: sms.kind.priority(),
        })
    }
}

/// Payload stored with every `sms.send` event: where to publish and what.
///
/// `transaction_id` rides along so a terminally failed publish can still
/// refund the withdrawal it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsSendPayload {
    pub exchange: String,
    pub routing_key: String,
    pub sms: Sms,
    pub transaction_id: String,
}

/// A claimed row handed to a publisher worker.
#[derive(Debug, Clone)]
pub struct ClaimedEvent {
    pub id: i64,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Schema
// ============================================================================

#[derive(Iden)]
enum OutboxEvents {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "aggregate_type"]
    AggregateType,
    #[iden = "aggregate_id"]
    AggregateId,
    #[iden = "event_type"]
    EventType,
    #[iden = "payload"]
    Payload,
    #[iden = "priority"]
    Priority,
    #[iden = "status"]
    Status,
    #[iden = "attempts"]
    Attempts,
    #[iden = "next_run_at"]
    NextRunAt,
    #[iden = "last_error"]
    LastError,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

// ============================================================================
// Store
// ============================================================================

/// Durable store of pending publication intents.
#[derive(Clone)]
pub struct Outbox {
    pool: PgPool,
}

impl Outbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize the outbox table schema.
    pub async fn init(&self) -> std::result::Result<(), sqlx::Error> {
        let create_table = Table::create()
            .table(OutboxEvents::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(OutboxEvents::Id)
                    .big_integer()
                    .auto_increment()
                    .primary_key(),
            )
            .col(ColumnDef::new(OutboxEvents::AggregateType).text().not_null())
            .col(ColumnDef::new(OutboxEvents::AggregateId).text().not_null())
            .col(ColumnDef::new(OutboxEvents::EventType).text().not_null())
            .col(ColumnDef::new(OutboxEvents::Payload).json_binary().not_null())
            .col(
                ColumnDef::new(OutboxEvents::Priority)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .col(
                ColumnDef::new(OutboxEvents::Status)
                    .text()
                    .not_null()
                    .default(OutboxStatus::Pending.as_str()),
            )
            .col(
                ColumnDef::new(OutboxEvents::Attempts)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .col(ColumnDef::new(OutboxEvents::NextRunAt).timestamp_with_time_zone())
            .col(ColumnDef::new(OutboxEvents::LastError).text())
            .col(
                ColumnDef::new(OutboxEvents::CreatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .col(
                ColumnDef::new(OutboxEvents::UpdatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .to_string(PostgresQueryBuilder);

        sqlx::query(&create_table).execute(&self.pool).await?;

        // Covers the claim query's filter and ordering.
        let create_index = Index::create()
            .if_not_exists()
            .name("idx_outbox_events_claim")
            .table(OutboxEvents::Table)
            .col(OutboxEvents::Status)
            .col(OutboxEvents::Priority)
            .col(OutboxEvents::CreatedAt)
            .to_string(PostgresQueryBuilder);

        sqlx::query(&create_index).execute(&self.pool).await?;

        info!("outbox table initialized");
        Ok(())
    }

    /// Insert an event inside the caller's transaction. This is the only
    /// write path into the outbox besides the publisher's finalization.
    pub async fn insert_tx(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> Result<()> {
        if event.aggregate_type.is_empty()
            || event.aggregate_id.is_empty()
            || event.event_type.is_empty()
        {
            return Err(OutboxError::IncompleteEvent);
        }

        let insert = Query::insert()
            .into_table(OutboxEvents::Table)
            .columns([
                OutboxEvents::AggregateType,
                OutboxEvents::AggregateId,
                OutboxEvents::EventType,
                OutboxEvents::Payload,
                OutboxEvents::Priority,
                OutboxEvents::Status,
            ])
            .values_panic([
                event.aggregate_type.as_str().into(),
                event.aggregate_id.as_str().into(),
                event.event_type.as_str().into(),
                event.payload.clone().into(),
                event.priority.into(),
                OutboxStatus::Pending.as_str().into(),
            ])
            .to_string(PostgresQueryBuilder);

        sqlx::query(&insert).execute(&mut **tx).await?;

        Ok(())
    }

    /// Claim a batch of due pending rows within one priority window and
    /// mark them `processing`.
    ///
    /// `SKIP LOCKED` keeps concurrent claimers from waiting on each other:
    /// each worker gets a disjoint batch, and a row is never observed as
    /// claimable by two workers. The transaction spans only the select and
    /// the status flip, so the soft lock replaces any long-lived row lock.
    pub async fn claim(
        &self,
        batch: i64,
        min_priority: i32,
        max_priority: Option<i32>,
    ) -> Result<Vec<ClaimedEvent>> {
        let mut tx = self.pool.begin().await?;

        let select = r#"
            SELECT id, payload, attempts, created_at
            FROM outbox_events
            WHERE status = 'pending'
              AND event_type = $1
              AND priority >= $2
              AND ($3::int IS NULL OR priority < $3)
              AND (next_run_at IS NULL OR next_run_at <= now())
            ORDER BY priority DESC, created_at ASC
            LIMIT $4
            FOR UPDATE SKIP LOCKED
        "#;

        let rows = sqlx::query(select)
            .bind(SMS_SEND_EVENT)
            .bind(min_priority)
            .bind(max_priority)
            .bind(batch)
            .fetch_all(&mut *tx)
            .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let claimed: Vec<ClaimedEvent> = rows
            .into_iter()
            .map(|row| ClaimedEvent {
                id: row.get("id"),
                payload: row.get("payload"),
                attempts: row.get("attempts"),
                created_at: row.get("created_at"),
            })
            .collect();

        let ids: Vec<i64> = claimed.iter().map(|c| c.id).collect();
        let update = Query::update()
            .table(OutboxEvents::Table)
            .value(OutboxEvents::Status, OutboxStatus::Processing.as_str())
            .value(OutboxEvents::UpdatedAt, Expr::current_timestamp())
            .and_where(Expr::col(OutboxEvents::Id).is_in(ids))
            .to_string(PostgresQueryBuilder);

        sqlx::query(&update).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(claimed)
    }

    /// Finalize a successfully published row.
    pub async fn mark_processed(&self, id: i64) -> Result<()> {
        let update = Query::update()
            .table(OutboxEvents::Table)
            .value(OutboxEvents::Status, OutboxStatus::Processed.as_str())
            .value(OutboxEvents::LastError, Option::<String>::None)
            .value(OutboxEvents::UpdatedAt, Expr::current_timestamp())
            .and_where(Expr::col(OutboxEvents::Id).eq(id))
            .to_string(PostgresQueryBuilder);

        sqlx::query(&update).execute(&self.pool).await?;
        Ok(())
    }

    /// Put a failed row back into `pending` with an updated attempt count
    /// and a wake-up time.
    pub async fn reschedule(
        &self,
        id: i64,
        attempts: i32,
        next_run_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        let update = Query::update()
            .table(OutboxEvents::Table)
            .value(OutboxEvents::Status, OutboxStatus::Pending.as_str())
            .value(OutboxEvents::Attempts, attempts)
            .value(OutboxEvents::NextRunAt, next_run_at)
            .value(OutboxEvents::LastError, last_error)
            .value(OutboxEvents::UpdatedAt, Expr::current_timestamp())
            .and_where(Expr::col(OutboxEvents::Id).eq(id))
            .to_string(PostgresQueryBuilder);

        sqlx::query(&update).execute(&self.pool).await?;
        Ok(())
    }

    /// Fail a row terminally; it will never be claimed again.
    pub async fn mark_failed(&self, id: i64, attempts: i32, last_error: &str) -> Result<()> {
        let update = Query::update()
            .table(OutboxEvents::Table)
            .value(OutboxEvents::Status, OutboxStatus::Failed.as_str())
            .value(OutboxEvents::Attempts, attempts)
            .value(OutboxEvents::LastError, last_error)
            .value(OutboxEvents::UpdatedAt, Expr::current_timestamp())
            .and_where(Expr::col(OutboxEvents::Id).eq(id))
            .to_string(PostgresQueryBuilder);

        sqlx::query(&update).execute(&self.pool).await?;
        Ok(())
    }

    /// Return `processing` rows whose lease has expired to `pending`.
    ///
    /// A worker that crashes between claiming and finalizing leaves its
    /// batch in `processing`; this is the only path that frees such rows.
    /// Terminal rows are never touched.
    pub async fn reap_stale(&self, lease: std::time::Duration) -> Result<u64> {
        let cutoff = format!("now() - INTERVAL '{} seconds'", lease.as_secs());
        let update = Query::update()
            .table(OutboxEvents::Table)
            .value(OutboxEvents::Status, OutboxStatus::Pending.as_str())
            .value(OutboxEvents::UpdatedAt, Expr::current_timestamp())
            .and_where(Expr::col(OutboxEvents::Status).eq(OutboxStatus::Processing.as_str()))
            .and_where(Expr::col(OutboxEvents::UpdatedAt).lt(Expr::cust(&cutoff)))
            .to_string(PostgresQueryBuilder);

        let result = sqlx::query(&update).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

/// Publish retry delay: exponential in the attempt count, capped at 64s.
pub fn publish_backoff(attempts: i32) -> chrono::Duration {
    let exp = attempts.clamp(0, 6);
    chrono::Duration::seconds(1i64 << exp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SmsType;

    #[test]
    fn test_publish_backoff_schedule() {
        assert_eq!(publish_backoff(1).num_seconds(), 2);
        assert_eq!(publish_backoff(2).num_seconds(), 4);
        assert_eq!(publish_backoff(5).num_seconds(), 32);
        assert_eq!(publish_backoff(6).num_seconds(), 64);
        // Capped from attempt 6 onward.
        assert_eq!(publish_backoff(7).num_seconds(), 64);
        assert_eq!(publish_backoff(10).num_seconds(), 64);
    }

    #[test]
    fn test_sms_send_event_priority() {
        let mut sms = Sms {
            customer_id: 1,
            recipients: vec!["+1".to_string()],
            sms_identifier: "id-1".to_string(),
            ..Default::default()
        };
        let payload = SmsSendPayload {
            exchange: "sms_exchange".to_string(),
            routing_key: "sms_normal".to_string(),
            sms: sms.clone(),
            transaction_id: "tx-1".to_string(),
        };

        let event = OutboxEvent::sms_send(&sms, &payload).expect("build event");
        assert_eq!(event.priority, 0);
        assert_eq!(event.event_type, SMS_SEND_EVENT);
        assert_eq!(event.aggregate_id, "id-1");

        sms.kind = SmsType::Express;
        let event = OutboxEvent::sms_send(&sms, &payload).expect("build event");
        assert_eq!(event.priority, 10);
    }

    #[test]
    fn test_sms_send_payload_roundtrip() {
        let payload = SmsSendPayload {
            exchange: "sms_exchange".to_string(),
            routing_key: "sms_express".to_string(),
            sms: Sms {
                customer_id: 9,
                text: "hello".to_string(),
                recipients: vec!["+1".to_string(), "+2".to_string()],
                kind: SmsType::Express,
                sms_identifier: "sid".to_string(),
                transaction_id: "tid".to_string(),
            },
            transaction_id: "tid".to_string(),
        };

        let value = serde_json::to_value(&payload).expect("encode payload");
        assert_eq!(value["routing_key"], "sms_express");
        assert_eq!(value["sms"]["type"], "express");

        let decoded: SmsSendPayload = serde_json::from_value(value).expect("decode payload");
        assert_eq!(decoded.sms.customer_id, 9);
        assert_eq!(decoded.transaction_id, "tid");
    }
}

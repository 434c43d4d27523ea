//! Per-recipient delivery state.
//!
//! Owns the `sms_status` table: one row per `(sms_identifier, recipient)`
//! moving through `pending -> sending -> done | failed`. Rows are inserted
//! as `pending` inside the ingress transaction and advanced by the queue
//! consumer. Re-inserting an existing key is a no-op, and status updates
//! are idempotent for a given terminal state, which is what makes duplicate
//! bus deliveries safe for customer-visible state.

use chrono::{DateTime, Utc};
use sea_query::{
    ColumnDef, Expr, Iden, Index, OnConflict, Order, PostgresQueryBuilder, Query, Table,
};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Row, Transaction as PgTransaction};
use tracing::info;

use crate::model::Sms;

/// Result type for delivery store operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors that can occur during delivery store operations.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("sms has no recipients")]
    NoRecipients,

    #[error("sms_identifier is required")]
    MissingIdentifier,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Delivery state machine for one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Sending,
    Done,
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Sending => "sending",
            DeliveryState::Done => "done",
            DeliveryState::Failed => "failed",
        }
    }
}

/// One delivery row as returned by history queries.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRow {
    pub user_id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub recipient: String,
    pub provider: String,
    pub sms_identifier: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Schema
// ============================================================================

#[derive(Iden)]
enum SmsStatus {
    Table,
    #[iden = "user_id"]
    UserId,
    #[iden = "type"]
    Type,
    #[iden = "status"]
    Status,
    #[iden = "recipient"]
    Recipient,
    #[iden = "provider"]
    Provider,
    #[iden = "sms_identifier"]
    SmsIdentifier,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

// ============================================================================
// Store
// ============================================================================

/// Per-recipient delivery row store.
#[derive(Clone)]
pub struct DeliveryStore {
    pool: PgPool,
}

impl DeliveryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize the delivery table schema.
    pub async fn init(&self) -> std::result::Result<(), sqlx::Error> {
        let create_table = Table::create()
            .table(SmsStatus::Table)
            .if_not_exists()
            .col(ColumnDef::new(SmsStatus::UserId).big_integer().not_null())
            .col(ColumnDef::new(SmsStatus::Type).text().not_null())
            .col(ColumnDef::new(SmsStatus::Status).text().not_null())
            .col(ColumnDef::new(SmsStatus::Recipient).text().not_null())
            .col(
                ColumnDef::new(SmsStatus::Provider)
                    .text()
                    .not_null()
                    .default(""),
            )
            .col(ColumnDef::new(SmsStatus::SmsIdentifier).text().not_null())
            .col(
                ColumnDef::new(SmsStatus::CreatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .col(
                ColumnDef::new(SmsStatus::UpdatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .to_string(PostgresQueryBuilder);

        sqlx::query(&create_table).execute(&self.pool).await?;

        let create_index = Index::create()
            .if_not_exists()
            .name("uq_sms_status_identifier_recipient")
            .table(SmsStatus::Table)
            .col(SmsStatus::SmsIdentifier)
            .col(SmsStatus::Recipient)
            .unique()
            .to_string(PostgresQueryBuilder);

        sqlx::query(&create_index).execute(&self.pool).await?;

        let create_user_index = Index::create()
            .if_not_exists()
            .name("idx_sms_status_user_created")
            .table(SmsStatus::Table)
            .col(SmsStatus::UserId)
            .col(SmsStatus::CreatedAt)
            .to_string(PostgresQueryBuilder);

        sqlx::query(&create_user_index).execute(&self.pool).await?;

        info!("delivery table initialized");
        Ok(())
    }

    /// Insert a `pending` row for each recipient inside the caller's
    /// transaction. One batch statement; conflicts on the
    /// `(sms_identifier, recipient)` key leave the existing row unchanged.
    pub async fn insert_pending_tx(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        sms: &Sms,
    ) -> Result<()> {
        if sms.recipients.is_empty() {
            return Err(DeliveryError::NoRecipients);
        }
        if sms.sms_identifier.is_empty() {
            return Err(DeliveryError::MissingIdentifier);
        }

        let sql = {
            let mut insert = Query::insert();
            insert.into_table(SmsStatus::Table).columns([
                SmsStatus::UserId,
                SmsStatus::Type,
                SmsStatus::Status,
                SmsStatus::Recipient,
                SmsStatus::Provider,
                SmsStatus::SmsIdentifier,
            ]);
            for recipient in &sms.recipients {
                insert.values_panic([
                    sms.customer_id.into(),
                    sms.kind.as_str().into(),
                    DeliveryState::Pending.as_str().into(),
                    recipient.as_str().into(),
                    "".into(),
                    sms.sms_identifier.as_str().into(),
                ]);
            }
            insert.on_conflict(
                OnConflict::columns([SmsStatus::SmsIdentifier, SmsStatus::Recipient])
                    .do_nothing()
                    .to_owned(),
            );

            insert.to_string(PostgresQueryBuilder)
        };
        sqlx::query(&sql).execute(&mut **tx).await?;

        Ok(())
    }

    /// Advance all of a message's recipient rows to `state` in one batch
    /// update. Used by the consumer for pending -> sending -> done/failed.
    /// Runs on its own connection; no surrounding transaction required.
    pub async fn update_status(
        &self,
        sms: &Sms,
        state: DeliveryState,
        provider: Option<&str>,
    ) -> Result<()> {
        if sms.recipients.is_empty() {
            return Err(DeliveryError::NoRecipients);
        }
        if sms.sms_identifier.is_empty() {
            return Err(DeliveryError::MissingIdentifier);
        }

        let update = Query::update()
            .table(SmsStatus::Table)
            .value(SmsStatus::Status, state.as_str())
            .value(SmsStatus::Provider, provider.unwrap_or(""))
            .value(SmsStatus::UpdatedAt, Expr::current_timestamp())
            .and_where(Expr::col(SmsStatus::SmsIdentifier).eq(sms.sms_identifier.as_str()))
            .and_where(
                Expr::col(SmsStatus::Recipient)
                    .is_in(sms.recipients.iter().map(String::as_str)),
            )
            .to_string(PostgresQueryBuilder);

        sqlx::query(&update).execute(&self.pool).await?;

        Ok(())
    }

    /// Delivery history for a customer, newest first, optionally filtered
    /// by status and message identifier.
    pub async fn history(
        &self,
        customer_id: i64,
        status: Option<&str>,
        sms_identifier: Option<&str>,
    ) -> Result<Vec<DeliveryRow>> {
        let sql = {
            let mut select = Query::select();
            select
                .columns([
                    SmsStatus::UserId,
                    SmsStatus::Type,
                    SmsStatus::Status,
                    SmsStatus::Recipient,
                    SmsStatus::Provider,
                    SmsStatus::SmsIdentifier,
                    SmsStatus::CreatedAt,
                    SmsStatus::UpdatedAt,
                ])
                .from(SmsStatus::Table)
                .and_where(Expr::col(SmsStatus::UserId).eq(customer_id));

            if let Some(status) = status {
                select.and_where(Expr::col(SmsStatus::Status).eq(status));
            }
            if let Some(sms_identifier) = sms_identifier {
                select.and_where(Expr::col(SmsStatus::SmsIdentifier).eq(sms_identifier));
            }
            select.order_by(SmsStatus::CreatedAt, Order::Desc);

            select.to_string(PostgresQueryBuilder)
        };
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| DeliveryRow {
                user_id: row.get("user_id"),
                kind: row.get("type"),
                status: row.get("status"),
                recipient: row.get("recipient"),
                provider: row.get("provider"),
                sms_identifier: row.get("sms_identifier"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_state_names() {
        assert_eq!(DeliveryState::Pending.as_str(), "pending");
        assert_eq!(DeliveryState::Sending.as_str(), "sending");
        assert_eq!(DeliveryState::Done.as_str(), "done");
        assert_eq!(DeliveryState::Failed.as_str(), "failed");
    }

    #[test]
    fn test_delivery_row_serializes_type_field() {
        let row = DeliveryRow {
            user_id: 1,
            kind: "normal".to_string(),
            status: "done".to_string(),
            recipient: "+1".to_string(),
            provider: "operatorA".to_string(),
            sms_identifier: "abc".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let value = serde_json::to_value(&row).expect("serialize row");
        assert_eq!(value["type"], "normal");
        assert_eq!(value["provider"], "operatorA");
    }
}

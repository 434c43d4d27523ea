//! Prepaid balance ledger.
//!
//! Owns the `user_balances` and `user_transactions` tables. Every balance
//! movement is recorded as an append-only transaction row: `withdrawal` for
//! charges, `deposit` for top-ups, `corrective` for refunds. The invariant
//! maintained here is that a customer's balance always equals the sum of
//! their transaction amounts.
//!
//! Charging uses a single conditional update (`balance = balance - price
//! WHERE balance >= price`) so the check and the deduction cannot race
//! without holding row locks across a round-trip.

use sea_query::{
    ColumnDef, Expr, Iden, OnConflict, Order, PostgresQueryBuilder, Query, Table,
};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Row, Transaction as PgTransaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::SmsType;

/// Attempts for the deposit path when the database reports a transient
/// conflict (deadlock, lock wait).
const DEPOSIT_MAX_ATTEMPTS: u32 = 6;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur during ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("transaction not found")]
    TransactionNotFound,

    #[error("refund requires {0}")]
    InvalidRefund(&'static str),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Ledger entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Withdrawal,
    Deposit,
    Corrective,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::Deposit => "deposit",
            TransactionKind::Corrective => "corrective",
        }
    }
}

/// A single append-only ledger entry.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerTransaction {
    #[serde(skip_serializing)]
    pub user_id: i64,
    pub amount: i64,
    pub transaction_type: String,
    pub description: String,
    pub transaction_id: String,
}

// ============================================================================
// Schema
// ============================================================================

#[derive(Iden)]
enum UserBalances {
    Table,
    #[iden = "user_id"]
    UserId,
    #[iden = "balance"]
    Balance,
    #[iden = "last_updated"]
    LastUpdated,
}

#[derive(Iden)]
enum UserTransactions {
    Table,
    #[iden = "transaction_id"]
    TransactionId,
    #[iden = "user_id"]
    UserId,
    #[iden = "amount"]
    Amount,
    #[iden = "transaction_type"]
    TransactionType,
    #[iden = "description"]
    Description,
    #[iden = "created_at"]
    CreatedAt,
}

// ============================================================================
// Store
// ============================================================================

/// Balance and transaction store.
#[derive(Clone)]
pub struct Ledger {
    pool: PgPool,
}

impl Ledger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize the ledger table schemas.
    pub async fn init(&self) -> std::result::Result<(), sqlx::Error> {
        let create_balances = Table::create()
            .table(UserBalances::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(UserBalances::UserId)
                    .big_integer()
                    .primary_key(),
            )
            .col(
                ColumnDef::new(UserBalances::Balance)
                    .big_integer()
                    .not_null()
                    .default(0),
            )
            .col(
                ColumnDef::new(UserBalances::LastUpdated)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .to_string(PostgresQueryBuilder);

        sqlx::query(&create_balances).execute(&self.pool).await?;

        let create_transactions = Table::create()
            .table(UserTransactions::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(UserTransactions::TransactionId)
                    .text()
                    .primary_key(),
            )
            .col(
                ColumnDef::new(UserTransactions::UserId)
                    .big_integer()
                    .not_null(),
            )
            .col(
                ColumnDef::new(UserTransactions::Amount)
                    .big_integer()
                    .not_null(),
            )
            .col(
                ColumnDef::new(UserTransactions::TransactionType)
                    .text()
                    .not_null(),
            )
            .col(
                ColumnDef::new(UserTransactions::Description)
                    .text()
                    .not_null()
                    .default(""),
            )
            .col(
                ColumnDef::new(UserTransactions::CreatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .to_string(PostgresQueryBuilder);

        sqlx::query(&create_transactions)
            .execute(&self.pool)
            .await?;

        info!("ledger tables initialized");
        Ok(())
    }

    /// Atomically deduct the price of a send from a customer's balance and
    /// record the withdrawal, inside the caller's transaction.
    ///
    /// The conditional update matches zero rows when the balance row is
    /// missing or too low; either way the charge is refused without any
    /// prior read.
    pub async fn charge_tx(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        customer_id: i64,
        quantity: i64,
        kind: SmsType,
    ) -> Result<String> {
        let price = price_of(kind, quantity);

        let debit = Query::update()
            .table(UserBalances::Table)
            .value(
                UserBalances::Balance,
                Expr::col(UserBalances::Balance).sub(price),
            )
            .value(UserBalances::LastUpdated, Expr::current_timestamp())
            .and_where(Expr::col(UserBalances::UserId).eq(customer_id))
            .and_where(Expr::col(UserBalances::Balance).gte(price))
            .to_string(PostgresQueryBuilder);

        let result = sqlx::query(&debit).execute(&mut **tx).await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::InsufficientBalance);
        }

        let transaction_id = Uuid::new_v4().to_string();
        let insert = Query::insert()
            .into_table(UserTransactions::Table)
            .columns([
                UserTransactions::TransactionId,
                UserTransactions::UserId,
                UserTransactions::Amount,
                UserTransactions::TransactionType,
                UserTransactions::Description,
            ])
            .values_panic([
                transaction_id.as_str().into(),
                customer_id.into(),
                (-price).into(),
                TransactionKind::Withdrawal.as_str().into(),
                format!("charge for {} {} sms", quantity, kind.as_str()).into(),
            ])
            .to_string(PostgresQueryBuilder);

        sqlx::query(&insert).execute(&mut **tx).await?;

        Ok(transaction_id)
    }

    /// Compensate a withdrawal: restore the charged amount and record a
    /// corrective entry referencing the original transaction.
    ///
    /// Runs in its own transaction. Not idempotent; callers invoke this
    /// at most once per terminal failure.
    pub async fn refund(&self, customer_id: i64, transaction_id: &str) -> Result<()> {
        if transaction_id.is_empty() {
            return Err(LedgerError::InvalidRefund("transaction_id"));
        }
        if customer_id == 0 {
            return Err(LedgerError::InvalidRefund("customer_id"));
        }

        let mut tx = self.pool.begin().await?;

        let select = Query::select()
            .column(UserTransactions::Amount)
            .from(UserTransactions::Table)
            .and_where(Expr::col(UserTransactions::TransactionId).eq(transaction_id))
            .and_where(Expr::col(UserTransactions::UserId).eq(customer_id))
            .limit(1)
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&select).fetch_optional(&mut *tx).await?;
        let amount: i64 = match row {
            Some(row) => row.get("amount"),
            None => return Err(LedgerError::TransactionNotFound),
        };

        let refund_amount = -amount;
        let credit = Query::update()
            .table(UserBalances::Table)
            .value(
                UserBalances::Balance,
                Expr::col(UserBalances::Balance).add(refund_amount),
            )
            .value(UserBalances::LastUpdated, Expr::current_timestamp())
            .and_where(Expr::col(UserBalances::UserId).eq(customer_id))
            .to_string(PostgresQueryBuilder);

        sqlx::query(&credit).execute(&mut *tx).await?;

        let insert = Query::insert()
            .into_table(UserTransactions::Table)
            .columns([
                UserTransactions::TransactionId,
                UserTransactions::UserId,
                UserTransactions::Amount,
                UserTransactions::TransactionType,
                UserTransactions::Description,
            ])
            .values_panic([
                Uuid::new_v4().to_string().into(),
                customer_id.into(),
                refund_amount.into(),
                TransactionKind::Corrective.as_str().into(),
                format!("corrective transaction for {}", transaction_id).into(),
            ])
            .to_string(PostgresQueryBuilder);

        sqlx::query(&insert).execute(&mut *tx).await?;

        tx.commit().await?;

        info!(
            customer_id = customer_id,
            transaction_id = %transaction_id,
            amount = refund_amount,
            "refunded withdrawal"
        );
        Ok(())
    }

    /// Add to a customer's balance, creating the balance row on first use.
    ///
    /// The upsert is a single statement so concurrent deposits cannot
    /// deadlock between a read and a write; residual conflicts (common when
    /// many deposits hit one row) are retried with exponential backoff.
    pub async fn deposit(&self, customer_id: i64, amount: u64, description: &str) -> Result<()> {
        let description = if description.is_empty() {
            format!("balance deposit of {}", amount)
        } else {
            description.to_string()
        };

        let mut attempt = 0;
        loop {
            match self.try_deposit(customer_id, amount, &description).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < DEPOSIT_MAX_ATTEMPTS && is_retryable(&e) => {
                    attempt += 1;
                    warn!(
                        customer_id = customer_id,
                        attempt = attempt,
                        error = %e,
                        "deposit hit transient database error, retrying"
                    );
                    let delay = std::time::Duration::from_millis(30 * (1u64 << attempt));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(LedgerError::Database(e)),
            }
        }
    }

    async fn try_deposit(
        &self,
        customer_id: i64,
        amount: u64,
        description: &str,
    ) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let upsert = Query::insert()
            .into_table(UserBalances::Table)
            .columns([UserBalances::UserId, UserBalances::Balance])
            .values_panic([customer_id.into(), (amount as i64).into()])
            .on_conflict(
                OnConflict::column(UserBalances::UserId)
                    .value(
                        UserBalances::Balance,
                        Expr::col(UserBalances::Balance).add(amount as i64),
                    )
                    .value(UserBalances::LastUpdated, Expr::current_timestamp())
                    .to_owned(),
            )
            .to_string(PostgresQueryBuilder);

        sqlx::query(&upsert).execute(&mut *tx).await?;

        let insert = Query::insert()
            .into_table(UserTransactions::Table)
            .columns([
                UserTransactions::TransactionId,
                UserTransactions::UserId,
                UserTransactions::Amount,
                UserTransactions::TransactionType,
                UserTransactions::Description,
            ])
            .values_panic([
                Uuid::new_v4().to_string().into(),
                customer_id.into(),
                (amount as i64).into(),
                TransactionKind::Deposit.as_str().into(),
                description.into(),
            ])
            .to_string(PostgresQueryBuilder);

        sqlx::query(&insert).execute(&mut *tx).await?;

        tx.commit().await
    }

    /// Advisory pre-check; never authoritative, the conditional debit is.
    pub async fn has_balance(&self, customer_id: i64, quantity: i64, kind: SmsType) -> Result<bool> {
        let balance = self.balance(customer_id).await?;
        Ok(balance >= price_of(kind, quantity))
    }

    /// Current balance; zero when the customer has no balance row.
    pub async fn balance(&self, customer_id: i64) -> Result<i64> {
        let select = Query::select()
            .column(UserBalances::Balance)
            .from(UserBalances::Table)
            .and_where(Expr::col(UserBalances::UserId).eq(customer_id))
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&select).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| r.get("balance")).unwrap_or(0))
    }

    /// All transactions for a customer.
    pub async fn transactions(&self, customer_id: i64) -> Result<Vec<LedgerTransaction>> {
        let select = Query::select()
            .columns([
                UserTransactions::UserId,
                UserTransactions::Amount,
                UserTransactions::TransactionType,
                UserTransactions::Description,
                UserTransactions::TransactionId,
            ])
            .from(UserTransactions::Table)
            .and_where(Expr::col(UserTransactions::UserId).eq(customer_id))
            .order_by(UserTransactions::CreatedAt, Order::Desc)
            .to_string(PostgresQueryBuilder);

        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| LedgerTransaction {
                user_id: row.get("user_id"),
                amount: row.get("amount"),
                transaction_type: row.get("transaction_type"),
                description: row.get("description"),
                transaction_id: row.get("transaction_id"),
            })
            .collect())
    }
}

/// Total price of a send: per-recipient rate times recipient count.
pub fn price_of(kind: SmsType, quantity: i64) -> i64 {
    kind.price() * quantity
}

/// Transient conflicts worth retrying: serialization failure, deadlock,
/// lock not available.
fn is_retryable(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| is_retryable_code(&code))
}

fn is_retryable_code(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "55P03")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_of() {
        assert_eq!(price_of(SmsType::Normal, 1), 1);
        assert_eq!(price_of(SmsType::Normal, 5), 5);
        assert_eq!(price_of(SmsType::Express, 1), 3);
        assert_eq!(price_of(SmsType::Express, 4), 12);
    }

    #[test]
    fn test_retryable_codes() {
        assert!(is_retryable_code("40001"));
        assert!(is_retryable_code("40P01"));
        assert!(is_retryable_code("55P03"));
        assert!(!is_retryable_code("23505"));
        assert!(!is_retryable_code("42601"));
    }

    #[test]
    fn test_transaction_kind_names() {
        assert_eq!(TransactionKind::Withdrawal.as_str(), "withdrawal");
        assert_eq!(TransactionKind::Deposit.as_str(), "deposit");
        assert_eq!(TransactionKind::Corrective.as_str(), "corrective");
    }
}

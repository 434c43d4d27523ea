//! Charge-and-enqueue ingress transaction.
//!
//! One database transaction binds the three durable effects of accepting a
//! send request: the balance debit, the per-recipient `pending` rows, and
//! the outbox event that will carry the message to the bus. Either all
//! three commit or none do, which is what turns at-least-once publication
//! into end-to-end exactly-once intent: the bus never sees an event the
//! customer was not charged for, and the customer is never charged for an
//! event that was not durably enqueued.

use tracing::info;
use uuid::Uuid;

use crate::app::App;
use crate::delivery::DeliveryError;
use crate::ledger::LedgerError;
use crate::model::Sms;
use crate::outbox::{OutboxError, OutboxEvent, SmsSendPayload};

/// Errors surfaced by the ingress transaction.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("zero recipients")]
    NoRecipients,

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("ledger error: {0}")]
    Ledger(LedgerError),

    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<LedgerError> for IngressError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance => IngressError::InsufficientBalance,
            other => IngressError::Ledger(other),
        }
    }
}

/// Accept a send request: charge, insert pending rows, enqueue the outbox
/// event, all in one transaction. Returns the assigned `sms_identifier`.
///
/// On any failure the transaction rolls back and no durable side effect
/// remains.
pub async fn enqueue(app: &App, mut sms: Sms) -> Result<String, IngressError> {
    if sms.recipients.is_empty() {
        return Err(IngressError::NoRecipients);
    }

    sms.sms_identifier = Uuid::new_v4().to_string();

    let mut tx = app.pool.begin().await?;

    let transaction_id = app
        .ledger
        .charge_tx(&mut tx, sms.customer_id, sms.recipients.len() as i64, sms.kind)
        .await?;
    sms.transaction_id = transaction_id.clone();

    app.delivery.insert_pending_tx(&mut tx, &sms).await?;

    let payload = SmsSendPayload {
        exchange: app.config.messaging.exchange.clone(),
        routing_key: app.config.messaging.queue_for(sms.kind).to_string(),
        sms: sms.clone(),
        transaction_id,
    };
    let event = OutboxEvent::sms_send(&sms, &payload)?;
    app.outbox.insert_tx(&mut tx, &event).await?;

    tx.commit().await?;

    info!(
        customer_id = sms.customer_id,
        sms_identifier = %sms.sms_identifier,
        kind = %sms.kind,
        recipients = sms.recipients.len(),
        "sms accepted for processing"
    );

    Ok(sms.sms_identifier)
}

//! SMS delivery handler.
//!
//! Runs inside the queue consumer workers: decode the message, mark the
//! recipients `sending`, dispatch through the operators, then record the
//! terminal state. A terminal operator failure is compensated by refunding
//! the withdrawal that paid for the message.
//!
//! Undecodable messages are logged and dropped; the worker acknowledges
//! every delivery, so a poison pill cannot wedge the queue.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::bus::consumer::DeliveryHandler;
use crate::delivery::{DeliveryState, DeliveryStore};
use crate::ledger::Ledger;
use crate::model::Sms;
use crate::operators::Dispatcher;

/// Per-delivery processing pipeline shared by both queue consumers.
pub struct SmsHandler {
    delivery: DeliveryStore,
    ledger: Ledger,
    dispatcher: Arc<Dispatcher>,
}

impl SmsHandler {
    pub fn new(delivery: DeliveryStore, ledger: Ledger, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            delivery,
            ledger,
            dispatcher,
        }
    }

    async fn process(&self, sms: Sms) {
        if let Err(e) = self
            .delivery
            .update_status(&sms, DeliveryState::Sending, None)
            .await
        {
            error!(
                sms_identifier = %sms.sms_identifier,
                error = %e,
                "failed to mark delivery sending"
            );
            return;
        }

        match self.dispatcher.send(&sms).await {
            Ok(provider) => {
                if let Err(e) = self
                    .delivery
                    .update_status(&sms, DeliveryState::Done, Some(&provider))
                    .await
                {
                    error!(
                        sms_identifier = %sms.sms_identifier,
                        error = %e,
                        "failed to mark delivery done"
                    );
                    return;
                }

                info!(
                    customer_id = sms.customer_id,
                    kind = %sms.kind,
                    provider = %provider,
                    "sms processed successfully"
                );
            }
            Err(e) => {
                error!(
                    sms_identifier = %sms.sms_identifier,
                    error = %e,
                    "all operators failed"
                );

                if let Err(e) = self
                    .delivery
                    .update_status(&sms, DeliveryState::Failed, None)
                    .await
                {
                    error!(
                        sms_identifier = %sms.sms_identifier,
                        error = %e,
                        "failed to mark delivery failed"
                    );
                }

                if let Err(e) = self.ledger.refund(sms.customer_id, &sms.transaction_id).await {
                    error!(
                        customer_id = sms.customer_id,
                        transaction_id = %sms.transaction_id,
                        error = %e,
                        "refund after operator failure failed"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for SmsHandler {
    async fn handle(
        &self,
        body: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let sms: Sms = serde_json::from_slice(body).map_err(|e| {
            error!(error = %e, "cannot decode sms message, dropping");
            Box::new(e) as Box<dyn std::error::Error + Send + Sync>
        })?;

        info!(
            customer_id = sms.customer_id,
            sms_identifier = %sms.sms_identifier,
            "got message"
        );

        self.process(sms).await;
        Ok(())
    }
}

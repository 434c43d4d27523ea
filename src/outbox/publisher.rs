//! Priority-partitioned outbox publisher.
//!
//! Two worker pools poll the outbox table: a high pool for express rows
//! (`priority >= 5`) and a low pool for normal rows. The pools never
//! share a priority window, so a flood of one traffic class cannot starve
//! the other. Each worker repeats claim -> publish -> finalize; a claimed
//! row is `processing` and invisible to every other claimer.
//!
//! Failures reschedule the row with exponential backoff. Once the attempt
//! limit is reached the row is failed terminally and the customer's charge
//! is refunded best-effort from the payload.
//!
//! A reaper task returns `processing` rows whose lease expired (a worker
//! crashed mid-flight) to `pending`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::AmqpBus;
use crate::config::PublisherConfig;
use crate::ledger::Ledger;

use super::{publish_backoff, ClaimedEvent, Outbox, Result, SmsSendPayload};

/// Lowest priority the high pool claims; the low pool claims below it.
const HIGH_PRIORITY_MIN: i32 = 5;

/// Handle to a running publisher; dropping it does not stop the workers.
pub struct PublisherHandle {
    cancel: watch::Sender<bool>,
}

impl PublisherHandle {
    /// Signal all workers and the reaper to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Outbox publisher: claims pending rows and pushes them to the bus.
pub struct OutboxPublisher {
    outbox: Outbox,
    bus: Arc<AmqpBus>,
    ledger: Ledger,
    config: PublisherConfig,
}

impl OutboxPublisher {
    pub fn new(outbox: Outbox, bus: Arc<AmqpBus>, ledger: Ledger, config: PublisherConfig) -> Self {
        Self {
            outbox,
            bus,
            ledger,
            config,
        }
    }

    /// Spawn both worker pools and the reaper. Returns a handle that stops
    /// them all.
    pub fn start(self: Arc<Self>) -> PublisherHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);

        for worker_id in 0..self.config.high_workers {
            let publisher = Arc::clone(&self);
            let cancel = cancel_rx.clone();
            tokio::spawn(async move {
                publisher
                    .worker_loop(
                        "high",
                        worker_id,
                        publisher.config.high_batch,
                        HIGH_PRIORITY_MIN,
                        None,
                        publisher.config.high_idle(),
                        cancel,
                    )
                    .await;
            });
        }

        for worker_id in 0..self.config.low_workers {
            let publisher = Arc::clone(&self);
            let cancel = cancel_rx.clone();
            tokio::spawn(async move {
                publisher
                    .worker_loop(
                        "low",
                        worker_id,
                        publisher.config.low_batch,
                        0,
                        Some(HIGH_PRIORITY_MIN),
                        publisher.config.low_idle(),
                        cancel,
                    )
                    .await;
            });
        }

        {
            let publisher = Arc::clone(&self);
            let cancel = cancel_rx;
            tokio::spawn(async move {
                publisher.reaper_loop(cancel).await;
            });
        }

        info!(
            high_workers = self.config.high_workers,
            low_workers = self.config.low_workers,
            "outbox publisher started"
        );

        PublisherHandle { cancel: cancel_tx }
    }

    /// One worker: claim a batch in this pool's priority window, publish
    /// each row, sleep briefly when idle. Bails out promptly on shutdown.
    #[allow(clippy::too_many_arguments)]
    async fn worker_loop(
        &self,
        pool: &'static str,
        worker_id: usize,
        batch: i64,
        min_priority: i32,
        max_priority: Option<i32>,
        idle: Duration,
        mut cancel: watch::Receiver<bool>,
    ) {
        loop {
            if *cancel.borrow() {
                break;
            }

            let rows = match self.outbox.claim(batch, min_priority, max_priority).await {
                Ok(rows) => rows,
                Err(e) => {
                    error!(
                        pool = pool,
                        worker_id = worker_id,
                        error = %e,
                        "outbox claim failed"
                    );
                    if Self::idle_or_cancelled(idle, &mut cancel).await {
                        break;
                    }
                    continue;
                }
            };

            if rows.is_empty() {
                if Self::idle_or_cancelled(idle, &mut cancel).await {
                    break;
                }
                continue;
            }

            for row in rows {
                let id = row.id;
                if let Err(e) = self.publish_one(row).await {
                    error!(
                        pool = pool,
                        worker_id = worker_id,
                        id = id,
                        error = %e,
                        "outbox publish failed"
                    );
                }
            }
        }

        info!(pool = pool, worker_id = worker_id, "outbox worker stopped");
    }

    /// Sleep for the idle interval; true when shutdown was signalled.
    /// A dropped handle counts as shutdown.
    async fn idle_or_cancelled(idle: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(idle) => false,
            changed = cancel.changed() => changed.is_err() || *cancel.borrow(),
        }
    }

    /// Publish one claimed row and finalize it.
    async fn publish_one(&self, row: ClaimedEvent) -> Result<()> {
        let payload: SmsSendPayload = match serde_json::from_value(row.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                return self
                    .fail_or_retry(row.id, row.attempts, &e.to_string(), None)
                    .await;
            }
        };

        let body = match serde_json::to_vec(&payload.sms) {
            Ok(body) => body,
            Err(e) => {
                return self
                    .fail_or_retry(row.id, row.attempts, &e.to_string(), Some(&payload))
                    .await;
            }
        };

        if let Err(e) = self
            .bus
            .publish(&payload.exchange, &payload.routing_key, &body)
            .await
        {
            return self
                .fail_or_retry(row.id, row.attempts, &e.to_string(), Some(&payload))
                .await;
        }

        self.outbox.mark_processed(row.id).await
    }

    /// Reschedule with backoff, or fail terminally and refund once the
    /// attempt limit is reached. The refund is best-effort: a missing
    /// transaction id (unparseable payload) skips it, and a refund error
    /// never blocks finalizing the row.
    async fn fail_or_retry(
        &self,
        id: i64,
        attempts: i32,
        cause: &str,
        payload: Option<&SmsSendPayload>,
    ) -> Result<()> {
        let attempts = attempts + 1;

        if attempts >= self.config.max_attempts {
            if let Some(payload) = payload {
                if !payload.transaction_id.is_empty() && payload.sms.customer_id != 0 {
                    if let Err(e) = self
                        .ledger
                        .refund(payload.sms.customer_id, &payload.transaction_id)
                        .await
                    {
                        error!(
                            id = id,
                            transaction_id = %payload.transaction_id,
                            error = %e,
                            "refund after terminal publish failure failed"
                        );
                    }
                }
            }

            warn!(
                id = id,
                attempts = attempts,
                error = %cause,
                "outbox row failed terminally"
            );
            return self.outbox.mark_failed(id, attempts, cause).await;
        }

        let next_run_at = Utc::now() + publish_backoff(attempts);
        self.outbox.reschedule(id, attempts, next_run_at, cause).await
    }

    /// Periodically free `processing` rows whose publisher died.
    async fn reaper_loop(&self, mut cancel: watch::Receiver<bool>) {
        let interval = self.config.reap_interval();
        let lease = self.config.reap_lease();
        info!(
            interval_secs = interval.as_secs(),
            lease_secs = lease.as_secs(),
            "outbox reaper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.outbox.reap_stale(lease).await {
                        Ok(0) => {}
                        Ok(reaped) => {
                            warn!(reaped = reaped, "returned stale processing rows to pending");
                        }
                        Err(e) => {
                            error!(error = %e, "outbox reap failed");
                        }
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        info!("outbox reaper stopped");
                        break;
                    }
                }
            }
        }
    }
}

//! Reconnecting queue consumer with bounded worker fan-out.
//!
//! Each queue gets one background consumer task and a fixed set of worker
//! tasks. Deliveries are handed to workers round-robin over bounded
//! channels; a worker runs the handler and then acknowledges the delivery
//! unconditionally, so a handler failure never wedges the queue (duplicate
//! consumption is tolerated by the idempotent status updates downstream).
//!
//! When the broker closes the connection or the delivery stream ends, the
//! consumer rebuilds channel, queue declaration, binding, QoS, and consumer
//! registration, with exponential backoff and jitter between attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Pool, PoolError};
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicConsumeOptions, BasicQosOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
};
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use super::{BusError, Result};

/// Capacity of each worker's hand-off channel.
const WORKER_CHANNEL_CAPACITY: usize = 20;

/// Handler invoked for every delivery body.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Process one message body. Errors are logged by the worker; the
    /// delivery is acknowledged either way.
    async fn handle(&self, body: &[u8]) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Consumer wiring for one queue.
pub struct QueueConsumer {
    pub queue: String,
    pub workers: usize,
    pub prefetch: u16,
}

impl QueueConsumer {
    /// Spawn the consumer task and its workers. Returns immediately; the
    /// tasks run until the process exits.
    pub fn spawn(self, pool: Pool, exchange: String, handler: Arc<dyn DeliveryHandler>) {
        tokio::spawn(async move {
            self.consume_with_reconnect(pool, exchange, handler).await;
        });
    }

    /// Consumer loop with automatic reconnection.
    async fn consume_with_reconnect(
        self,
        pool: Pool,
        exchange: String,
        handler: Arc<dyn DeliveryHandler>,
    ) {
        let senders = self.spawn_workers(handler);
        let mut next_worker = 0usize;

        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        let mut backoff_iter = backoff_builder.build();

        loop {
            match self.setup_consumer(&pool, &exchange).await {
                Ok(mut consumer) => {
                    info!(queue = %self.queue, "consumer connected, processing messages");
                    // Reset backoff on successful connection.
                    backoff_iter = backoff_builder.build();

                    while let Some(delivery) = consumer.next().await {
                        match delivery {
                            Ok(delivery) => {
                                let sender = &senders[next_worker % senders.len()];
                                next_worker = next_worker.wrapping_add(1);
                                if sender.send(delivery).await.is_err() {
                                    error!(queue = %self.queue, "worker channel closed");
                                }
                            }
                            Err(e) => {
                                error!(
                                    queue = %self.queue,
                                    error = %e,
                                    "consumer delivery error, will reconnect"
                                );
                                break;
                            }
                        }
                    }

                    info!(queue = %self.queue, "consumer stream ended, reconnecting");
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        queue = %self.queue,
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "failed to set up consumer, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }

    /// Spawn the worker pool; deliveries are fed round-robin.
    fn spawn_workers(&self, handler: Arc<dyn DeliveryHandler>) -> Vec<mpsc::Sender<Delivery>> {
        let mut senders = Vec::with_capacity(self.workers);

        for worker_id in 0..self.workers {
            let (sender, mut receiver) = mpsc::channel::<Delivery>(WORKER_CHANNEL_CAPACITY);
            let handler = Arc::clone(&handler);
            let queue = self.queue.clone();

            tokio::spawn(async move {
                while let Some(delivery) = receiver.recv().await {
                    if let Err(e) = handler.handle(&delivery.data).await {
                        error!(
                            queue = %queue,
                            worker_id = worker_id,
                            error = %e,
                            "delivery handler failed"
                        );
                    }

                    // Ack regardless of the handler outcome; redelivery of
                    // terminal messages is handled by idempotent updates.
                    if let Err(e) = delivery.ack(Default::default()).await {
                        error!(
                            queue = %queue,
                            worker_id = worker_id,
                            error = %e,
                            "failed to ack delivery"
                        );
                    }
                }

                info!(queue = %queue, worker_id = worker_id, "consumer worker shut down");
            });

            senders.push(sender);
        }

        senders
    }

    /// Rebuild channel, declaration, binding, QoS, and consumer.
    async fn setup_consumer(&self, pool: &Pool, exchange: &str) -> Result<lapin::Consumer> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("failed to create channel: {}", e)))?;

        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                &self.queue,
                exchange,
                &self.queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("failed to bind queue: {}", e)))?;

        if self.prefetch > 0 {
            channel
                .basic_qos(self.prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| BusError::Subscribe(format!("failed to set qos: {}", e)))?;
        }

        let consumer = channel
            .basic_consume(
                &self.queue,
                &format!("sms-gateway-{}-{}", self.queue, Uuid::new_v4()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("failed to start consumer: {}", e)))?;

        Ok(consumer)
    }
}

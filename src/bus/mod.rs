//! AMQP (RabbitMQ) message bus.
//!
//! A pooled connection shared by the outbox publisher and the consumers.
//! Publishing opens a short-lived channel per message; consuming runs in
//! a background task with automatic reconnection (see [`consumer`]).
//!
//! Topology: one durable direct exchange, one durable queue per delivery
//! class, each bound with a routing key equal to its queue name.

pub mod consumer;

use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use tracing::{debug, info};

use crate::config::MessagingConfig;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// Pooled AMQP connection.
pub struct AmqpBus {
    pool: Pool,
}

impl AmqpBus {
    /// Connect to the broker and verify the connection.
    pub async fn connect(config: &MessagingConfig) -> Result<Self> {
        let manager = Manager::new(config.uri.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| BusError::Connection(format!("failed to create pool: {}", e)))?;

        // Verify connectivity before anything depends on the pool.
        let conn = pool
            .get()
            .await
            .map_err(|e| BusError::Connection(format!("failed to connect: {}", e)))?;
        drop(conn);

        info!(uri = %config.uri, "connected to AMQP");

        Ok(Self { pool })
    }

    /// Declare the exchange and the per-class queues with their bindings.
    /// Idempotent; run once at startup.
    pub async fn setup(&self, config: &MessagingConfig) -> Result<()> {
        let channel = self.channel().await?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("failed to declare exchange: {}", e)))?;

        for queue in [&config.express_queue, &config.normal_queue] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Connection(format!("failed to declare queue: {}", e)))?;

            channel
                .queue_bind(
                    queue,
                    &config.exchange,
                    queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Connection(format!("failed to bind queue: {}", e)))?;

            info!(queue = %queue, exchange = %config.exchange, "bound queue to exchange");
        }

        Ok(())
    }

    /// Publish one persistent JSON message. Retry policy lives with the
    /// caller: the outbox publisher reschedules failed rows with backoff,
    /// so a single attempt here is enough.
    pub async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let channel = self.channel().await?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2); // persistent

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("publish confirmation failed: {}", e)))?;

        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            "published message"
        );

        Ok(())
    }

    /// Get a fresh channel from the pooled connection.
    pub(crate) async fn channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("failed to create channel: {}", e)))
    }

    /// Clone of the underlying pool for consumer tasks.
    pub(crate) fn pool(&self) -> Pool {
        self.pool.clone()
    }
}

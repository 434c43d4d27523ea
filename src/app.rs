//! Composition root.
//!
//! Owns every shared resource: database pool, bus connection, the three
//! stores, and the operator dispatcher. There is no process-wide state;
//! everything is built here and passed down by reference.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::bus::consumer::QueueConsumer;
use crate::bus::{AmqpBus, BusError};
use crate::config::Config;
use crate::consumer::SmsHandler;
use crate::delivery::DeliveryStore;
use crate::ledger::Ledger;
use crate::operators::{Dispatcher, FallbackOperator, PrimaryOperator};
use crate::outbox::publisher::{OutboxPublisher, PublisherHandle};
use crate::outbox::Outbox;

/// Errors raised while building or running the application.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Shared application state.
pub struct App {
    pub config: Config,
    pub pool: PgPool,
    pub bus: Arc<AmqpBus>,
    pub ledger: Ledger,
    pub delivery: DeliveryStore,
    pub outbox: Outbox,
    pub dispatcher: Arc<Dispatcher>,
}

impl App {
    /// Connect to the database and the bus, initialize schemas and queue
    /// topology, and wire up the components.
    pub async fn build(config: Config) -> Result<Arc<Self>, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.storage.max_connections)
            .connect(&config.storage.url)
            .await?;

        let ledger = Ledger::new(pool.clone());
        ledger.init().await?;

        let delivery = DeliveryStore::new(pool.clone());
        delivery.init().await?;

        let outbox = Outbox::new(pool.clone());
        outbox.init().await?;

        let bus = Arc::new(AmqpBus::connect(&config.messaging).await?);
        bus.setup(&config.messaging).await?;

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(PrimaryOperator),
            Arc::new(FallbackOperator),
            &config.dispatcher,
        ));

        info!("application components initialized");

        Ok(Arc::new(Self {
            config,
            pool,
            bus,
            ledger,
            delivery,
            outbox,
            dispatcher,
        }))
    }

    /// Start the outbox publisher pools and the reaper.
    pub fn start_publisher(&self) -> PublisherHandle {
        let publisher = Arc::new(OutboxPublisher::new(
            self.outbox.clone(),
            Arc::clone(&self.bus),
            self.ledger.clone(),
            self.config.publisher.clone(),
        ));
        publisher.start()
    }

    /// Start one consumer per queue, each with its worker pool.
    pub fn start_consumers(&self) {
        for queue in [
            &self.config.messaging.express_queue,
            &self.config.messaging.normal_queue,
        ] {
            let handler = Arc::new(SmsHandler::new(
                self.delivery.clone(),
                self.ledger.clone(),
                Arc::clone(&self.dispatcher),
            ));

            QueueConsumer {
                queue: queue.clone(),
                workers: self.config.consumer.workers,
                prefetch: self.config.consumer.prefetch,
            }
            .spawn(
                self.bus.pool(),
                self.config.messaging.exchange.clone(),
                handler,
            );

            info!(queue = %queue, workers = self.config.consumer.workers, "consumer started");
        }
    }
}

//! sms-gateway: HTTP API, outbox publisher, and queue consumers in one
//! process.
//!
//! ## Configuration
//! - SMSGW__STORAGE__URL: PostgreSQL connection URL (required)
//! - SMSGW__MESSAGING__URI: AMQP connection URI (required)
//! - SMSGW__SERVER__LISTEN_ADDR: HTTP bind address (default 0.0.0.0:8080)
//! - SMSGW_LOG: tracing filter (default "info")

use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sms_gateway::config::LOG_ENV_VAR;
use sms_gateway::{http, App, Config};

/// Initialize tracing with the LOG_ENV_VAR environment variable.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load().map_err(|e| {
        error!("failed to load configuration: {}", e);
        e
    })?;

    info!("starting sms-gateway");

    let app = App::build(config).await?;

    app.start_consumers();
    let publisher = app.start_publisher();

    let listen_addr = app.config.server.listen_addr.clone();
    let server_app = app.clone();
    let mut server = tokio::spawn(async move { http::serve(server_app, &listen_addr).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        result = &mut server => {
            match result {
                Ok(Err(e)) => error!(error = %e, "http server error"),
                Err(e) => error!(error = %e, "http server task failed"),
                Ok(Ok(())) => {}
            }
        }
    }

    publisher.stop();
    server.abort();

    info!("sms-gateway stopped");
    Ok(())
}

//! switchboard-gateway: HTTP entry point for action requests
//!
//! Accepts action documents over HTTP and dispatches each one to the
//! configured transport for its action.
//!
//! ## Architecture
//! ```text
//! [client] --(HTTP POST /handle)--> [switchboard-gateway] --+--(HTTP)------> auth / mail / logger
//!                                                          +--(JSON-RPC)--> logger
//!                                                          +--(gRPC)------> logger
//!                                                          +--(AMQP)------> logs_topic exchange
//! ```
//!
//! ## Configuration
//! - `--config <path>` or SWITCHBOARD_CONFIG: YAML configuration file
//! - SWITCHBOARD__<SECTION>__<KEY>: per-value overrides
//! - SWITCHBOARD_LOG: tracing filter (default: info)
//!
//! The broker connection is required at startup. If it cannot be
//! established, or is lost and cannot be re-established, the process exits
//! with an error.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use switchboard::bus::AmqpConnector;
use switchboard::config::Config;
use switchboard::handlers::gateway::{serve, GatewayState};
use switchboard::lifecycle::LifecycleManager;
use switchboard::utils::bootstrap::{init_tracing, parse_config_path, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(parse_config_path().as_deref())?;

    let manager = Arc::new(LifecycleManager::new(AmqpConnector));
    manager
        .connect(&config.messaging.target(), &config.retry)
        .await?;

    let state = GatewayState::from_config(&config, Arc::clone(&manager))?;

    let supervisor = Arc::clone(&manager);
    tokio::spawn(async move {
        let e = supervisor.supervise().await;
        error!(error = %e, "Broker connection could not be restored");
        std::process::exit(1);
    });

    let listener = TcpListener::bind(config.server.bind_addr()?).await?;
    info!(exchange = %config.messaging.exchange, "switchboard-gateway started");

    serve(listener, state, shutdown_signal()).await?;

    info!("switchboard-gateway stopped");
    Ok(())
}

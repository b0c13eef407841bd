//! switchboard-listener: log envelope consumer
//!
//! Binds the configured patterns on the topic exchange and forwards every
//! log envelope to the logger service over HTTP, one at a time.
//!
//! ## Architecture
//! ```text
//! [logs_topic exchange] --(log.INFO / log.WARNING / log.ERROR)--> [switchboard-listener]
//!                                                                        |
//!                                                                  (HTTP POST)
//!                                                                        v
//!                                                                     logger
//! ```
//!
//! ## Configuration
//! - `--config <path>` or SWITCHBOARD_CONFIG: YAML configuration file
//! - SWITCHBOARD__LISTENER__PATTERNS: comma-separated binding patterns
//! - SWITCHBOARD__LISTENER__FAILURE_POLICY: drop | requeue | dead_letter
//! - SWITCHBOARD_LOG: tracing filter (default: info)

use std::sync::Arc;

use tracing::info;

use switchboard::bus::AmqpConnector;
use switchboard::config::Config;
use switchboard::handlers::listener::{run_listener, LogForwarder};
use switchboard::lifecycle::LifecycleManager;
use switchboard::transport::{Adapter, HttpAdapter};
use switchboard::utils::bootstrap::{init_tracing, parse_config_path, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(parse_config_path().as_deref())?;

    let manager = LifecycleManager::new(AmqpConnector);
    manager
        .connect(&config.messaging.target(), &config.retry)
        .await?;

    let logger: Arc<dyn Adapter> = Arc::new(HttpAdapter::new(
        config.services.http_endpoints(),
        config.services.http_timeout(),
    )?);
    let forwarder = LogForwarder::new(logger);

    let consumer_config = config.listener.consumer_config(&config.messaging.exchange);
    info!(
        exchange = %consumer_config.exchange,
        patterns = ?config.listener.patterns,
        failure_policy = ?consumer_config.failure_policy,
        "switchboard-listener started"
    );

    run_listener(
        &manager,
        &consumer_config,
        &config.listener.patterns,
        &forwarder,
        shutdown_signal(),
    )
    .await?;

    info!("switchboard-listener stopped");
    Ok(())
}

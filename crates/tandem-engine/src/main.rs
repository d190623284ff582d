//! Tandem node binary.
//!
//! Runs one replication node around the reference key/value session until
//! interrupted.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `tandem-config.yaml` (or `TANDEM_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Start the engine (broker, snapshot restore, poll loops, monitor)
//! 4. In local mode, promote this node to leader
//! 5. Wait for Ctrl-C, take a final snapshot, stop the engine

use std::path::PathBuf;

use tandem_core::{KvSession, shared};
use tandem_engine::{ConfigError, EngineBootstrap, EngineConfig, LoggingConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Default configuration file path.
const CONFIG_PATH: &str = "tandem-config.yaml";

/// Application entry point for a Tandem node.
///
/// # Errors
///
/// Returns an error if configuration, startup, or shutdown fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config = load_config()?;

    // 2. Initialize structured logging.
    init_logging(&config.logging);
    info!(
        node_id = config.node_id,
        local = config.local,
        nats_url = config.nats_url,
        poll_timeout_ms = config.poll_timeout_millis,
        "tandem-engine starting"
    );

    // 3. Start the engine.
    let bootstrap = EngineBootstrap::new();
    let handle = bootstrap
        .start_engine(&config, shared(KvSession::new()))
        .await?;

    // 4. A single local node leads itself; clustered nodes wait for a signal.
    if config.local {
        let role = handle.leadership().promote().await?;
        info!(%role, "local node promoted");
    } else if config.leader_signal_subject.is_none() {
        warn!("no leader_signal_subject configured; role stays NONE until signalled");
    }

    // 5. Run until interrupted.
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    if let Err(e) = handle.snapshot_now().await {
        warn!(error = %e, "final snapshot failed");
    }
    bootstrap.stop_engine().await?;
    info!("tandem-engine stopped");
    Ok(())
}

/// Load the config file, falling back to defaults when it does not exist.
fn load_config() -> Result<EngineConfig, ConfigError> {
    let path = std::env::var("TANDEM_CONFIG").map_or_else(|_| PathBuf::from(CONFIG_PATH), PathBuf::from);
    if path.exists() {
        return EngineConfig::from_file(&path);
    }
    let mut config = EngineConfig::default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

//! Error types for the engine bootstrap.
//!
//! [`EngineError`] wraps every failure mode of engine startup and shutdown
//! so callers (and `main`) can propagate with `?`.

use tandem_broker::BrokerError;
use tandem_core::{ControllerError, SnapshotError, TransitionError};

use crate::config::ConfigError;

/// Top-level error for starting, stopping, and driving an engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading or validation failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// Broker connection or setup failed.
    #[error("broker error: {source}")]
    Broker {
        /// The underlying broker error.
        #[from]
        source: BrokerError,
    },

    /// Restoring the latest snapshot failed.
    #[error("snapshot error: {source}")]
    Snapshot {
        /// The underlying snapshot error.
        #[from]
        source: SnapshotError,
    },

    /// The consumer controller failed.
    #[error("controller error: {source}")]
    Controller {
        /// The underlying controller error.
        #[from]
        source: ControllerError,
    },

    /// A role transition failed.
    #[error("transition error: {source}")]
    Transition {
        /// The underlying transition error.
        #[from]
        source: TransitionError,
    },

    /// NATS messaging outside the broker (leadership subject) failed.
    #[error("NATS error: {message}")]
    Nats {
        /// Description of the NATS failure.
        message: String,
    },
}

//! Engine bootstrap for the Tandem replication core.
//!
//! Turns an [`EngineConfig`] and a session into a running node: broker,
//! producer, snapshot coordinator, consumer controller, and leadership
//! monitor, wired together and owned by an [`EngineBootstrap`].
//!
//! # Modules
//!
//! - [`bootstrap`] -- Start/stop lifecycle and the [`EngineHandle`]
//! - [`config`] -- YAML configuration with environment overrides
//! - [`leader_signal`] -- Leadership announcements over a NATS subject
//! - [`error`] -- [`EngineError`]

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod leader_signal;

pub use bootstrap::{EngineBootstrap, EngineHandle};
pub use config::{ConfigError, EngineConfig, LoggingConfig};
pub use error::EngineError;

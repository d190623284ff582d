//! Broker access for the Tandem replication core.
//!
//! All replication traffic (input events, control messages, snapshot
//! pointers, results) flows through ordered, offset-addressed topics. This
//! crate defines the [`Broker`] seam and its two implementations, plus the
//! [`Producer`] and the bounded last-record lookups built on top of it.
//!
//! # Modules
//!
//! - [`broker`] -- The [`Broker`] trait
//! - [`local`] -- In-process logs for tests and local mode
//! - [`nats`] -- NATS `JetStream` adapter for clustered deployments
//! - [`producer`] -- JSON producer with synchronous acknowledgement
//! - [`consumer`] -- `get_last_event` and friends
//! - [`error`] -- [`BrokerError`]

pub mod broker;
pub mod consumer;
pub mod error;
pub mod local;
pub mod nats;
pub mod producer;

pub use broker::Broker;
pub use consumer::{get_last_event, last_record_within};
pub use error::BrokerError;
pub use local::{DEFAULT_LOCAL_CAPACITY, LocalBroker};
pub use nats::NatsBroker;
pub use producer::Producer;

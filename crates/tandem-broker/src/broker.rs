//! The broker seam.
//!
//! Every topic (events, control, snapshot, results) is an append-only log
//! with offsets assigned by the broker. The [`Broker`] trait abstracts the
//! mechanism: [`LocalBroker`](crate::LocalBroker) keeps the logs in process
//! memory for tests and single-process "local mode", and
//! [`NatsBroker`](crate::NatsBroker) maps each topic to a NATS `JetStream`
//! stream. Producers and poll loops receive an `Arc<dyn Broker>` at
//! construction time and never know which one they hold.

use std::time::Duration;

use async_trait::async_trait;
use tandem_types::Record;

use crate::error::BrokerError;

/// An ordered, offset-addressed log service.
///
/// Offsets start at 1 per topic. `end_offset` of an empty topic is 0.
#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Debug {
    /// Append `payload` under `key` to `topic` and return the assigned offset.
    ///
    /// Returns only after the broker acknowledged the record.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the record could not be stored.
    async fn produce(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<u64, BrokerError>;

    /// Read up to `max` records of `topic` starting at offset `from`.
    ///
    /// Blocks for at most `timeout` waiting for the first record and
    /// returns an empty batch if none arrived in time.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the broker could not be queried.
    async fn poll(
        &self,
        topic: &str,
        from: u64,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, BrokerError>;

    /// Offset of the last record currently in `topic` (0 if empty).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the broker could not be queried.
    async fn end_offset(&self, topic: &str) -> Result<u64, BrokerError>;

    /// The last record of `topic`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the broker could not be queried.
    async fn last_record(&self, topic: &str) -> Result<Option<Record>, BrokerError>;

    /// Release connections and refuse further produces.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if pending data could not be flushed.
    async fn close(&self) -> Result<(), BrokerError>;
}

//! Synchronous-acknowledgement producer.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::broker::Broker;
use crate::error::BrokerError;

/// Serializes messages as JSON and appends them through a [`Broker`].
///
/// `produce_sync` returns only once the broker has acknowledged the record,
/// so the offset it hands back is durable from the caller's point of view.
#[derive(Debug, Clone)]
pub struct Producer {
    broker: Arc<dyn Broker>,
}

impl Producer {
    /// Create a producer over the given broker.
    pub const fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// The broker this producer writes to.
    pub const fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Serialize `message` and append it to `topic` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Serde`] if the message cannot be encoded, or the
    /// broker's error if the append was not acknowledged.
    pub async fn produce_sync<T: Serialize + Sync>(
        &self,
        topic: &str,
        key: &str,
        message: &T,
    ) -> Result<u64, BrokerError> {
        let payload = serde_json::to_vec(message)?;
        let offset = self.broker.produce(topic, key, payload).await?;
        debug!(topic, key, offset, "produced message");
        Ok(offset)
    }
}

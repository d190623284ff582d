//! Error types for broker access.
//!
//! Uses `thiserror` for typed errors that surface through producers and
//! poll loops: connectivity, capacity, shutdown, and payload encoding.

/// Errors that can occur while talking to a broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Failed to connect to or communicate with the NATS server.
    #[error("NATS error: {0}")]
    Nats(String),

    /// The in-process topic reached its capacity.
    #[error("topic {topic} is full (capacity {capacity})")]
    Full {
        /// Topic that rejected the record.
        topic: String,
        /// Configured per-topic capacity.
        capacity: usize,
    },

    /// The broker has been closed and accepts no more records.
    #[error("broker is closed")]
    Closed,

    /// Serialization or deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl BrokerError {
    /// Whether retrying the same operation later can succeed.
    ///
    /// Connectivity and capacity problems are transient; a closed broker
    /// or a malformed payload is not.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Nats(_) | Self::Full { .. })
    }
}

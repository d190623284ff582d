//! Bounded "what is the last thing on this topic" lookups.
//!
//! Used at startup to discover the latest snapshot pointer and by tests to
//! inspect the control log. None of these lookups can hang: each is wrapped
//! in a timeout, and an empty or unreachable topic yields a zero value.

use std::time::Duration;

use tandem_types::{ControlMessage, Record};
use tracing::{debug, warn};

use crate::broker::Broker;

/// Fetch the last record of `topic`, giving up after `timeout`.
///
/// Returns `None` if the topic is empty, the broker errored, or the lookup
/// did not finish in time.
pub async fn last_record_within(
    broker: &dyn Broker,
    topic: &str,
    timeout: Duration,
) -> Option<Record> {
    match tokio::time::timeout(timeout, broker.last_record(topic)).await {
        Ok(Ok(record)) => record,
        Ok(Err(e)) => {
            warn!(topic, error = %e, "last record lookup failed");
            None
        }
        Err(_) => {
            debug!(topic, timeout_ms = timeout.as_millis(), "last record lookup timed out");
            None
        }
    }
}

/// Return the last [`ControlMessage`] on `topic`, or the zero-valued
/// message (`offset = 0`) if there is none.
///
/// Never errors and never blocks longer than `timeout`. A record that fails
/// to decode is logged and treated as absent.
pub async fn get_last_event(broker: &dyn Broker, topic: &str, timeout: Duration) -> ControlMessage {
    let Some(record) = last_record_within(broker, topic, timeout).await else {
        return ControlMessage::default();
    };
    match ControlMessage::from_record(&record) {
        Ok(message) => message,
        Err(e) => {
            warn!(topic, offset = record.offset, error = %e, "last record is not a control message");
            ControlMessage::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Instant;

    use async_trait::async_trait;
    use tandem_types::SideEffect;

    use super::*;
    use crate::error::BrokerError;
    use crate::local::LocalBroker;

    /// A broker whose lookups never complete.
    #[derive(Debug)]
    struct StalledBroker;

    #[async_trait]
    impl Broker for StalledBroker {
        async fn produce(&self, _: &str, _: &str, _: Vec<u8>) -> Result<u64, BrokerError> {
            std::future::pending().await
        }
        async fn poll(
            &self,
            _: &str,
            _: u64,
            _: usize,
            _: Duration,
        ) -> Result<Vec<Record>, BrokerError> {
            std::future::pending().await
        }
        async fn end_offset(&self, _: &str) -> Result<u64, BrokerError> {
            std::future::pending().await
        }
        async fn last_record(&self, _: &str) -> Result<Option<Record>, BrokerError> {
            std::future::pending().await
        }
        async fn close(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_topic_yields_zero_message_within_timeout() {
        let broker = LocalBroker::default();
        let started = Instant::now();
        let message = get_last_event(&broker, "snapshots", Duration::from_millis(100)).await;
        assert_eq!(message.offset, 0);
        assert!(message.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn stalled_broker_yields_zero_message_within_timeout() {
        let started = Instant::now();
        let message = get_last_event(&StalledBroker, "control", Duration::from_millis(50)).await;
        assert_eq!(message, ControlMessage::default());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn returns_last_message_with_log_offset() {
        let broker = LocalBroker::default();
        for id in ["a", "b"] {
            let message = ControlMessage::for_event(id, vec![SideEffect::new("noop", serde_json::Value::Null)], 5);
            broker
                .produce("control", id, serde_json::to_vec(&message).unwrap())
                .await
                .unwrap();
        }
        let last = get_last_event(&broker, "control", Duration::from_millis(100)).await;
        assert_eq!(last.offset, 2);
        assert_eq!(last.id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn undecodable_record_yields_zero_message() {
        let broker = LocalBroker::default();
        broker.produce("control", "k", b"garbage".to_vec()).await.unwrap();
        let last = get_last_event(&broker, "control", Duration::from_millis(100)).await;
        assert!(last.is_empty());
    }
}

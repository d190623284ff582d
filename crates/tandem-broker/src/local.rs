//! In-process broker for tests and single-process "local mode".
//!
//! Each topic is a bounded in-memory log. Nodes that should see the same
//! topics share one `Arc<LocalBroker>`; there is no process-wide instance.
//! Polls block on a [`Notify`] until a record is appended or the timeout
//! expires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tandem_types::Record;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::broker::Broker;
use crate::error::BrokerError;

/// Default maximum number of records a single local topic holds.
pub const DEFAULT_LOCAL_CAPACITY: usize = 65_536;

/// A process-local broker backed by per-topic vectors.
#[derive(Debug)]
pub struct LocalBroker {
    /// Topic name to its records, in offset order.
    topics: Mutex<HashMap<String, Vec<Record>>>,
    /// Maximum records per topic before `produce` fails fast.
    capacity: usize,
    /// Set once [`close`](Broker::close) has been called.
    closed: AtomicBool,
    /// Woken on every append and on close.
    appended: Notify,
}

impl LocalBroker {
    /// Create a broker whose topics hold at most `capacity` records each.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity,
            closed: AtomicBool::new(false),
            appended: Notify::new(),
        }
    }

    /// Whether the broker has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Poll a single record at offset `from`, or `None` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] once the broker is closed.
    pub async fn poll_one(
        &self,
        topic: &str,
        from: u64,
        timeout: Duration,
    ) -> Result<Option<Record>, BrokerError> {
        let mut batch = self.poll(topic, from, 1, timeout).await?;
        Ok(batch.pop())
    }

    /// Copy up to `max` records of `topic` starting at offset `from`.
    async fn read(&self, topic: &str, from: u64, max: usize) -> Vec<Record> {
        let topics = self.topics.lock().await;
        let Some(records) = topics.get(topic) else {
            return Vec::new();
        };
        let skip = usize::try_from(from.saturating_sub(1)).unwrap_or(usize::MAX);
        records.iter().skip(skip).take(max).cloned().collect()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_CAPACITY)
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn produce(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<u64, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let offset = {
            let mut topics = self.topics.lock().await;
            let records = topics.entry(topic.to_owned()).or_default();
            if records.len() >= self.capacity {
                return Err(BrokerError::Full {
                    topic: topic.to_owned(),
                    capacity: self.capacity,
                });
            }
            let offset = u64::try_from(records.len())
                .unwrap_or(u64::MAX)
                .saturating_add(1);
            records.push(Record {
                topic: topic.to_owned(),
                offset,
                key: Some(key.to_owned()),
                timestamp: tandem_types::now_millis(),
                payload,
            });
            offset
        };

        debug!(topic, key, offset, "appended local record");
        self.appended.notify_waiters();
        Ok(offset)
    }

    async fn poll(
        &self,
        topic: &str,
        from: u64,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, BrokerError> {
        let deadline = tokio::time::Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(tokio::time::Instant::now);

        loop {
            // Register interest before reading so an append between the
            // read and the wait still wakes us.
            let notified = self.appended.notified();

            let batch = self.read(topic, from, max).await;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if self.is_closed() {
                return Err(BrokerError::Closed);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn end_offset(&self, topic: &str) -> Result<u64, BrokerError> {
        let topics = self.topics.lock().await;
        let len = topics.get(topic).map_or(0, Vec::len);
        Ok(u64::try_from(len).unwrap_or(u64::MAX))
    }

    async fn last_record(&self, topic: &str) -> Result<Option<Record>, BrokerError> {
        let topics = self.topics.lock().await;
        Ok(topics.get(topic).and_then(|records| records.last().cloned()))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("local broker closed");
        }
        self.appended.notify_waiters();
        Ok(())
    }
}

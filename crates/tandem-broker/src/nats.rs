//! NATS `JetStream` broker for real clusters.
//!
//! Each topic maps to one `JetStream` stream whose only subject is the topic
//! name. A stream is a single ordered log, so records under the same key
//! (indeed, all records of a topic) are totally ordered, and the stream
//! sequence is the record offset.
//!
//! # Subject Convention
//!
//! - **Subject:** the topic name, e.g. `tandem.control`
//! - **Stream:** `TANDEM_` plus the topic upper-cased with separators replaced,
//!   e.g. `TANDEM_TANDEM_CONTROL`
//! - **Headers:** `Tandem-Key` (partitioning key), `Tandem-Timestamp`
//!   (producer epoch millis)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::HeaderMap;
use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use futures::StreamExt as _;
use tandem_types::Record;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::BrokerError;

/// Header carrying the producer's partitioning key.
const KEY_HEADER: &str = "Tandem-Key";

/// Header carrying the producer-side timestamp.
const TIMESTAMP_HEADER: &str = "Tandem-Timestamp";

/// How long the server keeps an idle ephemeral pull consumer around.
const CONSUMER_INACTIVE_THRESHOLD: Duration = Duration::from_secs(300);

/// A pull consumer positioned at a known offset.
struct PullCursor {
    /// Offset the next fetch will deliver.
    next: u64,
    /// Ephemeral pull consumer on the topic's stream.
    consumer: consumer::PullConsumer,
}

/// Broker adapter over a NATS `JetStream` connection.
pub struct NatsBroker {
    /// Core NATS connection (also used for plain subscriptions).
    client: async_nats::Client,
    /// `JetStream` context bound to `client`.
    jetstream: jetstream::Context,
    /// Streams already looked up or created, keyed by topic.
    streams: Mutex<HashMap<String, stream::Stream>>,
    /// Cached consumers, keyed by topic.
    cursors: Mutex<HashMap<String, PullCursor>>,
    /// Set once [`close`](Broker::close) has been called.
    closed: AtomicBool,
}

impl NatsBroker {
    /// Connect to a NATS server and make sure a stream exists for every topic.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Nats`] if the connection cannot be established
    /// or a stream cannot be created. Startup treats this as fatal.
    pub async fn connect(url: &str, topics: &[&str]) -> Result<Self, BrokerError> {
        info!(url, "connecting to NATS server");
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::Nats(format!("failed to connect to {url}: {e}")))?;
        let jetstream = jetstream::new(client.clone());

        let broker = Self {
            client,
            jetstream,
            streams: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };

        for topic in topics {
            broker.stream(topic).await?;
        }
        info!(topic_count = topics.len(), "NATS JetStream streams ready");
        Ok(broker)
    }

    /// The underlying NATS client, for plain pub/sub subscriptions.
    pub const fn client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Look up (or create) the stream backing `topic`.
    async fn stream(&self, topic: &str) -> Result<stream::Stream, BrokerError> {
        let mut streams = self.streams.lock().await;
        if let Some(existing) = streams.get(topic) {
            return Ok(existing.clone());
        }

        let name = stream_name(topic);
        let created = self
            .jetstream
            .get_or_create_stream(stream::Config {
                name: name.clone(),
                subjects: vec![topic.to_owned()],
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Nats(format!("failed to open stream {name}: {e}")))?;
        debug!(topic, stream = name, "stream ready");
        streams.insert(topic.to_owned(), created.clone());
        Ok(created)
    }

    /// Create an ephemeral pull consumer delivering from `from` onward.
    async fn create_consumer(
        &self,
        topic: &str,
        from: u64,
    ) -> Result<consumer::PullConsumer, BrokerError> {
        let stream = self.stream(topic).await?;
        stream
            .create_consumer(consumer::pull::Config {
                deliver_policy: consumer::DeliverPolicy::ByStartSequence {
                    start_sequence: from,
                },
                ack_policy: consumer::AckPolicy::None,
                inactive_threshold: CONSUMER_INACTIVE_THRESHOLD,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Nats(format!("failed to create consumer on {topic}: {e}")))
    }
}

/// Derive a valid `JetStream` stream name from a topic.
fn stream_name(topic: &str) -> String {
    let sanitized: String = topic
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("TANDEM_{sanitized}")
}

/// Convert a delivered `JetStream` message into a [`Record`].
fn to_record(topic: &str, message: &jetstream::Message) -> Result<Record, BrokerError> {
    let offset = message
        .info()
        .map_err(|e| BrokerError::Nats(format!("message on {topic} lacks metadata: {e}")))?
        .stream_sequence;
    let header = |name: &str| {
        message
            .headers
            .as_ref()
            .and_then(|headers| headers.get(name))
            .map(|value| value.as_str().to_owned())
    };
    Ok(Record {
        topic: topic.to_owned(),
        offset,
        key: header(KEY_HEADER),
        timestamp: header(TIMESTAMP_HEADER)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default(),
        payload: message.payload.to_vec(),
    })
}

#[async_trait]
impl Broker for NatsBroker {
    async fn produce(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<u64, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        self.stream(topic).await?;

        let timestamp = tandem_types::now_millis().to_string();
        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, key);
        headers.insert(TIMESTAMP_HEADER, timestamp.as_str());

        let ack = self
            .jetstream
            .publish_with_headers(topic.to_owned(), headers, payload.into())
            .await
            .map_err(|e| BrokerError::Nats(format!("failed to publish to {topic}: {e}")))?
            .await
            .map_err(|e| BrokerError::Nats(format!("publish to {topic} not acknowledged: {e}")))?;

        debug!(topic, key, offset = ack.sequence, "published record");
        Ok(ack.sequence)
    }

    async fn poll(
        &self,
        topic: &str,
        from: u64,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, BrokerError> {
        let from = from.max(1);

        // Reuse the cached consumer only if it sits exactly where we want
        // to read; otherwise start a fresh one at `from`.
        let cached = self.cursors.lock().await.remove(topic);
        let consumer = match cached {
            Some(cursor) if cursor.next == from => cursor.consumer,
            _ => self.create_consumer(topic, from).await?,
        };

        let mut records = Vec::new();

        let mut available = consumer
            .fetch()
            .max_messages(max)
            .messages()
            .await
            .map_err(|e| BrokerError::Nats(format!("fetch on {topic} failed: {e}")))?;
        while let Some(message) = available.next().await {
            let message =
                message.map_err(|e| BrokerError::Nats(format!("fetch on {topic} failed: {e}")))?;
            records.push(to_record(topic, &message)?);
        }

        if records.is_empty() {
            let mut waiting = consumer
                .batch()
                .max_messages(1)
                .expires(timeout)
                .messages()
                .await
                .map_err(|e| BrokerError::Nats(format!("poll on {topic} failed: {e}")))?;
            while let Some(message) = waiting.next().await {
                let message = message
                    .map_err(|e| BrokerError::Nats(format!("poll on {topic} failed: {e}")))?;
                records.push(to_record(topic, &message)?);
            }
        }

        let next = records
            .last()
            .map_or(from, |record| record.offset.saturating_add(1));
        self.cursors
            .lock()
            .await
            .insert(topic.to_owned(), PullCursor { next, consumer });

        Ok(records)
    }

    async fn end_offset(&self, topic: &str) -> Result<u64, BrokerError> {
        let mut stream = self.stream(topic).await?;
        let info = stream
            .info()
            .await
            .map_err(|e| BrokerError::Nats(format!("failed to read stream info for {topic}: {e}")))?;
        Ok(info.state.last_sequence)
    }

    async fn last_record(&self, topic: &str) -> Result<Option<Record>, BrokerError> {
        let last = self.end_offset(topic).await?;
        if last == 0 {
            return Ok(None);
        }
        let stream = self.stream(topic).await?;
        let message = stream
            .get_raw_message(last)
            .await
            .map_err(|e| BrokerError::Nats(format!("failed to read {topic}@{last}: {e}")))?;
        Ok(Some(Record {
            topic: topic.to_owned(),
            offset: message.sequence,
            key: None,
            timestamp: 0,
            payload: message.payload.to_vec(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cursors.lock().await.clear();
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "NATS flush on close failed");
            return Err(BrokerError::Nats(format!("flush failed: {e}")));
        }
        info!("NATS broker closed");
        Ok(())
    }
}

impl std::fmt::Debug for NatsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBroker")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

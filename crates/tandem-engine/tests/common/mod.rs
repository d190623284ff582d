//! Shared helpers for the engine integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tandem_broker::Broker;
use tandem_core::{KvSession, SharedSession};
use tandem_engine::{EngineConfig, EngineHandle};
use tandem_types::DomainEvent;
use tokio::sync::Mutex;

/// Upper bound for any "eventually" condition.
pub const PATIENCE: Duration = Duration::from_secs(10);

/// Local-mode config tuned for fast tests.
pub fn node_config(node_id: &str) -> EngineConfig {
    EngineConfig {
        local: true,
        under_test: true,
        poll_timeout_millis: 20,
        node_id: node_id.to_owned(),
        snapshot_every_events: 0,
        snapshot_wait_millis: 100,
        ..EngineConfig::default()
    }
}

/// A key/value session plus the type-erased handle the engine takes.
pub fn kv_session() -> (Arc<Mutex<KvSession>>, SharedSession) {
    let kv = Arc::new(Mutex::new(KvSession::new()));
    let session: SharedSession = kv.clone();
    (kv, session)
}

/// Append one event to the events topic.
pub async fn publish_event(
    broker: &dyn Broker,
    config: &EngineConfig,
    id: &str,
    payload: serde_json::Value,
) -> u64 {
    let event = DomainEvent {
        id: id.to_owned(),
        key: String::from("account"),
        timestamp: tandem_types::now_millis(),
        payload,
    };
    broker
        .produce(&config.events_topic, id, serde_json::to_vec(&event).unwrap())
        .await
        .unwrap()
}

/// A deterministic mix of key/value commands.
pub fn workload(count: usize) -> Vec<(String, serde_json::Value)> {
    let commands = [
        json!({"op": "add", "key": "balance", "delta": 10}),
        json!({"op": "set", "key": "owner", "value": "ada"}),
        json!({"op": "add", "key": "balance", "delta": -3}),
        json!({"op": "set", "key": "tags", "value": ["a", "b"]}),
        json!({"op": "delete", "key": "tags"}),
        json!({"op": "add", "key": "visits", "delta": 1}),
    ];
    commands
        .iter()
        .cycle()
        .take(count)
        .enumerate()
        .map(|(index, command)| (format!("evt-{index}"), command.clone()))
        .collect()
}

/// Wait until the node has applied `events` events-topic offsets.
pub async fn wait_for_events(handle: &EngineHandle, events: u64) {
    tokio::time::timeout(PATIENCE, async {
        while handle.cursor().events < events {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Wait until `topic` holds at least `offset` records.
pub async fn wait_for_end_offset(broker: &dyn Broker, topic: &str, offset: u64) {
    tokio::time::timeout(PATIENCE, async {
        while broker.end_offset(topic).await.unwrap() < offset {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

//! Leader/replica convergence and snapshot-based catch-up on a shared broker.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use tandem_broker::{Broker, LocalBroker, last_record_within};
use tandem_core::Session as _;
use tandem_engine::{EngineBootstrap, EngineConfig};
use tandem_types::{NodeRole, ResultMessage, SnapshotPointer};

use common::{kv_session, node_config, publish_event, wait_for_end_offset, wait_for_events, workload};

fn shared_broker() -> (Arc<LocalBroker>, Arc<dyn Broker>) {
    let broker = Arc::new(LocalBroker::default());
    let erased: Arc<dyn Broker> = broker.clone();
    (broker, erased)
}

#[tokio::test]
async fn replica_converges_to_leader_state() {
    let (_, broker) = shared_broker();
    let (leader_kv, leader_session) = kv_session();
    let (replica_kv, replica_session) = kv_session();

    let leader_node = EngineBootstrap::new();
    let leader = leader_node
        .start_engine_on(&node_config("node-a"), leader_session, Arc::clone(&broker))
        .await
        .unwrap();
    let replica_node = EngineBootstrap::new();
    let replica = replica_node
        .start_engine_on(&node_config("node-b"), replica_session, Arc::clone(&broker))
        .await
        .unwrap();

    assert_eq!(leader.leadership().promote().await.unwrap(), NodeRole::Leader);
    assert_eq!(replica.leadership().demote().await.unwrap(), NodeRole::Replica);

    let config = node_config("publisher");
    let events = workload(24);
    for (id, payload) in &events {
        publish_event(broker.as_ref(), &config, id, payload.clone()).await;
    }
    let total = u64::try_from(events.len()).unwrap();
    wait_for_events(&leader, total).await;
    wait_for_events(&replica, total).await;

    assert_eq!(leader.cursor(), replica.cursor());
    assert_eq!(broker.end_offset(&config.control_topic).await.unwrap(), total);

    // Revisions are minted by the leader, so equality means the replica
    // applied recorded effects instead of re-evaluating.
    let leader_state = leader_kv.lock().await.clone();
    let replica_state = replica_kv.lock().await.clone();
    assert_eq!(leader_state, replica_state);
    assert_eq!(
        leader_kv.lock().await.snapshot().unwrap(),
        replica_kv.lock().await.snapshot().unwrap()
    );
    assert!(leader_state.get("balance").is_some());

    replica_node.stop_engine().await.unwrap();
    leader_node.stop_engine().await.unwrap();
}

#[tokio::test]
async fn rejected_events_are_recorded_and_skipped_everywhere() {
    let (_, broker) = shared_broker();
    let (leader_kv, leader_session) = kv_session();
    let (replica_kv, replica_session) = kv_session();

    let leader_node = EngineBootstrap::new();
    let leader = leader_node
        .start_engine_on(&node_config("node-a"), leader_session, Arc::clone(&broker))
        .await
        .unwrap();
    let replica_node = EngineBootstrap::new();
    let replica = replica_node
        .start_engine_on(&node_config("node-b"), replica_session, Arc::clone(&broker))
        .await
        .unwrap();
    leader.leadership().promote().await.unwrap();
    replica.leadership().demote().await.unwrap();

    let config = node_config("publisher");
    publish_event(broker.as_ref(), &config, "ok", serde_json::json!({"op": "set", "key": "name", "value": "x"})).await;
    publish_event(broker.as_ref(), &config, "bad", serde_json::json!({"op": "add", "key": "name", "delta": 1})).await;
    broker
        .produce(&config.events_topic, "garbage", b"not json".to_vec())
        .await
        .unwrap();
    publish_event(broker.as_ref(), &config, "after", serde_json::json!({"op": "add", "key": "n", "delta": 5})).await;

    wait_for_events(&leader, 4).await;
    wait_for_events(&replica, 4).await;

    // The undecodable record produces nothing; the rejected one an empty message.
    assert_eq!(broker.end_offset(&config.control_topic).await.unwrap(), 3);
    assert_eq!(replica.cursor().control, 3);
    assert_eq!(*leader_kv.lock().await, *replica_kv.lock().await);
    assert_eq!(replica_kv.lock().await.get("n"), Some(&serde_json::json!(5)));

    replica_node.stop_engine().await.unwrap();
    leader_node.stop_engine().await.unwrap();
}

#[tokio::test]
async fn snapshot_restore_plus_tail_replay_matches_full_replay() {
    let (_, broker) = shared_broker();
    let shared_dir = tempfile::tempdir().unwrap();
    let empty_dir = tempfile::tempdir().unwrap();
    let with_dir = |node: &str, dir: &std::path::Path| EngineConfig {
        snapshot_dir: Some(dir.to_path_buf()),
        ..node_config(node)
    };
    let publisher = node_config("publisher");
    let events = workload(18);
    let (head, tail) = events.split_at(10);

    let (leader_kv, leader_session) = kv_session();
    let leader_node = EngineBootstrap::new();
    let leader = leader_node
        .start_engine_on(&with_dir("node-a", shared_dir.path()), leader_session, Arc::clone(&broker))
        .await
        .unwrap();
    leader.leadership().promote().await.unwrap();

    for (id, payload) in head {
        publish_event(broker.as_ref(), &publisher, id, payload.clone()).await;
    }
    wait_for_events(&leader, 10).await;
    let snapshot = leader.snapshot_now().await.unwrap();
    assert_eq!(snapshot.offset, 10);
    assert_eq!(snapshot.events_offset, 10);

    for (id, payload) in tail {
        publish_event(broker.as_ref(), &publisher, id, payload.clone()).await;
    }
    wait_for_events(&leader, 18).await;

    // Restores from the announced snapshot, then replays offsets 11..=18.
    let (restored_kv, restored_session) = kv_session();
    let restored_node = EngineBootstrap::new();
    let restored = restored_node
        .start_engine_on(&with_dir("node-b", shared_dir.path()), restored_session, Arc::clone(&broker))
        .await
        .unwrap();
    assert!(restored.cursor().control >= 10);

    // Sees the pointer but not the file, so it replays from the beginning.
    let (replayed_kv, replayed_session) = kv_session();
    let replayed_node = EngineBootstrap::new();
    let replayed = replayed_node
        .start_engine_on(&with_dir("node-c", empty_dir.path()), replayed_session, Arc::clone(&broker))
        .await
        .unwrap();

    wait_for_events(&restored, 18).await;
    wait_for_events(&replayed, 18).await;

    let expected = leader_kv.lock().await.clone();
    assert_eq!(*restored_kv.lock().await, expected);
    assert_eq!(*replayed_kv.lock().await, expected);
    assert_eq!(restored.cursor(), replayed.cursor());

    for node in [&restored_node, &replayed_node, &leader_node] {
        node.stop_engine().await.unwrap();
    }
}

#[tokio::test]
async fn periodic_snapshots_and_results_are_published() {
    let (_, broker) = shared_broker();
    let config = EngineConfig {
        snapshot_every_events: 3,
        results_topic: Some(String::from("tandem.results")),
        ..node_config("node-a")
    };
    let bootstrap = EngineBootstrap::new();
    let leader = bootstrap
        .start_engine_on(&config, kv_session().1, Arc::clone(&broker))
        .await
        .unwrap();
    leader.leadership().promote().await.unwrap();

    for (id, payload) in workload(6) {
        publish_event(broker.as_ref(), &config, &id, payload).await;
    }
    wait_for_events(&leader, 6).await;
    wait_for_end_offset(broker.as_ref(), "tandem.results", 6).await;
    wait_for_end_offset(broker.as_ref(), &config.snapshot_topic, 1).await;

    let result = last_record_within(broker.as_ref(), "tandem.results", Duration::from_millis(100))
        .await
        .unwrap();
    let result: ResultMessage = serde_json::from_slice(&result.payload).unwrap();
    assert_eq!(result.event_id, "evt-5");
    assert_eq!(result.offset, 6);
    assert_eq!(result.side_effects.len(), 1);

    let pointer = last_record_within(broker.as_ref(), &config.snapshot_topic, Duration::from_millis(100))
        .await
        .unwrap();
    let pointer: SnapshotPointer = serde_json::from_slice(&pointer.payload).unwrap();
    assert!(pointer.offset >= 3);

    bootstrap.stop_engine().await.unwrap();
}

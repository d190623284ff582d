//! Role transitions: promotion catch-up, demotion emission guard, failover.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use tandem_broker::{Broker, LocalBroker};
use tandem_core::{KV_WRITE, KvSession, Session, SessionError, SharedSession};
use tandem_engine::EngineBootstrap;
use tandem_types::{ControlMessage, DomainEvent, NodeRole, SideEffect};
use tokio::sync::Mutex;

use common::{PATIENCE, kv_session, node_config, publish_event, wait_for_end_offset, wait_for_events, workload};

/// Key/value session whose leader evaluation takes a while.
#[derive(Debug)]
struct SlowSession {
    inner: KvSession,
    delay: Duration,
    evaluating: Arc<AtomicBool>,
}

impl Session for SlowSession {
    fn apply(
        &mut self,
        event: &DomainEvent,
        recorded: Option<&[SideEffect]>,
    ) -> Result<Vec<SideEffect>, SessionError> {
        if recorded.is_none() {
            self.evaluating.store(true, Ordering::SeqCst);
            std::thread::sleep(self.delay);
        }
        self.inner.apply(event, recorded)
    }

    fn snapshot(&self) -> Result<Vec<u8>, SessionError> {
        self.inner.snapshot()
    }

    fn restore(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        self.inner.restore(payload)
    }
}

fn recorded_write(event_id: &str, key: &str, value: i64) -> Vec<u8> {
    let message = ControlMessage::for_event(
        event_id,
        vec![SideEffect::new(
            KV_WRITE,
            json!({"key": key, "value": value, "revision": format!("rev-{event_id}")}),
        )],
        1,
    );
    serde_json::to_vec(&message).unwrap()
}

#[tokio::test]
async fn promotion_waits_for_control_log_catch_up() {
    let broker: Arc<dyn Broker> = Arc::new(LocalBroker::default());
    let config = node_config("node-b");

    // A previous leader recorded three events that this node has not seen yet.
    for (index, id) in ["e1", "e2", "e3"].into_iter().enumerate() {
        let value = i64::try_from(index).unwrap();
        broker
            .produce(&config.control_topic, id, recorded_write(id, id, value))
            .await
            .unwrap();
    }

    let (kv, session) = kv_session();
    let bootstrap = EngineBootstrap::new();
    let node = bootstrap
        .start_engine_on(&config, session, Arc::clone(&broker))
        .await
        .unwrap();

    let leadership = node.leadership().clone();
    let promotion = tokio::spawn(async move { leadership.promote().await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!promotion.is_finished());
    assert_eq!(node.role(), NodeRole::BeforeBecomeLeader);
    assert_eq!(node.cursor().control, 0);

    for id in ["e1", "e2", "e3"] {
        publish_event(broker.as_ref(), &config, id, json!({"op": "set", "key": id, "value": -1})).await;
    }

    let role = tokio::time::timeout(PATIENCE, promotion)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(role, NodeRole::Leader);
    assert_eq!(node.cursor().control, 3);
    // Recorded effects were applied, not the events' own commands.
    assert_eq!(kv.lock().await.get("e3"), Some(&json!(2)));
    assert_eq!(kv.lock().await.revision("e1"), Some("rev-e1"));

    // New events are now evaluated and recorded by this node.
    publish_event(broker.as_ref(), &config, "e4", json!({"op": "add", "key": "e3", "delta": 5})).await;
    wait_for_end_offset(broker.as_ref(), &config.control_topic, 4).await;
    wait_for_events(&node, 4).await;
    assert_eq!(kv.lock().await.get("e3"), Some(&json!(7)));

    bootstrap.stop_engine().await.unwrap();
}

#[tokio::test]
async fn promotion_is_aborted_by_stop() {
    let broker: Arc<dyn Broker> = Arc::new(LocalBroker::default());
    let config = node_config("node-b");
    broker
        .produce(&config.control_topic, "e1", recorded_write("e1", "k", 1))
        .await
        .unwrap();

    let bootstrap = EngineBootstrap::new();
    let node = bootstrap
        .start_engine_on(&config, kv_session().1, Arc::clone(&broker))
        .await
        .unwrap();
    let leadership = node.leadership().clone();
    let promotion = tokio::spawn(async move { leadership.promote().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    node.controller().request_stop();
    let outcome = tokio::time::timeout(PATIENCE, promotion).await.unwrap().unwrap();
    assert!(outcome.is_err());
    assert_eq!(node.role(), NodeRole::None);
    assert!(node.leadership().last_failure().await.is_some());

    bootstrap.stop_engine().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn demoted_node_emits_nothing_after_callback_returns() {
    let broker: Arc<dyn Broker> = Arc::new(LocalBroker::default());
    let config = node_config("node-a");
    let evaluating = Arc::new(AtomicBool::new(false));
    let session: SharedSession = Arc::new(Mutex::new(SlowSession {
        inner: KvSession::new(),
        delay: Duration::from_millis(200),
        evaluating: Arc::clone(&evaluating),
    }));

    let bootstrap = EngineBootstrap::new();
    let node = bootstrap
        .start_engine_on(&config, session, Arc::clone(&broker))
        .await
        .unwrap();
    node.leadership().promote().await.unwrap();

    publish_event(broker.as_ref(), &config, "in-flight", json!({"op": "add", "key": "n", "delta": 1})).await;
    tokio::time::timeout(PATIENCE, async {
        while !evaluating.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    // Demotion starts while the event is mid-evaluation and must wait it out.
    assert_eq!(node.leadership().demote().await.unwrap(), NodeRole::Replica);
    let emitted = broker.end_offset(&config.control_topic).await.unwrap();
    assert_eq!(emitted, 1);
    assert_eq!(node.cursor().control, 1);

    for (id, payload) in workload(3) {
        publish_event(broker.as_ref(), &config, &id, payload).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(broker.end_offset(&config.control_topic).await.unwrap(), emitted);
    assert_eq!(node.cursor().events, 1);

    bootstrap.stop_engine().await.unwrap();
}

#[tokio::test]
async fn failover_continues_from_the_same_state() {
    let broker: Arc<dyn Broker> = Arc::new(LocalBroker::default());
    let publisher = node_config("publisher");
    let (a_kv, a_session) = kv_session();
    let (b_kv, b_session) = kv_session();

    let a_node = EngineBootstrap::new();
    let a = a_node
        .start_engine_on(&node_config("node-a"), a_session, Arc::clone(&broker))
        .await
        .unwrap();
    let b_node = EngineBootstrap::new();
    let b = b_node
        .start_engine_on(&node_config("node-b"), b_session, Arc::clone(&broker))
        .await
        .unwrap();
    a.leadership().promote().await.unwrap();
    b.leadership().demote().await.unwrap();

    let events = workload(12);
    let (first, second) = events.split_at(6);
    for (id, payload) in first {
        publish_event(broker.as_ref(), &publisher, id, payload.clone()).await;
    }
    wait_for_events(&a, 6).await;

    a.leadership().demote().await.unwrap();
    b.leadership().promote().await.unwrap();
    assert_eq!(b.cursor().control, 6);

    for (id, payload) in second {
        publish_event(broker.as_ref(), &publisher, id, payload.clone()).await;
    }
    wait_for_events(&b, 12).await;
    wait_for_events(&a, 12).await;

    assert_eq!(broker.end_offset(&publisher.control_topic).await.unwrap(), 12);
    assert_eq!(*a_kv.lock().await, *b_kv.lock().await);

    a_node.stop_engine().await.unwrap();
    b_node.stop_engine().await.unwrap();
}

#[tokio::test]
async fn repeated_and_inapplicable_signals_are_no_ops() {
    let bootstrap = EngineBootstrap::new();
    let node = bootstrap
        .start_engine_on(
            &node_config("node-a"),
            kv_session().1,
            Arc::new(LocalBroker::default()),
        )
        .await
        .unwrap();

    assert_eq!(node.leadership().promote().await.unwrap(), NodeRole::Leader);
    assert_eq!(node.leadership().promote().await.unwrap(), NodeRole::Leader);
    assert_eq!(node.leadership().demote().await.unwrap(), NodeRole::Replica);
    assert_eq!(node.leadership().demote().await.unwrap(), NodeRole::Replica);
    assert!(node.leadership().last_failure().await.is_none());

    bootstrap.stop_engine().await.unwrap();
}

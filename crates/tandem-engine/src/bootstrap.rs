//! Engine lifecycle: wire every component together, start, and stop.
//!
//! [`EngineBootstrap`] is the only place that holds "is an engine running
//! in this process" state. It is an explicit value owned by the top-level
//! caller (the binary's `main`, or a test), not a hidden global.
//!
//! # Startup Sequence
//!
//! 1. Validate configuration
//! 2. Connect the broker (in-process or NATS `JetStream`); failure is fatal
//! 3. Build producer, snapshot store, snapshot coordinator
//! 4. Restore the session from the latest announced snapshot
//! 5. Build the consumer controller and the leadership monitor
//! 6. Subscribe to the leadership subject (networked mode, if configured)
//! 7. Spawn the poll loops and the monitor task

use std::sync::Arc;

use tandem_broker::{Broker, LocalBroker, NatsBroker, Producer};
use tandem_core::{
    ConsumerController, ConsumptionCursor, FileSnapshotStore, LeadershipHandle, LeadershipMonitor,
    MemorySnapshotStore, SharedSession, SnapshotCoordinator, SnapshotError, SnapshotStore,
    TransitionHandler,
};
use tandem_types::{CursorPosition, NodeRole, SnapshotInfo};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::leader_signal;

/// Cheap, cloneable view of a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    node_id: Arc<str>,
    controller: Arc<ConsumerController>,
    leadership: LeadershipHandle,
}

impl EngineHandle {
    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The consumer controller.
    pub const fn controller(&self) -> &Arc<ConsumerController> {
        &self.controller
    }

    /// Sender side of the leadership monitor.
    pub const fn leadership(&self) -> &LeadershipHandle {
        &self.leadership
    }

    /// Current role.
    pub fn role(&self) -> NodeRole {
        self.controller.current_role()
    }

    /// Current consumption cursor.
    pub fn cursor(&self) -> CursorPosition {
        self.controller.cursor().position()
    }

    /// Take a snapshot right now.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the snapshot could not be taken, stored,
    /// or announced.
    pub async fn snapshot_now(&self) -> Result<SnapshotInfo, SnapshotError> {
        self.controller.snapshots().snapshot_now().await
    }
}

/// Everything owned by a started engine.
#[derive(Debug)]
struct RunningEngine {
    handle: EngineHandle,
    broker: Arc<dyn Broker>,
    owns_broker: bool,
    monitor: JoinHandle<()>,
    listener: Option<JoinHandle<()>>,
}

/// Starts and stops at most one engine.
#[derive(Debug, Default)]
pub struct EngineBootstrap {
    running: Mutex<Option<RunningEngine>>,
}

impl EngineBootstrap {
    /// A bootstrap with no engine started.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the engine described by `config` around `session`.
    ///
    /// Idempotent: if an engine is already running, its handle is returned
    /// and `config`/`session` are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if configuration is invalid, the broker is
    /// unreachable, or the snapshot cannot be restored. Nothing is left
    /// running in that case.
    pub async fn start_engine(
        &self,
        config: &EngineConfig,
        session: SharedSession,
    ) -> Result<EngineHandle, EngineError> {
        let mut running = self.running.lock().await;
        if let Some(engine) = running.as_ref() {
            info!(node_id = engine.handle.node_id(), "engine already started");
            return Ok(engine.handle.clone());
        }
        config.validate()?;

        let (broker, nats): (Arc<dyn Broker>, Option<async_nats::Client>) = if config.local {
            info!(capacity = config.local_capacity, "using in-process broker");
            (Arc::new(LocalBroker::new(config.local_capacity)), None)
        } else {
            let nats = NatsBroker::connect(&config.nats_url, &config.topics()).await?;
            let client = nats.client().clone();
            (Arc::new(nats), Some(client))
        };

        let engine = launch_or_release(config, session, broker, nats, true).await?;
        let handle = engine.handle.clone();
        *running = Some(engine);
        Ok(handle)
    }

    /// Start an engine on an existing broker (several nodes can share one
    /// in-process broker). The broker is not closed on stop, nor when the
    /// start fails.
    ///
    /// # Errors
    ///
    /// See [`start_engine`](Self::start_engine).
    pub async fn start_engine_on(
        &self,
        config: &EngineConfig,
        session: SharedSession,
        broker: Arc<dyn Broker>,
    ) -> Result<EngineHandle, EngineError> {
        let mut running = self.running.lock().await;
        if let Some(engine) = running.as_ref() {
            info!(node_id = engine.handle.node_id(), "engine already started");
            return Ok(engine.handle.clone());
        }
        config.validate()?;

        let engine = launch_or_release(config, session, broker, None, false).await?;
        let handle = engine.handle.clone();
        *running = Some(engine);
        Ok(handle)
    }

    /// Stop the running engine, if any, and forget it.
    ///
    /// Waits for the poll loops to exit (in-flight emissions complete),
    /// stops the monitor and signal listener, and closes the broker when
    /// the engine created it. A no-op when nothing is running.
    ///
    /// # Errors
    ///
    /// Returns the controller's failure (e.g. a replica divergence) if a
    /// loop ended with one. The engine is stopped and forgotten regardless.
    pub async fn stop_engine(&self) -> Result<(), EngineError> {
        let mut running = self.running.lock().await;
        let Some(engine) = running.take() else {
            debug!("stop_engine called with no engine running");
            return Ok(());
        };

        if let Some(listener) = engine.listener {
            listener.abort();
        }
        let outcome = engine.handle.controller.stop().await;
        engine.monitor.abort();

        if engine.owns_broker {
            if let Err(e) = engine.broker.close().await {
                warn!(error = %e, "broker close failed");
            }
        }

        info!(node_id = engine.handle.node_id(), "engine stopped");
        outcome.map_err(EngineError::from)
    }

    /// The running engine's controller.
    pub async fn controller(&self) -> Option<Arc<ConsumerController>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|engine| Arc::clone(&engine.handle.controller))
    }

    /// The running engine's handle.
    pub async fn handle(&self) -> Option<EngineHandle> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|engine| engine.handle.clone())
    }

    /// Whether an engine is running.
    pub async fn is_started(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

/// Components of a freshly launched engine.
struct Launched {
    handle: EngineHandle,
    monitor: JoinHandle<()>,
    listener: Option<JoinHandle<()>>,
}

impl Launched {
    fn into_running(self, broker: Arc<dyn Broker>, owns_broker: bool) -> RunningEngine {
        RunningEngine {
            handle: self.handle,
            broker,
            owns_broker,
            monitor: self.monitor,
            listener: self.listener,
        }
    }
}

/// Launch an engine. On failure, close the broker if the engine owns it.
async fn launch_or_release(
    config: &EngineConfig,
    session: SharedSession,
    broker: Arc<dyn Broker>,
    nats: Option<async_nats::Client>,
    owns_broker: bool,
) -> Result<RunningEngine, EngineError> {
    match launch(config, session, Arc::clone(&broker), nats).await {
        Ok(parts) => Ok(parts.into_running(broker, owns_broker)),
        Err(e) => {
            if owns_broker {
                if let Err(close) = broker.close().await {
                    warn!(error = %close, "broker close after failed start failed");
                }
            } else {
                warn!(error = %e, "engine start failed; shared broker left open");
            }
            Err(e)
        }
    }
}

/// Wire and spawn every component. Nothing is left running on error.
async fn launch(
    config: &EngineConfig,
    session: SharedSession,
    broker: Arc<dyn Broker>,
    nats: Option<async_nats::Client>,
) -> Result<Launched, EngineError> {
    let producer = Producer::new(broker);
    let cursor = ConsumptionCursor::new();

    let store: Arc<dyn SnapshotStore> = match &config.snapshot_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "using file snapshot store");
            Arc::new(FileSnapshotStore::new(dir))
        }
        None => Arc::new(MemorySnapshotStore::new()),
    };
    let snapshots = Arc::new(
        SnapshotCoordinator::new(
            Arc::clone(&session),
            cursor.clone(),
            store,
            producer.clone(),
            &config.snapshot_topic,
            config.snapshot_wait(),
            config.snapshot_retain,
        )
        .with_capture_timeout(config.snapshot_capture_timeout()),
    );
    snapshots.restore().await?;

    // Subscribe before anything is spawned so a failure leaves nothing running.
    let subscription = match (nats, &config.leader_signal_subject) {
        (Some(client), Some(subject)) => Some(leader_signal::subscribe(&client, subject).await?),
        _ => None,
    };

    let controller = Arc::new(ConsumerController::new(
        config.controller_settings(),
        producer,
        session,
        cursor,
        snapshots,
    ));
    let (monitor, leadership) =
        LeadershipMonitor::new(Arc::clone(&controller) as Arc<dyn TransitionHandler>);
    let monitor = tokio::spawn(monitor.run());
    if let Err(e) = controller.start().await {
        monitor.abort();
        return Err(e.into());
    }

    let listener = subscription
        .map(|subscriber| leader_signal::spawn(subscriber, config.node_id.clone(), leadership.clone()));

    info!(
        node_id = config.node_id,
        local = config.local,
        events_topic = config.events_topic,
        control_topic = config.control_topic,
        snapshot_topic = config.snapshot_topic,
        "engine started"
    );

    Ok(Launched {
        handle: EngineHandle {
            node_id: Arc::from(config.node_id.as_str()),
            controller,
            leadership,
        },
        monitor,
        listener,
    })
}

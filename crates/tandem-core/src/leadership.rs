//! Role state machine driven by external leadership signals.
//!
//! The orchestrator (a NATS subject listener, an operator, a test) sends
//! [`RoleSignal`]s through a [`LeadershipHandle`]. A single monitor task
//! processes them strictly in order:
//!
//! ```text
//! NONE | REPLICA --promote--> BEFORE_BECOME_LEADER --caught up--> LEADER
//! NONE | LEADER  --demote---> BEFORE_BECOME_REPLICA --drained---> REPLICA
//! ```
//!
//! Signals that do not apply to the current role are no-ops. A failed
//! before-callback puts the node back in its previous role; the failure is
//! logged, returned to the sender, and kept as the monitor's last failure.
//! There is no automatic retry.

use std::sync::Arc;

use async_trait::async_trait;
use tandem_types::NodeRole;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, info};

use crate::error::TransitionError;

/// Queue depth for pending signals.
const SIGNAL_BUFFER: usize = 16;

/// The component whose role the monitor drives.
#[async_trait]
pub trait TransitionHandler: Send + Sync {
    /// Current role.
    fn role(&self) -> NodeRole;

    /// Store a new role.
    fn set_role(&self, role: NodeRole);

    /// Called in `BEFORE_BECOME_LEADER`; returns once the node may lead.
    async fn before_become_leader(&self) -> Result<(), TransitionError>;

    /// Called in `BEFORE_BECOME_REPLICA`; returns once no further leader
    /// emission can happen.
    async fn before_become_replica(&self) -> Result<(), TransitionError>;
}

/// An external leadership signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleSignal {
    /// This node has been elected leader.
    Promote,
    /// This node must follow another leader.
    Demote,
}

/// A queued signal with an optional reply channel.
#[derive(Debug)]
struct Command {
    signal: RoleSignal,
    reply: Option<oneshot::Sender<Result<NodeRole, TransitionError>>>,
}

/// Sequential processor of [`RoleSignal`]s.
pub struct LeadershipMonitor {
    handler: Arc<dyn TransitionHandler>,
    signals: mpsc::Receiver<Command>,
    last_failure: Arc<Mutex<Option<String>>>,
}

impl LeadershipMonitor {
    /// Create a monitor for `handler` and the handle used to signal it.
    pub fn new(handler: Arc<dyn TransitionHandler>) -> (Self, LeadershipHandle) {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let last_failure = Arc::new(Mutex::new(None));
        let monitor = Self {
            handler,
            signals: rx,
            last_failure: Arc::clone(&last_failure),
        };
        (monitor, LeadershipHandle { tx, last_failure })
    }

    /// Process signals until every [`LeadershipHandle`] has been dropped.
    pub async fn run(mut self) {
        info!("leadership monitor started");
        while let Some(command) = self.signals.recv().await {
            let outcome = self.handle(command.signal).await;
            if let Some(reply) = command.reply {
                // Fire-and-forget senders may have gone away.
                let _ = reply.send(outcome);
            }
        }
        info!("leadership monitor stopped");
    }

    async fn handle(&self, signal: RoleSignal) -> Result<NodeRole, TransitionError> {
        let current = self.handler.role();
        let (via, target) = match (signal, current) {
            (RoleSignal::Promote, NodeRole::None | NodeRole::Replica) => {
                (NodeRole::BeforeBecomeLeader, NodeRole::Leader)
            }
            (RoleSignal::Demote, NodeRole::None | NodeRole::Leader) => {
                (NodeRole::BeforeBecomeReplica, NodeRole::Replica)
            }
            _ => {
                debug!(?signal, role = %current, "signal does not apply to current role");
                return Ok(current);
            }
        };

        info!(from = %current, to = %target, "role transition started");
        self.handler.set_role(via);

        let callback = if target.is_leader() {
            self.handler.before_become_leader().await
        } else {
            self.handler.before_become_replica().await
        };

        match callback {
            Ok(()) => {
                self.handler.set_role(target);
                *self.last_failure.lock().await = None;
                info!(role = %target, "role transition completed");
                Ok(target)
            }
            Err(e) => {
                self.handler.set_role(current);
                error!(from = %current, to = %target, error = %e, "role transition failed; keeping previous role");
                *self.last_failure.lock().await = Some(format!("{current} -> {target}: {e}"));
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for LeadershipMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeadershipMonitor")
            .field("role", &self.handler.role())
            .finish_non_exhaustive()
    }
}

/// Cloneable sender side of the [`LeadershipMonitor`].
#[derive(Debug, Clone)]
pub struct LeadershipHandle {
    tx: mpsc::Sender<Command>,
    last_failure: Arc<Mutex<Option<String>>>,
}

impl LeadershipHandle {
    /// Send `signal` and wait for the resulting role.
    ///
    /// # Errors
    ///
    /// Returns the transition's [`TransitionError`], or
    /// [`TransitionError::MonitorClosed`] if the monitor is gone.
    pub async fn signal(&self, signal: RoleSignal) -> Result<NodeRole, TransitionError> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(Command {
                signal,
                reply: Some(reply),
            })
            .await
            .map_err(|e| TransitionError::MonitorClosed(e.to_string()))?;
        outcome
            .await
            .map_err(|e| TransitionError::MonitorClosed(e.to_string()))?
    }

    /// Promote this node and wait until it leads (or the promotion failed).
    ///
    /// # Errors
    ///
    /// See [`signal`](Self::signal).
    pub async fn promote(&self) -> Result<NodeRole, TransitionError> {
        self.signal(RoleSignal::Promote).await
    }

    /// Demote this node and wait until it is a replica.
    ///
    /// # Errors
    ///
    /// See [`signal`](Self::signal).
    pub async fn demote(&self) -> Result<NodeRole, TransitionError> {
        self.signal(RoleSignal::Demote).await
    }

    /// Queue a promotion without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::MonitorClosed`] if the signal could not be queued.
    pub fn notify_promote(&self) -> Result<(), TransitionError> {
        self.notify(RoleSignal::Promote)
    }

    /// Queue a demotion without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::MonitorClosed`] if the signal could not be queued.
    pub fn notify_demote(&self) -> Result<(), TransitionError> {
        self.notify(RoleSignal::Demote)
    }

    fn notify(&self, signal: RoleSignal) -> Result<(), TransitionError> {
        self.tx
            .try_send(Command {
                signal,
                reply: None,
            })
            .map_err(|e| TransitionError::MonitorClosed(e.to_string()))
    }

    /// The most recent transition failure, cleared by the next success.
    pub async fn last_failure(&self) -> Option<String> {
        self.last_failure.lock().await.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::role::RoleCell;

    #[derive(Default)]
    struct FakeHandler {
        role: RoleCell,
        fail_promotion: AtomicBool,
        role_during_callback: Mutex<Option<NodeRole>>,
    }

    #[async_trait]
    impl TransitionHandler for FakeHandler {
        fn role(&self) -> NodeRole {
            self.role.load()
        }

        fn set_role(&self, role: NodeRole) {
            self.role.swap(role);
        }

        async fn before_become_leader(&self) -> Result<(), TransitionError> {
            *self.role_during_callback.lock().await = Some(self.role.load());
            if self.fail_promotion.load(Ordering::Acquire) {
                return Err(TransitionError::Aborted(String::from("boom")));
            }
            Ok(())
        }

        async fn before_become_replica(&self) -> Result<(), TransitionError> {
            *self.role_during_callback.lock().await = Some(self.role.load());
            Ok(())
        }
    }

    fn spawn(handler: &Arc<FakeHandler>) -> LeadershipHandle {
        let (monitor, handle) = LeadershipMonitor::new(Arc::clone(handler) as Arc<dyn TransitionHandler>);
        tokio::spawn(monitor.run());
        handle
    }

    #[tokio::test]
    async fn promote_passes_through_before_become_leader() {
        let handler = Arc::new(FakeHandler::default());
        let handle = spawn(&handler);

        assert_eq!(handle.promote().await.unwrap(), NodeRole::Leader);
        assert_eq!(
            *handler.role_during_callback.lock().await,
            Some(NodeRole::BeforeBecomeLeader)
        );
        assert_eq!(handler.role(), NodeRole::Leader);

        assert_eq!(handle.demote().await.unwrap(), NodeRole::Replica);
        assert_eq!(
            *handler.role_during_callback.lock().await,
            Some(NodeRole::BeforeBecomeReplica)
        );
    }

    #[tokio::test]
    async fn inapplicable_signals_are_no_ops() {
        let handler = Arc::new(FakeHandler::default());
        let handle = spawn(&handler);

        handle.demote().await.unwrap();
        assert_eq!(handle.demote().await.unwrap(), NodeRole::Replica);
        handle.promote().await.unwrap();
        assert_eq!(handle.promote().await.unwrap(), NodeRole::Leader);
    }

    #[tokio::test]
    async fn failed_transition_keeps_previous_role() {
        let handler = Arc::new(FakeHandler::default());
        handler.fail_promotion.store(true, Ordering::Release);
        let handle = spawn(&handler);

        handle.demote().await.unwrap();
        let err = handle.promote().await.unwrap_err();
        assert!(matches!(err, TransitionError::Aborted(_)));
        assert_eq!(handler.role(), NodeRole::Replica);
        assert!(handle.last_failure().await.unwrap().contains("REPLICA -> LEADER"));

        handler.fail_promotion.store(false, Ordering::Release);
        handle.promote().await.unwrap();
        assert!(handle.last_failure().await.is_none());
    }

    #[tokio::test]
    async fn notify_signals_are_processed_in_order() {
        let handler = Arc::new(FakeHandler::default());
        let handle = spawn(&handler);

        handle.notify_promote().unwrap();
        handle.notify_demote().unwrap();
        // A synchronous signal queues behind the fire-and-forget ones.
        assert_eq!(handle.promote().await.unwrap(), NodeRole::Leader);
    }

    #[tokio::test]
    async fn closed_monitor_is_reported() {
        let handler = Arc::new(FakeHandler::default());
        let (monitor, handle) = LeadershipMonitor::new(handler);
        drop(monitor);
        assert!(matches!(
            handle.promote().await,
            Err(TransitionError::MonitorClosed(_))
        ));
    }
}

//! The consumer controller: two poll loops and role-dependent dispatch.
//!
//! The **events loop** reads the input events topic. On the leader each
//! event is evaluated by the session and a [`ControlMessage`] carrying the
//! resulting side effects is appended to the control log. On every other
//! role the loop waits for the control message with the same event id and
//! applies its recorded side effects instead of re-evaluating.
//!
//! The **control loop** reads the control log and buffers messages for the
//! events loop while the node is not the leader. Records that will never be
//! applied (undecodable, without an event id, or another copy of an emission
//! already seen) are marked skipped; the control cursor moves over a skipped
//! offset as soon as every offset before it is applied, so promotion
//! catch-up never waits on them.
//!
//! # Emission guard
//!
//! The session mutex is held across apply, emit, and cursor update. That
//! gives two properties:
//!
//! - Snapshots (taken under the same mutex) always pair a session state
//!   with the cursor position it reflects.
//! - Demotion takes the mutex after switching the role away from `LEADER`,
//!   so once it returns no further control message can be emitted.
//!
//! # Failure handling
//!
//! - Broker errors are logged and retried after a backoff; the cursor does
//!   not move, so nothing is skipped. A leader emission failing with a
//!   non-transient error halts the node instead.
//! - An abandoned leader emission leaves the session ahead of the cursor,
//!   so the snapshot coordinator is invalidated before the lock is released.
//! - A replica that cannot apply recorded side effects has diverged from the
//!   leader. The controller records the fault, stops both loops, and refuses
//!   promotion.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tandem_broker::{BrokerError, Producer};
use tandem_types::{ControlMessage, DomainEvent, NodeRole, Record, ResultMessage};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cursor::ConsumptionCursor;
use crate::error::{ControllerError, TransitionError};
use crate::leadership::TransitionHandler;
use crate::role::RoleCell;
use crate::session::SharedSession;
use crate::snapshot::SnapshotCoordinator;

/// Default wait per poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Default maximum records per poll.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Default pause before retrying a failed broker call.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// How many recent control messages the control loop remembers to
/// recognize retried emissions.
const DUPLICATE_WINDOW: usize = 1024;

/// Topics and timing for a [`ConsumerController`].
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Input events topic.
    pub events_topic: String,
    /// Control log topic.
    pub control_topic: String,
    /// Optional topic receiving a [`ResultMessage`] per leader evaluation.
    pub results_topic: Option<String>,
    /// How long each poll waits for records.
    pub poll_timeout: Duration,
    /// Maximum records fetched per poll.
    pub batch_size: usize,
    /// Pause before retrying a failed broker call.
    pub retry_backoff: Duration,
    /// Take a snapshot every this many applied events (0 disables).
    pub snapshot_every_events: u64,
}

impl ControllerSettings {
    /// Settings for the given topics with default timing.
    pub fn new(events_topic: impl Into<String>, control_topic: impl Into<String>) -> Self {
        Self {
            events_topic: events_topic.into(),
            control_topic: control_topic.into(),
            results_topic: None,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            snapshot_every_events: 0,
        }
    }
}

/// What became of one event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Applied (or skipped as already applied); move to the next record.
    Applied,
    /// The role changed under us; dispatch the record again.
    Redispatch,
    /// Stop was requested; leave the record unconsumed.
    Stopped,
}

/// Drives event and control consumption for one node.
pub struct ConsumerController {
    settings: ControllerSettings,
    producer: Producer,
    session: SharedSession,
    role: RoleCell,
    cursor: ConsumptionCursor,
    snapshots: Arc<SnapshotCoordinator>,
    /// Control messages consumed but not yet applied, by event id.
    pending: Mutex<HashMap<String, VecDeque<ControlMessage>>>,
    /// Control offsets above the cursor that carry nothing to apply.
    skipped: Mutex<BTreeSet<u64>>,
    /// Woken when a control message is buffered, the role changes, or stop
    /// is requested.
    control_arrived: Notify,
    stop_requested: AtomicBool,
    stop_notify: Notify,
    fault: OnceLock<String>,
    applied_since_snapshot: AtomicU64,
    started: AtomicBool,
    loops: Mutex<Vec<JoinHandle<Result<(), ControllerError>>>>,
}

impl ConsumerController {
    /// Create a controller. Nothing runs until [`start`](Self::start).
    ///
    /// The cursor should already reflect any restored snapshot.
    pub fn new(
        settings: ControllerSettings,
        producer: Producer,
        session: SharedSession,
        cursor: ConsumptionCursor,
        snapshots: Arc<SnapshotCoordinator>,
    ) -> Self {
        Self {
            settings,
            producer,
            session,
            role: RoleCell::default(),
            cursor,
            snapshots,
            pending: Mutex::new(HashMap::new()),
            skipped: Mutex::new(BTreeSet::new()),
            control_arrived: Notify::new(),
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
            fault: OnceLock::new(),
            applied_since_snapshot: AtomicU64::new(0),
            started: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the events and control poll loops.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::AlreadyStarted`] on a second call.
    pub async fn start(self: &Arc<Self>) -> Result<(), ControllerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ControllerError::AlreadyStarted);
        }
        let position = self.cursor.position();
        info!(
            events_topic = self.settings.events_topic,
            control_topic = self.settings.control_topic,
            events_from = position.events.saturating_add(1),
            control_from = position.control.saturating_add(1),
            "consumer controller starting"
        );
        let events = tokio::spawn(Arc::clone(self).run_events_loop());
        let control = tokio::spawn(Arc::clone(self).run_control_loop());
        self.loops.lock().await.extend([events, control]);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Current role.
    pub fn current_role(&self) -> NodeRole {
        self.role.load()
    }

    /// The consumption cursor.
    pub const fn cursor(&self) -> &ConsumptionCursor {
        &self.cursor
    }

    /// The shared session.
    pub const fn session(&self) -> &SharedSession {
        &self.session
    }

    /// The snapshot coordinator.
    pub const fn snapshots(&self) -> &Arc<SnapshotCoordinator> {
        &self.snapshots
    }

    /// Topics and timing.
    pub const fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// The failure that halted consumption (a divergence or an unrecoverable
    /// emission), if any.
    pub fn fault(&self) -> Option<&str> {
        self.fault.get().map(String::as_str)
    }

    /// Wait until the control cursor reaches `target`.
    pub async fn wait_for_control_catch_up(&self, target: u64) {
        self.cursor.wait_for_control(target).await;
    }

    // -----------------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------------

    /// Ask both loops to exit. They notice within one poll interval.
    pub fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::AcqRel) {
            info!("consumer controller stop requested");
        }
        self.stop_notify.notify_waiters();
        self.control_arrived.notify_waiters();
    }

    /// Whether stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Wait for both loops to finish.
    ///
    /// # Errors
    ///
    /// Returns the first loop error (e.g. a replica divergence).
    pub async fn join(&self) -> Result<(), ControllerError> {
        let handles: Vec<_> = self.loops.lock().await.drain(..).collect();
        let mut outcome = Ok(());
        for handle in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(ControllerError::Join(e.to_string())),
            };
            outcome = outcome.and(result);
        }
        outcome
    }

    /// Request stop and wait for both loops to finish.
    ///
    /// # Errors
    ///
    /// See [`join`](Self::join).
    pub async fn stop(&self) -> Result<(), ControllerError> {
        self.request_stop();
        self.join().await
    }

    async fn stopped(&self) {
        loop {
            let notified = self.stop_notify.notified();
            if self.is_stop_requested() {
                return;
            }
            notified.await;
        }
    }

    async fn backoff(&self) {
        tokio::select! {
            () = tokio::time::sleep(self.settings.retry_backoff) => {}
            () = self.stopped() => {}
        }
    }

    fn halt(&self, reason: String) {
        // Only the first divergence is kept.
        let _ = self.fault.set(reason);
        self.request_stop();
    }

    // -----------------------------------------------------------------------
    // Control loop
    // -----------------------------------------------------------------------

    async fn run_control_loop(self: Arc<Self>) -> Result<(), ControllerError> {
        let topic = self.settings.control_topic.as_str();
        let broker = Arc::clone(self.producer.broker());
        let mut next = self.cursor.control().saturating_add(1);
        let mut recent: VecDeque<ControlMessage> = VecDeque::with_capacity(DUPLICATE_WINDOW);

        while !self.is_stop_requested() {
            let batch = match broker
                .poll(topic, next, self.settings.batch_size, self.settings.poll_timeout)
                .await
            {
                Ok(batch) => batch,
                Err(BrokerError::Closed) => break,
                Err(e) => {
                    warn!(topic, error = %e, "control poll failed; retrying");
                    self.backoff().await;
                    continue;
                }
            };
            for record in batch {
                next = record.offset.saturating_add(1);
                let message = match ControlMessage::from_record(&record) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(topic, offset = record.offset, error = %e, "skipping undecodable control record");
                        self.skip_control(record.offset).await;
                        continue;
                    }
                };
                if recent.iter().any(|seen| seen.same_emission(&message)) {
                    warn!(topic, offset = record.offset, event_id = ?message.id, "skipping duplicate control record");
                    self.skip_control(record.offset).await;
                    continue;
                }
                if recent.len() >= DUPLICATE_WINDOW {
                    recent.pop_front();
                }
                recent.push_back(message.clone());
                self.on_control_message(message).await;
            }
        }
        info!(topic, "control loop stopped");
        Ok(())
    }

    async fn on_control_message(&self, message: ControlMessage) {
        if message.offset <= self.cursor.control() {
            return;
        }
        let Some(event_id) = message.id.clone() else {
            warn!(offset = message.offset, "control message without event id ignored");
            self.skip_control(message.offset).await;
            return;
        };

        if self.role.load().is_leader() {
            // Our own emission can arrive before the cursor moves; the
            // session lock orders this check after it.
            let _guard = self.session.lock().await;
            if message.offset > self.cursor.control() {
                warn!(offset = message.offset, event_id, "foreign control message seen while leader");
            }
            return;
        }

        self.pending
            .lock()
            .await
            .entry(event_id)
            .or_default()
            .push_back(message);
        self.control_arrived.notify_waiters();
    }

    /// Mark `offset` as carrying nothing to apply and settle the cursor.
    async fn skip_control(&self, offset: u64) {
        let mut skipped = self.skipped.lock().await;
        skipped.insert(offset);
        self.settle(&mut skipped);
    }

    /// Advance the control cursor over skipped offsets that directly follow
    /// it, and forget skipped offsets it has already passed.
    fn settle(&self, skipped: &mut BTreeSet<u64>) {
        loop {
            let next = self.cursor.control().saturating_add(1);
            *skipped = skipped.split_off(&next);
            if !skipped.remove(&next) {
                break;
            }
            debug!(offset = next, "control cursor moved over skipped record");
            self.cursor.commit_control(next);
        }
    }

    async fn settle_skipped(&self) {
        let mut skipped = self.skipped.lock().await;
        if !skipped.is_empty() {
            self.settle(&mut skipped);
        }
    }

    /// Take the oldest unapplied control message for `event_id`.
    async fn take_pending(&self, event_id: &str) -> Option<ControlMessage> {
        let applied = self.cursor.control();
        let mut pending = self.pending.lock().await;
        let queue = pending.get_mut(event_id)?;
        let mut found = None;
        while let Some(message) = queue.pop_front() {
            if message.offset > applied {
                found = Some(message);
                break;
            }
        }
        if queue.is_empty() {
            pending.remove(event_id);
        }
        found
    }

    /// Wait up to one poll interval for the control message of `event_id`.
    async fn wait_for_control_message(&self, event_id: &str) -> Option<ControlMessage> {
        let arrived = self.control_arrived.notified();
        if let Some(message) = self.take_pending(event_id).await {
            return Some(message);
        }
        if self.is_stop_requested() || self.role.load().is_leader() {
            return None;
        }
        let _ = tokio::time::timeout(self.settings.poll_timeout, arrived).await;
        self.take_pending(event_id).await
    }

    // -----------------------------------------------------------------------
    // Events loop
    // -----------------------------------------------------------------------

    async fn run_events_loop(self: Arc<Self>) -> Result<(), ControllerError> {
        let topic = self.settings.events_topic.as_str();
        let broker = Arc::clone(self.producer.broker());
        let mut next = self.cursor.events().saturating_add(1);

        'poll: while !self.is_stop_requested() {
            let batch = match broker
                .poll(topic, next, self.settings.batch_size, self.settings.poll_timeout)
                .await
            {
                Ok(batch) => batch,
                Err(BrokerError::Closed) => break,
                Err(e) => {
                    warn!(topic, error = %e, "events poll failed; retrying");
                    self.backoff().await;
                    continue;
                }
            };
            for record in batch {
                match self.process_event(&record).await? {
                    Step::Applied => next = record.offset.saturating_add(1),
                    Step::Stopped | Step::Redispatch => break 'poll,
                }
            }
        }
        info!(topic, "events loop stopped");
        Ok(())
    }

    async fn process_event(&self, record: &Record) -> Result<Step, ControllerError> {
        let event = match DomainEvent::from_record(record) {
            Ok(event) => event,
            Err(e) => {
                warn!(offset = record.offset, error = %e, "skipping undecodable event");
                self.cursor.commit_events(record.offset);
                return Ok(Step::Applied);
            }
        };

        loop {
            if self.is_stop_requested() {
                return Ok(Step::Stopped);
            }
            if self.role.load().is_leader() {
                match self.evaluate_as_leader(record.offset, &event).await? {
                    Step::Redispatch => continue,
                    step => return Ok(step),
                }
            }
            if let Some(message) = self.wait_for_control_message(&event.id).await {
                self.apply_recorded(record.offset, &event, &message).await?;
                return Ok(Step::Applied);
            }
        }
    }

    async fn evaluate_as_leader(
        &self,
        events_offset: u64,
        event: &DomainEvent,
    ) -> Result<Step, ControllerError> {
        let mut session = self.session.lock().await;
        if !self.role.load().is_leader() {
            return Ok(Step::Redispatch);
        }

        let effects = match session.apply(event, None) {
            Ok(effects) => effects,
            Err(e) => {
                // Recorded with no side effects so every replica skips it too.
                warn!(event_id = event.id, offset = events_offset, error = %e, "session rejected event");
                Vec::new()
            }
        };

        let message = ControlMessage::for_event(&event.id, effects, tandem_types::now_millis());
        let control_offset = match self
            .emit(&self.settings.control_topic, &event.id, &message)
            .await
        {
            Ok(Some(offset)) => offset,
            Ok(None) => {
                self.snapshots
                    .invalidate(format!("event {} applied but its emission was abandoned", event.id));
                return Ok(Step::Stopped);
            }
            Err(e) => {
                self.snapshots
                    .invalidate(format!("event {} applied but could not be recorded", event.id));
                error!(event_id = event.id, error = %e, "control message cannot be emitted; halting consumption");
                self.halt(e.to_string());
                return Err(e);
            }
        };

        if let Some(results_topic) = &self.settings.results_topic {
            let result = ResultMessage {
                event_id: event.id.clone(),
                offset: control_offset,
                side_effects: message.effects().to_vec(),
            };
            if let Err(e) = self.producer.produce_sync(results_topic, &event.id, &result).await {
                warn!(topic = results_topic, event_id = event.id, error = %e, "result publish failed");
            }
        }

        self.cursor.commit(events_offset, control_offset);
        drop(session);

        debug!(event_id = event.id, events_offset, control_offset, "event evaluated as leader");
        self.note_applied();
        Ok(Step::Applied)
    }

    /// Produce until acknowledged.
    ///
    /// `Ok(None)` means the emission was abandoned because stop was requested
    /// or the broker closed. Non-transient failures are returned.
    async fn emit<T: Serialize + Sync>(
        &self,
        topic: &str,
        key: &str,
        message: &T,
    ) -> Result<Option<u64>, ControllerError> {
        loop {
            match self.producer.produce_sync(topic, key, message).await {
                Ok(offset) => return Ok(Some(offset)),
                Err(BrokerError::Closed) => {
                    warn!(topic, key, "emission abandoned; broker closed");
                    return Ok(None);
                }
                Err(e) if !e.is_transient() => return Err(ControllerError::Broker(e)),
                Err(e) if self.is_stop_requested() => {
                    warn!(topic, key, error = %e, "emission abandoned on shutdown");
                    return Ok(None);
                }
                Err(e) => {
                    warn!(topic, key, error = %e, "emission failed; retrying");
                    self.backoff().await;
                }
            }
        }
    }

    async fn apply_recorded(
        &self,
        events_offset: u64,
        event: &DomainEvent,
        message: &ControlMessage,
    ) -> Result<(), ControllerError> {
        let mut session = self.session.lock().await;
        if message.offset <= self.cursor.control() {
            debug!(event_id = event.id, offset = message.offset, "control message already applied");
            self.cursor.commit_events(events_offset);
            return Ok(());
        }

        if let Err(e) = session.apply(event, Some(message.effects())) {
            let fault = ControllerError::Divergence {
                event_id: event.id.clone(),
                offset: message.offset,
                reason: e.to_string(),
            };
            error!(
                event_id = event.id,
                offset = message.offset,
                error = %e,
                "replica cannot apply recorded side effects; halting consumption"
            );
            self.halt(fault.to_string());
            return Err(fault);
        }

        self.cursor.commit(events_offset, message.offset);
        drop(session);
        self.settle_skipped().await;

        debug!(event_id = event.id, events_offset, control_offset = message.offset, "event applied from control log");
        self.note_applied();
        Ok(())
    }

    fn note_applied(&self) {
        let every = self.settings.snapshot_every_events;
        if every == 0 {
            return;
        }
        let applied = self
            .applied_since_snapshot
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        if applied < every {
            return;
        }
        self.applied_since_snapshot.store(0, Ordering::Release);

        let snapshots = Arc::clone(&self.snapshots);
        tokio::spawn(async move {
            if let Err(e) = snapshots.snapshot_now().await {
                warn!(error = %e, "periodic snapshot failed; will retry at next trigger");
            }
        });
    }
}

#[async_trait]
impl TransitionHandler for ConsumerController {
    fn role(&self) -> NodeRole {
        self.role.load()
    }

    fn set_role(&self, role: NodeRole) {
        let previous = self.role.swap(role);
        debug!(from = %previous, to = %role, "role set");
        self.control_arrived.notify_waiters();
    }

    async fn before_become_leader(&self) -> Result<(), TransitionError> {
        if let Some(fault) = self.fault() {
            return Err(TransitionError::Faulted(fault.to_owned()));
        }
        let target = self
            .producer
            .broker()
            .end_offset(&self.settings.control_topic)
            .await?;
        info!(target, applied = self.cursor.control(), "catching up on control log before promotion");

        tokio::select! {
            () = self.cursor.wait_for_control(target) => {}
            () = self.stopped() => {
                return Err(TransitionError::Aborted(String::from("stop requested during catch-up")));
            }
        }
        info!(target, "control log caught up");
        Ok(())
    }

    async fn before_become_replica(&self) -> Result<(), TransitionError> {
        // The role is no longer LEADER; wait out any emission holding the lock.
        drop(self.session.lock().await);
        info!(applied = self.cursor.control(), "leader emission drained");
        Ok(())
    }
}

impl std::fmt::Debug for ConsumerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerController")
            .field("settings", &self.settings)
            .field("role", &self.role.load())
            .field("cursor", &self.cursor.position())
            .field("fault", &self.fault.get())
            .finish_non_exhaustive()
    }
}

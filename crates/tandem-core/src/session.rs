//! The evaluation session seam and a reference key/value session.
//!
//! The core never interprets events or side effects. It calls
//! [`Session::apply`] in one of two modes:
//!
//! - **Leader** (`recorded = None`): evaluate the event and return the side
//!   effects produced. These are recorded in a control message.
//! - **Replica** (`recorded = Some(..)`): reproduce the leader's state change
//!   from the recorded side effects alone, without re-deriving them.
//!
//! An `apply` that returns an error must leave the session unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tandem_types::{DomainEvent, SideEffect};
use tokio::sync::Mutex;

use crate::error::SessionError;

/// A stateful evaluation session driven by the replication core.
pub trait Session: Send + std::fmt::Debug {
    /// Apply one event.
    ///
    /// With `recorded = None` the session evaluates the event and returns the
    /// side effects it produced. With `recorded = Some(effects)` it applies
    /// the given effects and returns them unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the event or the recorded effects are
    /// rejected. State must be left untouched in that case.
    fn apply(
        &mut self,
        event: &DomainEvent,
        recorded: Option<&[SideEffect]>,
    ) -> Result<Vec<SideEffect>, SessionError>;

    /// Serialize the full session state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the state cannot be serialized.
    fn snapshot(&self) -> Result<Vec<u8>, SessionError>;

    /// Replace the session state with a previously captured snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::CorruptSnapshot`] if the payload is invalid.
    fn restore(&mut self, payload: &[u8]) -> Result<(), SessionError>;
}

/// A session shared between the poll loops and the snapshot coordinator.
///
/// The mutex is the emission guard: whoever holds it may apply, emit, and
/// move the cursor; snapshots taken under it are never torn.
pub type SharedSession = Arc<Mutex<dyn Session>>;

/// Wrap a session for sharing.
pub fn shared<S: Session + 'static>(session: S) -> SharedSession {
    Arc::new(Mutex::new(session))
}

// ---------------------------------------------------------------------------
// Key/value reference session
// ---------------------------------------------------------------------------

/// Side-effect kind emitted by [`KvSession`].
pub const KV_WRITE: &str = "kv.write";

/// Commands accepted in a [`KvSession`] event payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum KvCommand {
    Set {
        key: String,
        value: serde_json::Value,
    },
    Add {
        key: String,
        delta: i64,
    },
    Delete {
        key: String,
    },
}

/// Payload of a [`KV_WRITE`] side effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvWrite {
    key: String,
    /// New value, or `None` for a delete.
    value: Option<serde_json::Value>,
    revision: String,
}

/// A stored value together with the revision that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvEntry {
    /// Current value.
    pub value: serde_json::Value,
    /// Revision id assigned by the leader when the value was written.
    pub revision: String,
}

/// Key/value ledger session.
///
/// Events carry `{"op": "set" | "add" | "delete", "key": .., ...}`. Leader
/// evaluation stamps every write with a fresh time-ordered UUID revision, so
/// a replica only ends up identical to the leader if it applies recorded
/// side effects rather than re-evaluating.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvSession {
    entries: BTreeMap<String, KvEntry>,
}

impl KvSession {
    /// Create an empty session.
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Revision that last wrote `key`.
    pub fn revision(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|entry| entry.revision.as_str())
    }

    /// All entries, ordered by key.
    pub const fn entries(&self) -> &BTreeMap<String, KvEntry> {
        &self.entries
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evaluate(&self, event: &DomainEvent) -> Result<KvWrite, SessionError> {
        let invalid = |reason: String| SessionError::InvalidEvent {
            id: event.id.clone(),
            reason,
        };
        let command: KvCommand =
            serde_json::from_value(event.payload.clone()).map_err(|e| invalid(e.to_string()))?;
        let revision = uuid::Uuid::now_v7().to_string();

        let write = match command {
            KvCommand::Set { key, value } => KvWrite {
                key,
                value: Some(value),
                revision,
            },
            KvCommand::Add { key, delta } => {
                let current = match self.get(&key) {
                    None => 0,
                    Some(value) => value
                        .as_i64()
                        .ok_or_else(|| invalid(format!("value of {key} is not an integer")))?,
                };
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| invalid(format!("adding {delta} to {key} overflows")))?;
                KvWrite {
                    key,
                    value: Some(serde_json::Value::from(next)),
                    revision,
                }
            }
            KvCommand::Delete { key } => KvWrite {
                key,
                value: None,
                revision,
            },
        };
        Ok(write)
    }

    fn write(&mut self, write: KvWrite) {
        match write.value {
            Some(value) => {
                self.entries.insert(
                    write.key,
                    KvEntry {
                        value,
                        revision: write.revision,
                    },
                );
            }
            None => {
                self.entries.remove(&write.key);
            }
        }
    }
}

impl Session for KvSession {
    fn apply(
        &mut self,
        event: &DomainEvent,
        recorded: Option<&[SideEffect]>,
    ) -> Result<Vec<SideEffect>, SessionError> {
        if let Some(effects) = recorded {
            // Validate everything first so a rejection leaves state untouched.
            let writes = effects
                .iter()
                .map(|effect| {
                    if effect.kind != KV_WRITE {
                        return Err(SessionError::RejectedEffects {
                            id: event.id.clone(),
                            reason: format!("unknown side effect kind {}", effect.kind),
                        });
                    }
                    serde_json::from_value::<KvWrite>(effect.payload.clone()).map_err(|e| {
                        SessionError::RejectedEffects {
                            id: event.id.clone(),
                            reason: e.to_string(),
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            for write in writes {
                self.write(write);
            }
            return Ok(effects.to_vec());
        }

        let write = self.evaluate(event)?;
        let effect = SideEffect::new(KV_WRITE, serde_json::to_value(&write)?);
        self.write(write);
        Ok(vec![effect])
    }

    fn snapshot(&self) -> Result<Vec<u8>, SessionError> {
        Ok(serde_json::to_vec(&self.entries)?)
    }

    fn restore(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        if payload.is_empty() {
            self.entries.clear();
            return Ok(());
        }
        self.entries = serde_json::from_slice(payload)
            .map_err(|e| SessionError::CorruptSnapshot(e.to_string()))?;
        Ok(())
    }
}

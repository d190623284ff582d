//! Node role states.

use serde::{Deserialize, Serialize};

/// The replication role a node currently holds.
///
/// Exactly one node cluster-wide should observe [`NodeRole::Leader`] at a
/// time. That is assumed from the external coordination signal; the core
/// never arbitrates split-brain itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// No role assigned yet.
    #[default]
    None,
    /// Promotion in progress: catching up on the control log.
    BeforeBecomeLeader,
    /// Authoritative: evaluates events and emits control messages.
    Leader,
    /// Demotion in progress: draining in-flight leader emission.
    BeforeBecomeReplica,
    /// Mirrors leader state from the control log.
    Replica,
}

impl NodeRole {
    /// Compact encoding used for atomic storage.
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::BeforeBecomeLeader => 1,
            Self::Leader => 2,
            Self::BeforeBecomeReplica => 3,
            Self::Replica => 4,
        }
    }

    /// Inverse of [`as_u8`](Self::as_u8). Unknown values decode as `None`.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::BeforeBecomeLeader,
            2 => Self::Leader,
            3 => Self::BeforeBecomeReplica,
            4 => Self::Replica,
            _ => Self::None,
        }
    }

    /// Whether this node may evaluate events and emit control messages.
    pub const fn is_leader(self) -> bool {
        matches!(self, Self::Leader)
    }

    /// Whether a transition is in progress.
    pub const fn is_transitioning(self) -> bool {
        matches!(self, Self::BeforeBecomeLeader | Self::BeforeBecomeReplica)
    }
}

impl core::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::BeforeBecomeLeader => "BEFORE_BECOME_LEADER",
            Self::Leader => "LEADER",
            Self::BeforeBecomeReplica => "BEFORE_BECOME_REPLICA",
            Self::Replica => "REPLICA",
        };
        f.write_str(name)
    }
}

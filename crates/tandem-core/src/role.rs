//! Lock-free holder for the node's current role.

use std::sync::atomic::{AtomicU8, Ordering};

use tandem_types::NodeRole;

/// Atomic [`NodeRole`] cell read once per record by the poll loops.
#[derive(Debug, Default)]
pub struct RoleCell(AtomicU8);

impl RoleCell {
    /// A cell holding `role`.
    pub const fn new(role: NodeRole) -> Self {
        Self(AtomicU8::new(role.as_u8()))
    }

    /// Current role.
    pub fn load(&self) -> NodeRole {
        NodeRole::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Replace the role, returning the previous one.
    pub fn swap(&self, role: NodeRole) -> NodeRole {
        NodeRole::from_u8(self.0.swap(role.as_u8(), Ordering::AcqRel))
    }
}

//! Leadership announcements over a plain NATS subject.
//!
//! An external coordinator publishes the current leader's node id on a
//! subject. Every node compares it with its own id and queues a promote or
//! demote signal; the leadership monitor ignores signals that do not apply.

use futures::StreamExt as _;
use tandem_core::{LeadershipHandle, RoleSignal};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::EngineError;

/// Map a leadership announcement to the signal for `node_id`.
pub fn signal_for(node_id: &str, announced_leader: &str) -> RoleSignal {
    if announced_leader.trim() == node_id {
        RoleSignal::Promote
    } else {
        RoleSignal::Demote
    }
}

/// Subscribe to `subject`.
///
/// # Errors
///
/// Returns [`EngineError::Nats`] if the subscription cannot be created.
pub async fn subscribe(
    client: &async_nats::Client,
    subject: &str,
) -> Result<async_nats::Subscriber, EngineError> {
    client
        .subscribe(subject.to_owned())
        .await
        .map_err(|e| EngineError::Nats {
            message: format!("failed to subscribe to {subject}: {e}"),
        })
}

/// Forward announcements from `subscriber` to `leadership` until the
/// subscription ends.
pub fn spawn(
    mut subscriber: async_nats::Subscriber,
    node_id: String,
    leadership: LeadershipHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(node_id, "listening for leadership announcements");
        while let Some(message) = subscriber.next().await {
            let announced = String::from_utf8_lossy(&message.payload);
            let signal = signal_for(&node_id, &announced);
            info!(leader = %announced.trim(), ?signal, "leadership announcement received");
            let queued = match signal {
                RoleSignal::Promote => leadership.notify_promote(),
                RoleSignal::Demote => leadership.notify_demote(),
            };
            if let Err(e) = queued {
                warn!(error = %e, "could not queue leadership signal");
            }
        }
        info!("leadership subscription closed");
    })
}

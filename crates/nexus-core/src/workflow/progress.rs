//! Progress reporting for workflow execution.
//!
//! The executor reports every step and plan transition to an optional
//! [`ProgressSink`]. Sinks are observational only: a slow or absent
//! consumer never affects execution.

use nexus_types::event::WorkflowProgressEvent;
use tokio::sync::broadcast;

/// Receives progress events. Must not block.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: WorkflowProgressEvent);
}

/// Broadcast bus for progress events.
///
/// Wraps a `tokio::sync::broadcast` channel. Cloning the bus clones the
/// sender, allowing multiple producers and consumers. Publishing with no
/// active subscribers is a no-op.
pub struct ProgressBus {
    sender: broadcast::Sender<WorkflowProgressEvent>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowProgressEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: WorkflowProgressEvent) {
        let _ = self.sender.send(event);
    }
}

impl ProgressSink for ProgressBus {
    fn emit(&self, event: WorkflowProgressEvent) {
        self.publish(event);
    }
}

impl Clone for ProgressBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

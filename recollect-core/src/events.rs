//! Domain events for UI layers.
//!
//! The engine never touches presentation. It publishes [`MemoryEvent`]s on a
//! broadcast channel; a host refreshes its views from whatever it receives.

use crate::config::ConsolidationShape;
use crate::store::ScopeId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const BUFFER_CAPACITY: usize = 256;

/// Something that happened to the memory of a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MemoryEvent {
    /// A consolidation left `Idle`.
    ConsolidationStarted {
        scope: ScopeId,
        pending: usize,
        shape: ConsolidationShape,
    },
    /// Memory changed and was persisted.
    MemoryUpdated { scope: ScopeId, cursor: usize },
    /// A consolidation failed; memory is unchanged.
    ConsolidationFailed { scope: ScopeId, error: String },
    /// Memory of the scope was wiped.
    Wiped { scope: ScopeId },
    /// Excluded messages were sent to the archive.
    MessagesArchived { scope: ScopeId, count: usize },
}

impl MemoryEvent {
    /// The scope the event belongs to.
    pub fn scope(&self) -> &ScopeId {
        match self {
            MemoryEvent::ConsolidationStarted { scope, .. }
            | MemoryEvent::MemoryUpdated { scope, .. }
            | MemoryEvent::ConsolidationFailed { scope, .. }
            | MemoryEvent::Wiped { scope }
            | MemoryEvent::MessagesArchived { scope, .. } => scope,
        }
    }
}

/// Broadcast channel of [`MemoryEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MemoryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default buffer.
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(BUFFER_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: MemoryEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.sender.subscribe()
    }
}

// Session event bus

use tokio::sync::broadcast;

use super::types::SessionEvent;

/// Fire-and-forget channel announcing session-wide state changes
pub trait SessionEventBus: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

/// Event bus fanning out to every subscriber through a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(16)
    }
}

impl SessionEventBus for BroadcastEventBus {
    fn emit(&self, event: SessionEvent) {
        tracing::info!(event = event.name(), "Emitting session event");
        // No subscribers is not an error
        if self.sender.send(event).is_err() {
            tracing::debug!(event = event.name(), "Session event had no subscribers");
        }
    }
}

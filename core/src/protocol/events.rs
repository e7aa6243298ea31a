//! Protocol notifications for UIs and operators

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use super::level::{Level, Transition};

const EVENT_BACKLOG: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProtocolEvent {
    LevelChanged {
        network: String,
        from: Level,
        to: Level,
    },
    CacheUpdated {
        network: String,
        update_id: u64,
    },
    LeaderElected {
        network: String,
        leader: String,
    },
    /// Another node announced itself leader while we hold the role
    SplitLeader {
        network: String,
        other: String,
    },
    PeerLeft {
        network: String,
        peer: String,
    },
}

impl ProtocolEvent {
    pub fn network(&self) -> &str {
        match self {
            ProtocolEvent::LevelChanged { network, .. }
            | ProtocolEvent::CacheUpdated { network, .. }
            | ProtocolEvent::LeaderElected { network, .. }
            | ProtocolEvent::SplitLeader { network, .. }
            | ProtocolEvent::PeerLeft { network, .. } => network,
        }
    }
}

/// Fan-out of protocol events. Emitting with no subscriber is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProtocolEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BACKLOG);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ProtocolEvent) {
        trace!(?event, "protocol event");
        let _ = self.tx.send(event);
    }

    pub fn level_changed(&self, network: &str, transition: Transition) {
        self.emit(ProtocolEvent::LevelChanged {
            network: network.to_string(),
            from: transition.from,
            to: transition.to,
        });
    }
}

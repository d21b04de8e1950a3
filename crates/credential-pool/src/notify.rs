//! Fire-and-forget state change notifications
//!
//! Dashboards subscribe to a broadcast channel. Nothing waits on delivery:
//! with no subscriber, or a lagging one, events are simply dropped.

use provider::ErrorCategory;
use tokio::sync::broadcast;

use crate::model::{CredentialId, UserId};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    CredentialChanged {
        id: CredentialId,
    },
    UserChanged {
        id: UserId,
    },
    UsageLogged {
        user_id: UserId,
        model: String,
        status: u16,
        category: Option<ErrorCategory>,
    },
    JobChanged {
        id: String,
    },
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<StateChange>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn notify(&self, change: StateChange) {
        // Err only means nobody is listening.
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.tx.subscribe()
    }
}

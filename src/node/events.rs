//! Chain and pool notifications
//!
//! Events are published on a broadcast channel after the state lock is
//! released, in the order the changes were committed. Slow subscribers
//! lose the oldest events rather than blocking the core.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::crypto::Hash;

/// Events buffered per subscriber before it starts lagging
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A committed change to the chain or the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    BlockAdded { hash: Hash, height: u64 },
    AlternativeBlockAdded { hash: Hash, height: u64 },
    ChainSwitched { fork_height: u64, top_hash: Hash, top_height: u64 },
    ChainRolledBack { height: u64 },
    TransactionAdded { hash: Hash },
    TransactionsRemoved { hashes: Vec<Hash> },
}

/// Sending half shared by the core
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Publish `events` in order; no subscribers is not an error
    pub fn publish(&self, events: Vec<CoreEvent>) {
        for event in events {
            let _ = self.sender.send(event);
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_delivered_in_order() {
        let sink = EventSink::default();
        let mut rx = sink.subscribe();
        sink.publish(vec![
            CoreEvent::BlockAdded { hash: Hash::zero(), height: 1 },
            CoreEvent::ChainRolledBack { height: 0 },
        ]);
        assert_eq!(rx.try_recv().unwrap(), CoreEvent::BlockAdded { hash: Hash::zero(), height: 1 });
        assert_eq!(rx.try_recv().unwrap(), CoreEvent::ChainRolledBack { height: 0 });
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventSink::default().publish(vec![CoreEvent::TransactionAdded { hash: Hash::zero() }]);
    }
}

//! Message bus for cross-component notifications.
//!
//! Subscribers register a channel and receive every event published after
//! registration. Disconnected subscribers are pruned on publish. The peer
//! networking layer listens for `BroadcastBlock`; the RPC/pool layers listen
//! for `NewBlock` and `TransactionsSaved`.

use crate::block::{Block, ReducedBlock};
use crate::types::Hash;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A block was applied and committed; the register already points at it.
    NewBlock(Arc<Block>),
    /// Header-only broadcast request for the peer network.
    BroadcastBlock(ReducedBlock),
    /// The listed transactions were durably committed with a block.
    TransactionsSaved(Vec<Hash>),
}

#[derive(Clone, Default)]
pub struct MessageBus {
    subscribers: Arc<RwLock<Vec<Sender<ChainEvent>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. The receiver sees every event published after
    /// this call.
    pub fn subscribe(&self) -> Receiver<ChainEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.write().push(tx);
        rx
    }

    /// Fan the event out to all live subscribers, dropping disconnected ones.
    pub fn publish(&self, event: ChainEvent) {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if subscribers.len() != before {
            debug!(
                pruned = before - subscribers.len(),
                remaining = subscribers.len(),
                "pruned disconnected bus subscribers"
            );
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

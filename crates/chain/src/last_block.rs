//! Last-block register: the single source of truth for "what is our height?".
//!
//! One process-wide slot holding the current tip. Writes happen only inside
//! the chain mutator at its commit boundaries; everyone else is read-only.

use crate::block::Block;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct LastBlockRegister {
    slot: Arc<RwLock<Option<Arc<Block>>>>,
}

impl LastBlockRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current tip; `None` until the chain is bootstrapped from genesis.
    pub fn get(&self) -> Option<Arc<Block>> {
        self.slot.read().clone()
    }

    /// Replace the tip. Last writer wins under the mutator's exclusion.
    pub fn set(&self, block: Arc<Block>) {
        *self.slot.write() = Some(block);
    }

    pub fn height(&self) -> Option<u64> {
        self.slot.read().as_ref().map(|b| b.height)
    }
}

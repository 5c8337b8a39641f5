//! Round controller: forward/backward tick semantics at round boundaries.
//!
//! A round is a fixed-length window of consecutive blocks used for delegate
//! bookkeeping. The chain mutator calls the ticks inside the same write
//! transaction as the block write/delete that triggered them; a tick failure
//! there is fatal for the node.

use crate::block::Block;
use crate::error::{ChainError, StoreError};
use crate::store::ChainStore;
use crate::types::PublicKey;
use lmdb::RwTransaction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Blocks per round.
pub const DEFAULT_ROUND_LENGTH: u64 = 101;

/// Forward/backward tick interface consumed by the chain mutator. Both ticks
/// must complete inside the caller's write transaction.
pub trait RoundController: Send + Sync {
    /// Advance round bookkeeping for a newly applied block.
    fn forward_tick(&self, block: &Block, txn: &mut RwTransaction<'_>) -> Result<(), ChainError>;

    /// Walk round bookkeeping one block backwards. `new_tip` is the block
    /// that becomes the tip after the deletion.
    fn backward_tick(
        &self,
        old_block: &Block,
        new_tip: &Block,
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), ChainError>;
}

/// Generator slots of one (possibly still open) round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RoundSlots {
    generators: Vec<PublicKey>,
}

/// DPoS round bookkeeping over the `rounds` and `delegates` tables.
pub struct DposRounds {
    store: Arc<ChainStore>,
    round_length: u64,
    /// Snapshot mode: once the forward tick completes this round, it returns
    /// the `SnapshotComplete` sentinel and the supervisor shuts down.
    snapshot_target: Option<u64>,
}

impl DposRounds {
    pub fn new(store: Arc<ChainStore>) -> Self {
        Self::with_round_length(store, DEFAULT_ROUND_LENGTH)
    }

    pub fn with_round_length(store: Arc<ChainStore>, round_length: u64) -> Self {
        assert!(round_length > 0, "round length must be positive");
        DposRounds { store, round_length, snapshot_target: None }
    }

    /// Snapshot mode: tick normally until `target_round` completes, then
    /// signal orderly termination.
    pub fn with_snapshot_target(mut self, target_round: u64) -> Self {
        self.snapshot_target = Some(target_round);
        self
    }

    /// Round of a block height (1-based; heights 1..=round_length are
    /// round 1).
    pub fn round_of(&self, height: u64) -> u64 {
        (height.saturating_sub(1)) / self.round_length + 1
    }

    fn is_boundary(&self, height: u64) -> bool {
        height % self.round_length == 0
    }

    fn read_slots(&self, txn: &RwTransaction<'_>, round: u64) -> Result<RoundSlots, StoreError> {
        match self.store.read_round_raw(txn, round)? {
            Some(blob) => Ok(bincode::deserialize(&blob)?),
            None => Ok(RoundSlots::default()),
        }
    }

    fn write_slots(
        &self,
        round: u64,
        slots: &RoundSlots,
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), StoreError> {
        let blob = bincode::serialize(slots)?;
        self.store.write_round_raw(round, &blob, txn)
    }

    /// Credit every slot generator of a completed round. Generators without
    /// a delegate record are skipped; genesis and test chains may be
    /// generated by unregistered keys.
    fn credit_round(
        &self,
        slots: &RoundSlots,
        txn: &mut RwTransaction<'_>,
        accounts: &crate::account::AccountStore,
    ) -> Result<(), StoreError> {
        for pk in &slots.generators {
            if let Some(mut record) = accounts.get_delegate(txn, pk)? {
                record.produced_blocks += 1;
                accounts.put_delegate(&record, txn)?;
            }
        }
        Ok(())
    }

    fn uncredit_round(
        &self,
        slots: &RoundSlots,
        txn: &mut RwTransaction<'_>,
        accounts: &crate::account::AccountStore,
    ) -> Result<(), StoreError> {
        for pk in &slots.generators {
            if let Some(mut record) = accounts.get_delegate(txn, pk)? {
                record.produced_blocks = record.produced_blocks.saturating_sub(1);
                accounts.put_delegate(&record, txn)?;
            }
        }
        Ok(())
    }

    fn accounts(&self) -> crate::account::AccountStore {
        crate::account::AccountStore::new(self.store.clone())
    }
}

impl RoundController for DposRounds {
    fn forward_tick(&self, block: &Block, txn: &mut RwTransaction<'_>) -> Result<(), ChainError> {
        let round = self.round_of(block.height);
        let mut slots = self.read_slots(txn, round).map_err(ChainError::Storage)?;
        slots.generators.push(block.generator_public_key);
        self.write_slots(round, &slots, txn).map_err(ChainError::Storage)?;

        if self.is_boundary(block.height) {
            let accounts = self.accounts();
            self.credit_round(&slots, txn, &accounts).map_err(ChainError::Storage)?;
            info!(round, height = block.height, slots = slots.generators.len(), "round completed");

            if self.snapshot_target == Some(round) {
                info!(round, "snapshot target round reached");
                return Err(ChainError::SnapshotComplete);
            }
        } else {
            debug!(round, height = block.height, "forward tick");
        }
        Ok(())
    }

    fn backward_tick(
        &self,
        old_block: &Block,
        new_tip: &Block,
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), ChainError> {
        let round = self.round_of(old_block.height);
        let mut slots = self.read_slots(txn, round).map_err(ChainError::Storage)?;

        if self.is_boundary(old_block.height) {
            // the deleted block had closed this round: un-credit first
            let accounts = self.accounts();
            self.uncredit_round(&slots, txn, &accounts).map_err(ChainError::Storage)?;
            info!(round, height = old_block.height, "round reopened");
        }

        match slots.generators.pop() {
            Some(pk) if pk == old_block.generator_public_key => {}
            Some(pk) => {
                return Err(ChainError::Storage(StoreError::Corrupt(format!(
                    "round {} slot mismatch: expected generator {}, found {}",
                    round, old_block.generator_public_key, pk
                ))));
            }
            None => {
                return Err(ChainError::Storage(StoreError::Corrupt(format!(
                    "round {} has no slots to walk back at height {}",
                    round, old_block.height
                ))));
            }
        }

        if slots.generators.is_empty() {
            self.store.delete_round(round, txn).map_err(ChainError::Storage)?;
        } else {
            self.write_slots(round, &slots, txn).map_err(ChainError::Storage)?;
        }
        debug!(
            round,
            height = old_block.height,
            new_tip = new_tip.height,
            "backward tick"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountStore, DelegateRecord};
    use crate::crypto::generate_keypair;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn block_at(height: u64, generator: PublicKey) -> Block {
        let ts = Utc.timestamp_opt(1_700_000_000 + height as i64, 0).unwrap();
        Block::new(height, None, ts, generator, 0, 0, vec![0u8; 64], vec![]).unwrap()
    }

    #[test]
    fn round_of_maps_heights() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChainStore::open(dir.path()).unwrap());
        let rounds = DposRounds::with_round_length(store, 3);
        assert_eq!(rounds.round_of(1), 1);
        assert_eq!(rounds.round_of(3), 1);
        assert_eq!(rounds.round_of(4), 2);
        assert_eq!(rounds.round_of(6), 2);
        assert_eq!(rounds.round_of(7), 3);
    }

    #[test]
    fn boundary_credits_and_backward_uncredits() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChainStore::open(dir.path()).unwrap());
        let accounts = AccountStore::new(store.clone());
        let rounds = DposRounds::with_round_length(store.clone(), 2);

        let (delegate_pk, _) = generate_keypair();
        store
            .with_write_txn("register", |txn| {
                accounts.put_delegate(&DelegateRecord::new(delegate_pk, "forger".into()), txn)?;
                Ok(())
            })
            .unwrap();

        let b1 = block_at(1, delegate_pk);
        let b2 = block_at(2, delegate_pk);

        store
            .with_write_txn("tick", |txn| {
                rounds.forward_tick(&b1, txn)?;
                rounds.forward_tick(&b2, txn)?;
                Ok(())
            })
            .unwrap();
        // round 1 completed at height 2: both slots credited
        assert_eq!(accounts.delegate(&delegate_pk).unwrap().unwrap().produced_blocks, 2);

        store
            .with_write_txn("untick", |txn| {
                rounds.backward_tick(&b2, &b1, txn)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(accounts.delegate(&delegate_pk).unwrap().unwrap().produced_blocks, 0);
    }

    #[test]
    fn snapshot_target_returns_sentinel() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChainStore::open(dir.path()).unwrap());
        let rounds = DposRounds::with_round_length(store.clone(), 2).with_snapshot_target(1);

        let (generator, _) = generate_keypair();
        let b1 = block_at(1, generator);
        let b2 = block_at(2, generator);

        let result = store.with_write_txn("tick", |txn| {
            rounds.forward_tick(&b1, txn)?;
            rounds.forward_tick(&b2, txn)
        });
        assert!(matches!(result, Err(ChainError::SnapshotComplete)));
    }

    #[test]
    fn backward_tick_rejects_slot_mismatch() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChainStore::open(dir.path()).unwrap());
        let rounds = DposRounds::with_round_length(store.clone(), 10);

        let (alice, _) = generate_keypair();
        let (bob, _) = generate_keypair();
        let b1 = block_at(1, alice);
        let imposter = block_at(1, bob);

        let result = store.with_write_txn("tick", |txn| {
            rounds.forward_tick(&b1, txn)?;
            rounds.backward_tick(&imposter, &b1, txn)
        });
        assert!(matches!(result, Err(ChainError::Storage(StoreError::Corrupt(_)))));
    }
}

//! Chain mutator: the only component that sequences persistent writes.
//!
//! Orchestrates the block apply/undo pipelines, genesis bootstrap, and the
//! commit boundaries of the last-block register. All four mutating
//! operations are serialized behind one write lock; the `is_active` flag is
//! an observable assertion of that exclusion, not the exclusion itself.
//!
//! Apply data flow: candidate block → undo unconfirmed pool → one write
//! transaction (apply-unconfirmed per tx, apply-confirmed per tx, save block
//! + transactions, forward round tick) → commit → register update → events.
//! Undo is the mirror image: load parent → undo transactions tail-to-head →
//! backward tick → delete block row → register update → transactions back to
//! the pool.

use crate::account::AccountStore;
use crate::block::{Block, ReducedBlock};
use crate::bus::{ChainEvent, MessageBus};
use crate::error::{ChainError, ValidationKind};
use crate::executor::TransactionExecutor;
use crate::last_block::LastBlockRegister;
use crate::pool::TransactionPool;
use crate::rounds::RoundController;
use crate::store::ChainStore;
use crate::tx::Transaction;
use crate::types::{Amount, Hash, PublicKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Clears the is-active flag on every exit path, including unwinds.
struct ActiveGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ActiveGuard<'a> {
    fn arm(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        ActiveGuard { flag }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct ChainMutator {
    store: Arc<ChainStore>,
    accounts: AccountStore,
    executor: TransactionExecutor,
    rounds: Box<dyn RoundController>,
    pool: TransactionPool,
    bus: MessageBus,
    last_block: LastBlockRegister,
    genesis: Arc<Block>,
    /// Single-writer serialization for the mutating operations.
    write_lock: Mutex<()>,
    /// Observable assertion that a mutation is in flight.
    is_active: AtomicBool,
}

impl ChainMutator {
    pub fn new(
        store: Arc<ChainStore>,
        rounds: Box<dyn RoundController>,
        bus: MessageBus,
        genesis: Block,
    ) -> Self {
        let accounts = AccountStore::new(store.clone());
        let executor = TransactionExecutor::new(accounts.clone());
        let pool = TransactionPool::new(store.clone(), accounts.clone(), executor.clone());
        ChainMutator {
            store,
            accounts,
            executor,
            rounds,
            pool,
            bus,
            last_block: LastBlockRegister::new(),
            genesis: Arc::new(genesis),
            write_lock: Mutex::new(()),
            is_active: AtomicBool::new(false),
        }
    }

    // ------------------------
    // read-only collaborator surface
    // ------------------------

    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    pub fn accounts(&self) -> &AccountStore {
        &self.accounts
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn last_block(&self) -> &LastBlockRegister {
        &self.last_block
    }

    pub fn genesis(&self) -> &Arc<Block> {
        &self.genesis
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    // ------------------------
    // bootstrap
    // ------------------------

    /// Idempotent genesis persistence: if the configured genesis block is
    /// already stored, succeed without touching storage.
    pub fn save_genesis_block(&self) -> Result<(), ChainError> {
        let _serial = self.write_lock.lock();

        if self.store.has_block(&self.genesis.id)? {
            debug!(id = %self.genesis.id, "genesis block already persisted");
            return Ok(());
        }

        let genesis = self.genesis.clone();
        self.store.with_write_txn("save-genesis", |txn| {
            self.store.save_block(&genesis, txn)?;
            self.store.put_genesis_id(&genesis.id, txn)?;
            Ok(())
        })?;
        info!(id = %self.genesis.id, txs = self.genesis.transactions.len(), "genesis block persisted");
        Ok(())
    }

    /// Replay genesis transactions against a clean account store. Votes sort
    /// after every other type (stable partition) so delegates registered at
    /// genesis exist before genesis votes reference them. Any failure is a
    /// non-recoverable bootstrap error.
    pub fn apply_genesis_block(&self, block: &Block) -> Result<(), ChainError> {
        let _serial = self.write_lock.lock();

        let sorted = sort_genesis_transactions(&block.transactions);
        let seeds = genesis_seed_amounts(&block.transactions)
            .map_err(|e| ChainError::GenesisApplyFatal(e.to_string()))?;

        let result = self.store.with_write_txn("apply-genesis", |txn| {
            // seed each genesis sender with its total outgoing amount: the
            // distribution source accounts hold exactly what they hand out
            for (public_key, total) in &seeds {
                let mut account = self.accounts.set_account_and_get(public_key, txn)?;
                account.balance = account
                    .balance
                    .checked_add(*total)
                    .ok_or_else(|| ChainError::GenesisApplyFatal("seed overflow".into()))?;
                account.unconfirmed_balance = account
                    .unconfirmed_balance
                    .checked_add(*total)
                    .ok_or_else(|| ChainError::GenesisApplyFatal("seed overflow".into()))?;
                self.accounts.put_account(&account, txn)?;
            }

            for tx in &sorted {
                let mut sender = self.accounts.set_account_and_get(&tx.sender_public_key, txn)?;
                self.executor.apply_unconfirmed(tx, &mut sender, txn)?;
                let mut sender = self.accounts.set_account_and_get(&tx.sender_public_key, txn)?;
                self.executor.apply(tx, block, &mut sender, txn)?;
            }

            self.rounds.forward_tick(block, txn)
        });

        match result {
            Ok(()) => {
                self.last_block.set(Arc::new(block.clone()));
                info!(id = %block.id, txs = block.transactions.len(), "genesis block applied");
                Ok(())
            }
            Err(ChainError::SnapshotComplete) => Err(ChainError::SnapshotComplete),
            Err(err @ ChainError::GenesisApplyFatal(_)) => {
                error!(error = %err, "genesis apply failed; node cannot bootstrap");
                Err(err)
            }
            Err(err) => {
                error!(error = %err, "genesis apply failed; node cannot bootstrap");
                Err(ChainError::GenesisApplyFatal(err.to_string()))
            }
        }
    }

    /// Seed the last-block register from storage at process startup.
    pub fn load_last_block(&self) -> Result<Arc<Block>, ChainError> {
        let _serial = self.write_lock.lock();
        let block = self
            .store
            .load_last_block()?
            .ok_or(ChainError::Validation(ValidationKind::NotBootstrapped))?;
        let block = Arc::new(block);
        self.last_block.set(block.clone());
        info!(height = block.height, id = %block.id, "last block loaded from storage");
        Ok(block)
    }

    // ------------------------
    // apply
    // ------------------------

    /// Apply a fully-validated candidate block on top of the current tip.
    ///
    /// With `persist_block = false` only the round tick runs inside the
    /// write transaction; blocks arriving pre-persisted during fast resync
    /// skip the save step.
    pub fn apply_block(&self, block: Block, persist_block: bool) -> Result<Arc<Block>, ChainError> {
        let _serial = self.write_lock.lock();

        if self.is_active() {
            return Err(ChainError::Validation(ValidationKind::MutationInProgress));
        }
        let last = self
            .last_block
            .get()
            .ok_or(ChainError::Validation(ValidationKind::NotBootstrapped))?;
        if block.height != last.height + 1 {
            return Err(ChainError::Validation(ValidationKind::UnexpectedHeight {
                expected: last.height + 1,
                actual: block.height,
            }));
        }
        if block.previous_block_id != Some(last.id) {
            return Err(ChainError::Validation(ValidationKind::UnexpectedParent {
                expected: last.id.to_hex(),
                actual: block
                    .previous_block_id
                    .map(|id| id.to_hex())
                    .unwrap_or_else(|| "none".to_string()),
            }));
        }

        // step 1, outside the write transaction: reset every pending
        // unconfirmed effect so the block applies against confirmed state
        self.pool.undo_unconfirmed_pool()?;

        let guard = ActiveGuard::arm(&self.is_active);
        let block = Arc::new(block);

        let result = self.store.with_write_txn("apply-block", |txn| {
            for tx in &block.transactions {
                let mut sender = self.accounts.set_account_and_get(&tx.sender_public_key, txn)?;
                self.executor.apply_unconfirmed(tx, &mut sender, txn)?;
            }
            for tx in &block.transactions {
                let mut sender = self.accounts.set_account_and_get(&tx.sender_public_key, txn)?;
                self.executor.apply(tx, &block, &mut sender, txn)?;
            }
            if persist_block {
                self.store.save_block(&block, txn)?;
            }
            self.rounds.forward_tick(&block, txn).map_err(|err| match err {
                ChainError::SnapshotComplete => ChainError::SnapshotComplete,
                other => ChainError::RoundTickFatal(other.to_string()),
            })
        });

        match result {
            Ok(()) => {
                let applied_ids: Vec<Hash> = block.transactions.iter().map(|tx| tx.id).collect();
                for id in &applied_ids {
                    self.pool.remove_unconfirmed(id);
                }
                let dropped = self.pool.apply_unconfirmed_pool();
                if !dropped.is_empty() {
                    warn!(count = dropped.len(), "pooled transactions invalidated by block");
                }

                self.last_block.set(block.clone());
                drop(guard);

                if persist_block {
                    self.bus.publish(ChainEvent::TransactionsSaved(applied_ids));
                }
                self.bus.publish(ChainEvent::NewBlock(block.clone()));
                info!(
                    height = block.height,
                    id = %block.id,
                    txs = block.transactions.len(),
                    persisted = persist_block,
                    "block applied"
                );
                Ok(block)
            }
            Err(ChainError::SnapshotComplete) => {
                drop(guard);
                info!("snapshot finished; signalling orderly shutdown");
                Err(ChainError::SnapshotComplete)
            }
            Err(err) => {
                drop(guard);
                if err.is_fatal() {
                    error!(error = %err, "fatal failure while applying block");
                } else {
                    // the write transaction aborted; restore the pending
                    // unconfirmed effects rolled back in step 1
                    let dropped = self.pool.apply_unconfirmed_pool();
                    if !dropped.is_empty() {
                        warn!(count = dropped.len(), "pooled transactions dropped after failed apply");
                    }
                    warn!(error = %err, height = block.height, "block apply aborted");
                }
                Err(err)
            }
        }
    }

    // ------------------------
    // undo
    // ------------------------

    /// Pop the current tip, restoring account balances and round bookkeeping
    /// and returning its transactions to the pool. Returns the new tip.
    pub fn delete_last_block(&self) -> Result<Arc<Block>, ChainError> {
        let _serial = self.write_lock.lock();

        if self.is_active() {
            return Err(ChainError::Validation(ValidationKind::MutationInProgress));
        }
        let last = self
            .last_block
            .get()
            .ok_or(ChainError::Validation(ValidationKind::NotBootstrapped))?;
        if last.is_genesis() {
            return Err(ChainError::Validation(ValidationKind::CannotDeleteGenesis));
        }
        let parent_id = last
            .previous_block_id
            .ok_or(ChainError::Validation(ValidationKind::CannotDeleteGenesis))?;

        let guard = ActiveGuard::arm(&self.is_active);

        let result = self.store.with_write_txn("delete-block", |txn| {
            let parent = self
                .store
                .read_block(&*txn, &parent_id)
                .map_err(|err| ChainError::BlockUndoFatal {
                    id: last.id,
                    reason: err.to_string(),
                })?
                .ok_or(ChainError::ParentMissing { id: parent_id })?;

            for tx in last.transactions.iter().rev() {
                let mut sender = self
                    .accounts
                    .get_account(&tx.sender_public_key, txn)
                    .map_err(|err| ChainError::BlockUndoFatal {
                        id: last.id,
                        reason: err.to_string(),
                    })?;
                self.executor
                    .undo(tx, &last, &mut sender, txn)
                    .map_err(|err| ChainError::BlockUndoFatal {
                        id: last.id,
                        reason: err.to_string(),
                    })?;
                let mut sender = self
                    .accounts
                    .get_account(&tx.sender_public_key, txn)
                    .map_err(|err| ChainError::BlockUndoFatal {
                        id: last.id,
                        reason: err.to_string(),
                    })?;
                self.executor
                    .undo_unconfirmed(tx, &mut sender, txn)
                    .map_err(|err| ChainError::BlockUndoFatal {
                        id: last.id,
                        reason: err.to_string(),
                    })?;
            }

            self.rounds
                .backward_tick(&last, &parent, txn)
                .map_err(|err| ChainError::RoundTickFatal(err.to_string()))?;

            self.store
                .delete_block(&last.id, txn)
                .map_err(|err| ChainError::BlockUndoFatal {
                    id: last.id,
                    reason: err.to_string(),
                })?;

            Ok(Arc::new(parent))
        });

        match result {
            Ok(parent) => {
                self.last_block.set(parent.clone());
                drop(guard);

                // outside the transaction: undone transactions, newest
                // first, go back to the pool as unconfirmed
                let mut undone: Vec<Transaction> = last.transactions.to_vec();
                undone.reverse();
                let readmitted = self.pool.readd_unconfirmed(undone);
                info!(
                    deleted = %last.id,
                    new_height = parent.height,
                    readmitted = readmitted.len(),
                    "last block deleted"
                );
                Ok(parent)
            }
            Err(err) => {
                drop(guard);
                error!(error = %err, id = %last.id, "fatal failure while deleting last block");
                Err(err)
            }
        }
    }

    /// Remediation entry for a failed external consistency check: drop the
    /// tip and log the outcome.
    pub fn recover_chain(&self) -> Result<Arc<Block>, ChainError> {
        info!("chain recovery requested; deleting last block");
        match self.delete_last_block() {
            Ok(tip) => {
                info!(height = tip.height, id = %tip.id, "chain recovered to parent block");
                Ok(tip)
            }
            Err(err) => {
                error!(error = %err, "chain recovery failed");
                Err(err)
            }
        }
    }

    // ------------------------
    // outbound
    // ------------------------

    /// Emit a header-only broadcast request; the peer-networking collaborator
    /// subscribes. The core's only outbound networking touchpoint.
    pub fn broadcast_reduced_block(&self, block: &Block, broadcast: bool) {
        if !broadcast {
            return;
        }
        let reduced = ReducedBlock::from(block);
        debug!(height = reduced.height, id = %reduced.id, "broadcasting reduced block");
        self.bus.publish(ChainEvent::BroadcastBlock(reduced));
    }
}

/// Stable partition: every `Vote` transaction sorts after every non-`Vote`
/// transaction, preserving relative order within each group.
pub(crate) fn sort_genesis_transactions(txs: &[Transaction]) -> Vec<Transaction> {
    let mut sorted: Vec<Transaction> = Vec::with_capacity(txs.len());
    let mut votes: Vec<Transaction> = Vec::new();
    for tx in txs {
        if tx.is_vote() {
            votes.push(tx.clone());
        } else {
            sorted.push(tx.clone());
        }
    }
    sorted.extend(votes);
    sorted
}

/// Per-sender totals the genesis replay seeds before applying: each genesis
/// sender holds exactly what its transactions hand out.
fn genesis_seed_amounts(txs: &[Transaction]) -> Result<HashMap<PublicKey, Amount>, ChainError> {
    let mut seeds: HashMap<PublicKey, Amount> = HashMap::new();
    for tx in txs {
        let debit = tx
            .total_debit()
            .ok_or_else(|| ChainError::tx_apply(tx.id, "amount + fee overflows"))?;
        let entry = seeds.entry(tx.sender_public_key).or_insert_with(Amount::zero);
        *entry = entry
            .checked_add(debit)
            .ok_or_else(|| ChainError::tx_apply(tx.id, "genesis seed overflow"))?;
    }
    Ok(seeds)
}

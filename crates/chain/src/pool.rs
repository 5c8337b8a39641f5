//! Transaction pool: buffers unconfirmed transactions and owns their effect
//! on unconfirmed balances.
//!
//! Admission applies the unconfirmed effect; the chain mutator rolls the
//! whole pool back before applying a block and re-applies the survivors
//! after commit. Invariant: a transaction id in the pool never appears in a
//! persisted block.

use crate::account::AccountStore;
use crate::error::ChainError;
use crate::executor::TransactionExecutor;
use crate::store::ChainStore;
use crate::tx::Transaction;
use crate::types::Hash;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
struct PoolInner {
    by_id: HashMap<Hash, Transaction>,
    /// Admission order; unconfirmed rollback walks it in reverse.
    order: Vec<Hash>,
}

#[derive(Clone)]
pub struct TransactionPool {
    store: Arc<ChainStore>,
    accounts: AccountStore,
    executor: TransactionExecutor,
    inner: Arc<RwLock<PoolInner>>,
}

impl TransactionPool {
    pub fn new(store: Arc<ChainStore>, accounts: AccountStore, executor: TransactionExecutor) -> Self {
        TransactionPool {
            store,
            accounts,
            executor,
            inner: Arc::new(RwLock::new(PoolInner::default())),
        }
    }

    /// Admit transactions: dedupe by id, apply the unconfirmed effect, and
    /// buffer. A transaction whose unconfirmed apply fails is skipped, not
    /// fatal. Returns the admitted ids.
    pub fn receive_transactions(&self, txs: Vec<Transaction>) -> Vec<Hash> {
        let mut admitted = Vec::new();
        for mut tx in txs {
            if self.contains(&tx.id) {
                debug!(tx = %tx.id, "duplicate transaction ignored");
                continue;
            }
            tx.block_id = None;
            let applied = self.store.with_write_txn("pool-receive", |txn| {
                let mut sender = self.accounts.set_account_and_get(&tx.sender_public_key, txn)?;
                self.executor.apply_unconfirmed(&tx, &mut sender, txn)
            });
            match applied {
                Ok(()) => {
                    let mut inner = self.inner.write();
                    inner.order.push(tx.id);
                    admitted.push(tx.id);
                    inner.by_id.insert(tx.id, tx);
                }
                Err(err) => {
                    warn!(tx = %tx.id, error = %err, "transaction rejected by pool");
                }
            }
        }
        admitted
    }

    /// Roll back every pooled transaction's unconfirmed effect, newest
    /// first, in one write transaction. The pool keeps its contents; only
    /// the balance effects are reset. Failure means the in-memory view no
    /// longer matches storage and is fatal for the caller.
    pub fn undo_unconfirmed_pool(&self) -> Result<(), ChainError> {
        let snapshot: Vec<Transaction> = {
            let inner = self.inner.read();
            inner
                .order
                .iter()
                .rev()
                .filter_map(|id| inner.by_id.get(id).cloned())
                .collect()
        };
        if snapshot.is_empty() {
            return Ok(());
        }

        self.store
            .with_write_txn("pool-undo-unconfirmed", |txn| {
                for tx in &snapshot {
                    let mut sender = self
                        .accounts
                        .get_account(&tx.sender_public_key, txn)
                        .map_err(ChainError::Storage)?;
                    self.executor.undo_unconfirmed(tx, &mut sender, txn)?;
                }
                Ok(())
            })
            .map_err(|err| ChainError::UnconfirmedUndoFatal(err.to_string()))
    }

    /// Re-apply the unconfirmed effect of everything still pooled, oldest
    /// first. Transactions that no longer apply (their funds were spent by
    /// the committed block) are dropped; their ids are returned.
    pub fn apply_unconfirmed_pool(&self) -> Vec<Hash> {
        let snapshot: Vec<Transaction> = {
            let inner = self.inner.read();
            inner
                .order
                .iter()
                .filter_map(|id| inner.by_id.get(id).cloned())
                .collect()
        };

        let mut dropped = Vec::new();
        for tx in snapshot {
            let applied = self.store.with_write_txn("pool-apply-unconfirmed", |txn| {
                let mut sender = self.accounts.set_account_and_get(&tx.sender_public_key, txn)?;
                self.executor.apply_unconfirmed(&tx, &mut sender, txn)
            });
            if let Err(err) = applied {
                warn!(tx = %tx.id, error = %err, "pooled transaction no longer applies; dropping");
                self.remove_unconfirmed(&tx.id);
                dropped.push(tx.id);
            }
        }
        dropped
    }

    /// Reinsert transactions popped off a deleted block (callers pass them
    /// reversed), applying unconfirmed effects. Returns the readmitted ids.
    pub fn readd_unconfirmed(&self, txs: Vec<Transaction>) -> Vec<Hash> {
        self.receive_transactions(txs)
    }

    /// Drop an id after its transaction was committed inside a block. The
    /// unconfirmed effect was already rolled back by the apply pipeline.
    pub fn remove_unconfirmed(&self, id: &Hash) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.by_id.remove(id).is_some();
        if removed {
            inner.order.retain(|other| other != id);
        }
        removed
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.inner.read().by_id.contains_key(id)
    }

    /// Pooled ids in admission order.
    pub fn unconfirmed_ids(&self) -> Vec<Hash> {
        self.inner.read().order.clone()
    }

    /// Snapshot of pooled transactions in admission order.
    pub fn transactions(&self) -> Vec<Transaction> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

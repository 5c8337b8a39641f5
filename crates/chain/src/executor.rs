//! Transaction executor: applies or undoes a single transaction against a
//! resolved sender account, in unconfirmed and confirmed modes.
//!
//! Ordering contract (enforced by the chain mutator): within a block, every
//! transaction's unconfirmed effect succeeds before any confirmed effect is
//! applied; undo walks tail-to-head doing confirmed-undo then
//! unconfirmed-undo per transaction. All writes go through the account store
//! inside the caller's write transaction.

use crate::account::{Account, AccountStore, DelegateRecord};
use crate::block::Block;
use crate::error::ChainError;
use crate::tx::{Transaction, TxPayload};
use crate::types::Amount;
use lmdb::RwTransaction;
use tracing::trace;

const MAX_USERNAME_LEN: usize = 20;

#[derive(Clone)]
pub struct TransactionExecutor {
    accounts: AccountStore,
}

impl TransactionExecutor {
    pub fn new(accounts: AccountStore) -> Self {
        TransactionExecutor { accounts }
    }

    fn debit_of(tx: &Transaction) -> Result<Amount, ChainError> {
        tx.total_debit()
            .ok_or_else(|| ChainError::tx_apply(tx.id, "amount + fee overflows"))
    }

    /// Record the transaction's effect against the unconfirmed balance
    /// view: debit the sender, and for transfers credit the recipient. The
    /// recipient credit is what lets a later transaction in the same block
    /// spend from an address funded by an earlier one.
    pub fn apply_unconfirmed(
        &self,
        tx: &Transaction,
        sender: &mut Account,
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), ChainError> {
        let debit = Self::debit_of(tx)?;
        sender.unconfirmed_balance = sender.unconfirmed_balance.checked_sub(debit).ok_or_else(|| {
            ChainError::tx_apply(
                tx.id,
                format!(
                    "insufficient unconfirmed balance: have {}, need {}",
                    sender.unconfirmed_balance, debit
                ),
            )
        })?;

        if let TxPayload::Transfer { recipient, amount } = &tx.payload {
            if *recipient == sender.public_key {
                sender.unconfirmed_balance =
                    checked_credit(sender.unconfirmed_balance, *amount, tx)?;
            } else {
                self.accounts.put_account(sender, txn)?;
                let mut recipient_account = self.accounts.set_account_and_get(recipient, txn)?;
                recipient_account.unconfirmed_balance =
                    checked_credit(recipient_account.unconfirmed_balance, *amount, tx)?;
                self.accounts.put_account(&recipient_account, txn)?;
                trace!(tx = %tx.id, sender = %sender.public_key, "applied unconfirmed");
                return Ok(());
            }
        }
        self.accounts.put_account(sender, txn)?;
        trace!(tx = %tx.id, sender = %sender.public_key, "applied unconfirmed");
        Ok(())
    }

    /// Reverse of [`apply_unconfirmed`].
    pub fn undo_unconfirmed(
        &self,
        tx: &Transaction,
        sender: &mut Account,
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), ChainError> {
        let debit = Self::debit_of(tx)?;

        if let TxPayload::Transfer { recipient, amount } = &tx.payload {
            if *recipient == sender.public_key {
                sender.unconfirmed_balance =
                    checked_debit(sender.unconfirmed_balance, *amount, tx, "self-transfer undo")?;
            } else {
                let mut recipient_account = self
                    .accounts
                    .get_account(recipient, txn)
                    .map_err(ChainError::Storage)?;
                recipient_account.unconfirmed_balance = checked_debit(
                    recipient_account.unconfirmed_balance,
                    *amount,
                    tx,
                    "recipient unconfirmed undo",
                )?;
                self.accounts.put_account(&recipient_account, txn)?;
            }
        }

        sender.unconfirmed_balance = sender
            .unconfirmed_balance
            .checked_add(debit)
            .ok_or_else(|| ChainError::tx_apply(tx.id, "unconfirmed balance overflow on undo"))?;
        self.accounts.put_account(sender, txn)?;
        trace!(tx = %tx.id, sender = %sender.public_key, "undid unconfirmed");
        Ok(())
    }

    /// Commit the transaction's confirmed effects: balance movement plus
    /// type-specific state.
    pub fn apply(
        &self,
        tx: &Transaction,
        block: &Block,
        sender: &mut Account,
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), ChainError> {
        let debit = Self::debit_of(tx)?;
        sender.balance = sender.balance.checked_sub(debit).ok_or_else(|| {
            ChainError::tx_apply(
                tx.id,
                format!(
                    "insufficient confirmed balance: have {}, need {}",
                    sender.balance, debit
                ),
            )
        })?;

        match &tx.payload {
            TxPayload::Transfer { recipient, amount } => {
                if *recipient == sender.public_key {
                    sender.balance = checked_credit(sender.balance, *amount, tx)?;
                    self.accounts.put_account(sender, txn)?;
                } else {
                    self.accounts.put_account(sender, txn)?;
                    let mut recipient_account = self.accounts.set_account_and_get(recipient, txn)?;
                    recipient_account.balance =
                        checked_credit(recipient_account.balance, *amount, tx)?;
                    self.accounts.put_account(&recipient_account, txn)?;
                }
            }
            TxPayload::Vote { added, removed } => {
                self.apply_votes(tx, sender, added, removed, txn)?;
                self.accounts.put_account(sender, txn)?;
            }
            TxPayload::DelegateRegistration { username } => {
                self.apply_registration(tx, sender, username, txn)?;
                self.accounts.put_account(sender, txn)?;
            }
        }
        trace!(tx = %tx.id, block = %block.id, "applied confirmed");
        Ok(())
    }

    /// Reverse of [`apply`]: type-specific state first, then the balance
    /// re-credit.
    pub fn undo(
        &self,
        tx: &Transaction,
        block: &Block,
        sender: &mut Account,
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), ChainError> {
        let debit = Self::debit_of(tx)?;

        match &tx.payload {
            TxPayload::Transfer { recipient, amount } => {
                if *recipient == sender.public_key {
                    sender.balance = checked_debit(sender.balance, *amount, tx, "self-transfer undo")?;
                } else {
                    let mut recipient_account = self
                        .accounts
                        .get_account(recipient, txn)
                        .map_err(ChainError::Storage)?;
                    recipient_account.balance =
                        checked_debit(recipient_account.balance, *amount, tx, "recipient undo")?;
                    self.accounts.put_account(&recipient_account, txn)?;
                }
            }
            TxPayload::Vote { added, removed } => {
                self.undo_votes(tx, sender, added, removed, txn)?;
            }
            TxPayload::DelegateRegistration { .. } => {
                self.undo_registration(tx, sender, txn)?;
            }
        }

        sender.balance = sender
            .balance
            .checked_add(debit)
            .ok_or_else(|| ChainError::tx_apply(tx.id, "balance overflow on undo"))?;
        self.accounts.put_account(sender, txn)?;
        trace!(tx = %tx.id, block = %block.id, "undid confirmed");
        Ok(())
    }

    // ------------------------
    // vote effects
    // ------------------------
    //
    // Vote weight moved per delegate equals the sender's confirmed balance
    // after the fee deduction. Undo runs before the fee re-credit, so the
    // same weight is observed in both directions.

    fn apply_votes(
        &self,
        tx: &Transaction,
        sender: &mut Account,
        added: &[crate::types::PublicKey],
        removed: &[crate::types::PublicKey],
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), ChainError> {
        for pk in added {
            if removed.contains(pk) {
                return Err(ChainError::tx_apply(tx.id, format!("delegate {} both added and removed", pk)));
            }
        }

        let weight = sender.balance;
        for pk in added {
            if sender.votes.contains(pk) {
                return Err(ChainError::tx_apply(tx.id, format!("already voting for delegate {}", pk)));
            }
            let mut record = self
                .accounts
                .get_delegate(txn, pk)?
                .ok_or_else(|| ChainError::tx_apply(tx.id, format!("unknown delegate {}", pk)))?;
            record.vote_weight = record
                .vote_weight
                .checked_add(weight)
                .ok_or_else(|| ChainError::tx_apply(tx.id, "vote weight overflow"))?;
            self.accounts.put_delegate(&record, txn)?;
            sender.votes.push(*pk);
        }
        for pk in removed {
            let position = sender
                .votes
                .iter()
                .position(|v| v == pk)
                .ok_or_else(|| ChainError::tx_apply(tx.id, format!("not voting for delegate {}", pk)))?;
            let mut record = self
                .accounts
                .get_delegate(txn, pk)?
                .ok_or_else(|| ChainError::tx_apply(tx.id, format!("unknown delegate {}", pk)))?;
            record.vote_weight = record
                .vote_weight
                .checked_sub(weight)
                .ok_or_else(|| ChainError::tx_apply(tx.id, "vote weight underflow"))?;
            self.accounts.put_delegate(&record, txn)?;
            sender.votes.remove(position);
        }
        Ok(())
    }

    fn undo_votes(
        &self,
        tx: &Transaction,
        sender: &mut Account,
        added: &[crate::types::PublicKey],
        removed: &[crate::types::PublicKey],
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), ChainError> {
        let weight = sender.balance;
        for pk in removed.iter().rev() {
            let mut record = self
                .accounts
                .get_delegate(txn, pk)?
                .ok_or_else(|| ChainError::tx_apply(tx.id, format!("unknown delegate {}", pk)))?;
            record.vote_weight = record
                .vote_weight
                .checked_add(weight)
                .ok_or_else(|| ChainError::tx_apply(tx.id, "vote weight overflow on undo"))?;
            self.accounts.put_delegate(&record, txn)?;
            sender.votes.push(*pk);
        }
        for pk in added.iter().rev() {
            let position = sender
                .votes
                .iter()
                .position(|v| v == pk)
                .ok_or_else(|| ChainError::tx_apply(tx.id, format!("vote for {} missing on undo", pk)))?;
            let mut record = self
                .accounts
                .get_delegate(txn, pk)?
                .ok_or_else(|| ChainError::tx_apply(tx.id, format!("unknown delegate {}", pk)))?;
            record.vote_weight = record
                .vote_weight
                .checked_sub(weight)
                .ok_or_else(|| ChainError::tx_apply(tx.id, "vote weight underflow on undo"))?;
            self.accounts.put_delegate(&record, txn)?;
            sender.votes.remove(position);
        }
        Ok(())
    }

    // ------------------------
    // delegate registration effects
    // ------------------------

    fn apply_registration(
        &self,
        tx: &Transaction,
        sender: &mut Account,
        username: &str,
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), ChainError> {
        if sender.delegate.is_some() {
            return Err(ChainError::tx_apply(tx.id, "account is already a delegate"));
        }
        if username.is_empty() || username.len() > MAX_USERNAME_LEN {
            return Err(ChainError::tx_apply(
                tx.id,
                format!("invalid delegate username length: {}", username.len()),
            ));
        }
        if !username.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(ChainError::tx_apply(
                tx.id,
                "delegate username must be lowercase alphanumeric",
            ));
        }
        if self.accounts.username_taken(txn, username)? {
            return Err(ChainError::tx_apply(tx.id, format!("username {} is taken", username)));
        }

        let record = DelegateRecord::new(sender.public_key, username.to_string());
        self.accounts.put_delegate(&record, txn)?;
        sender.delegate = Some(username.to_string());
        Ok(())
    }

    fn undo_registration(
        &self,
        tx: &Transaction,
        sender: &mut Account,
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), ChainError> {
        let record = self
            .accounts
            .get_delegate(txn, &sender.public_key)?
            .ok_or_else(|| ChainError::tx_apply(tx.id, "delegate record missing on undo"))?;
        self.accounts.delete_delegate(&record, txn)?;
        sender.delegate = None;
        Ok(())
    }
}

fn checked_credit(balance: Amount, amount: Amount, tx: &Transaction) -> Result<Amount, ChainError> {
    balance
        .checked_add(amount)
        .ok_or_else(|| ChainError::tx_apply(tx.id, "balance overflow"))
}

fn checked_debit(
    balance: Amount,
    amount: Amount,
    tx: &Transaction,
    context: &str,
) -> Result<Amount, ChainError> {
    balance
        .checked_sub(amount)
        .ok_or_else(|| ChainError::tx_apply(tx.id, format!("balance underflow during {}", context)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use crate::store::ChainStore;
    use crate::tx::TxPayload;
    use crate::types::{PublicKey, SCALE};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<ChainStore>,
        accounts: AccountStore,
        executor: TransactionExecutor,
        block: Block,
    }

    fn setup() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChainStore::open(dir.path()).unwrap());
        let accounts = AccountStore::new(store.clone());
        let executor = TransactionExecutor::new(accounts.clone());
        let (generator, _) = generate_keypair();
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let block = Block::new(2, None, ts, generator, 0, 0, vec![0u8; 64], vec![]).unwrap();
        Fixture { _dir: dir, store, accounts, executor, block }
    }

    fn fund(f: &Fixture, pk: &PublicKey, amount: u128) {
        f.store
            .with_write_txn("fund", |txn| {
                let mut account = f.accounts.set_account_and_get(pk, txn)?;
                account.balance = Amount::new_raw(amount);
                account.unconfirmed_balance = Amount::new_raw(amount);
                f.accounts.put_account(&account, txn)?;
                Ok(())
            })
            .unwrap();
    }

    fn transfer(sender: PublicKey, recipient: PublicKey, amount: u128, fee: u128) -> Transaction {
        Transaction::new(
            sender,
            Amount::new_raw(fee),
            7,
            vec![1u8; 64],
            TxPayload::Transfer { recipient, amount: Amount::new_raw(amount) },
        )
        .unwrap()
    }

    #[test]
    fn transfer_apply_then_undo_restores_balances() {
        let f = setup();
        let (sender_pk, _) = generate_keypair();
        let (recipient_pk, _) = generate_keypair();
        fund(&f, &sender_pk, 100 * SCALE);

        let tx = transfer(sender_pk, recipient_pk, 30 * SCALE, SCALE);

        f.store
            .with_write_txn("apply", |txn| {
                let mut sender = f.accounts.set_account_and_get(&sender_pk, txn)?;
                f.executor.apply_unconfirmed(&tx, &mut sender, txn)?;
                let mut sender = f.accounts.set_account_and_get(&sender_pk, txn)?;
                f.executor.apply(&tx, &f.block, &mut sender, txn)?;
                Ok(())
            })
            .unwrap();

        let sender = f.accounts.get(&sender_pk).unwrap().unwrap();
        let recipient = f.accounts.get(&recipient_pk).unwrap().unwrap();
        assert_eq!(sender.balance.as_u128(), 69 * SCALE);
        assert_eq!(sender.unconfirmed_balance.as_u128(), 69 * SCALE);
        assert_eq!(recipient.balance.as_u128(), 30 * SCALE);
        assert_eq!(recipient.unconfirmed_balance.as_u128(), 30 * SCALE);

        f.store
            .with_write_txn("undo", |txn| {
                let mut sender = f.accounts.get_account(&sender_pk, txn)?;
                f.executor.undo(&tx, &f.block, &mut sender, txn)?;
                let mut sender = f.accounts.get_account(&sender_pk, txn)?;
                f.executor.undo_unconfirmed(&tx, &mut sender, txn)?;
                Ok(())
            })
            .unwrap();

        let sender = f.accounts.get(&sender_pk).unwrap().unwrap();
        let recipient = f.accounts.get(&recipient_pk).unwrap().unwrap();
        assert_eq!(sender.balance.as_u128(), 100 * SCALE);
        assert_eq!(sender.unconfirmed_balance.as_u128(), 100 * SCALE);
        assert_eq!(recipient.balance.as_u128(), 0);
        assert_eq!(recipient.unconfirmed_balance.as_u128(), 0);
    }

    #[test]
    fn unconfirmed_apply_rejects_overspend() {
        let f = setup();
        let (sender_pk, _) = generate_keypair();
        let (recipient_pk, _) = generate_keypair();
        fund(&f, &sender_pk, 10 * SCALE);

        let tx = transfer(sender_pk, recipient_pk, 10 * SCALE, 1);

        let result = f.store.with_write_txn("apply", |txn| {
            let mut sender = f.accounts.set_account_and_get(&sender_pk, txn)?;
            f.executor.apply_unconfirmed(&tx, &mut sender, txn)
        });
        assert!(matches!(result, Err(ChainError::TransactionApply { .. })));

        // aborted: balance untouched
        let sender = f.accounts.get(&sender_pk).unwrap().unwrap();
        assert_eq!(sender.unconfirmed_balance.as_u128(), 10 * SCALE);
    }

    #[test]
    fn self_transfer_is_fee_only() {
        let f = setup();
        let (sender_pk, _) = generate_keypair();
        fund(&f, &sender_pk, 50 * SCALE);

        let tx = transfer(sender_pk, sender_pk, 20 * SCALE, SCALE);

        f.store
            .with_write_txn("apply", |txn| {
                let mut sender = f.accounts.set_account_and_get(&sender_pk, txn)?;
                f.executor.apply_unconfirmed(&tx, &mut sender, txn)?;
                let mut sender = f.accounts.set_account_and_get(&sender_pk, txn)?;
                f.executor.apply(&tx, &f.block, &mut sender, txn)?;
                Ok(())
            })
            .unwrap();

        let sender = f.accounts.get(&sender_pk).unwrap().unwrap();
        assert_eq!(sender.balance.as_u128(), 49 * SCALE);
        assert_eq!(sender.unconfirmed_balance.as_u128(), 49 * SCALE);
    }

    #[test]
    fn vote_moves_delegate_weight_and_undo_restores_it() {
        let f = setup();
        let (voter_pk, _) = generate_keypair();
        let (delegate_pk, _) = generate_keypair();
        fund(&f, &voter_pk, 40 * SCALE);

        f.store
            .with_write_txn("register", |txn| {
                let record = DelegateRecord::new(delegate_pk, "validator1".to_string());
                f.accounts.put_delegate(&record, txn)?;
                Ok(())
            })
            .unwrap();

        let vote = Transaction::new(
            voter_pk,
            Amount::new_raw(SCALE),
            9,
            vec![2u8; 64],
            TxPayload::Vote { added: vec![delegate_pk], removed: vec![] },
        )
        .unwrap();

        f.store
            .with_write_txn("apply", |txn| {
                let mut sender = f.accounts.set_account_and_get(&voter_pk, txn)?;
                f.executor.apply_unconfirmed(&vote, &mut sender, txn)?;
                let mut sender = f.accounts.set_account_and_get(&voter_pk, txn)?;
                f.executor.apply(&vote, &f.block, &mut sender, txn)?;
                Ok(())
            })
            .unwrap();

        let record = f.accounts.delegate(&delegate_pk).unwrap().unwrap();
        assert_eq!(record.vote_weight.as_u128(), 39 * SCALE);
        let voter = f.accounts.get(&voter_pk).unwrap().unwrap();
        assert_eq!(voter.votes, vec![delegate_pk]);

        f.store
            .with_write_txn("undo", |txn| {
                let mut sender = f.accounts.get_account(&voter_pk, txn)?;
                f.executor.undo(&vote, &f.block, &mut sender, txn)?;
                let mut sender = f.accounts.get_account(&voter_pk, txn)?;
                f.executor.undo_unconfirmed(&vote, &mut sender, txn)?;
                Ok(())
            })
            .unwrap();

        let record = f.accounts.delegate(&delegate_pk).unwrap().unwrap();
        assert_eq!(record.vote_weight.as_u128(), 0);
        let voter = f.accounts.get(&voter_pk).unwrap().unwrap();
        assert!(voter.votes.is_empty());
        assert_eq!(voter.balance.as_u128(), 40 * SCALE);
    }

    #[test]
    fn vote_for_unknown_delegate_rejected() {
        let f = setup();
        let (voter_pk, _) = generate_keypair();
        let (ghost_pk, _) = generate_keypair();
        fund(&f, &voter_pk, 5 * SCALE);

        let vote = Transaction::new(
            voter_pk,
            Amount::new_raw(SCALE),
            11,
            vec![3u8; 64],
            TxPayload::Vote { added: vec![ghost_pk], removed: vec![] },
        )
        .unwrap();

        let result = f.store.with_write_txn("apply", |txn| {
            let mut sender = f.accounts.set_account_and_get(&voter_pk, txn)?;
            f.executor.apply(&vote, &f.block, &mut sender, txn)
        });
        assert!(matches!(result, Err(ChainError::TransactionApply { .. })));
    }

    #[test]
    fn duplicate_delegate_username_rejected() {
        let f = setup();
        let (first_pk, _) = generate_keypair();
        let (second_pk, _) = generate_keypair();
        fund(&f, &first_pk, 20 * SCALE);
        fund(&f, &second_pk, 20 * SCALE);

        let register = |sender: PublicKey, ts: i64| {
            Transaction::new(
                sender,
                Amount::new_raw(SCALE),
                ts,
                vec![4u8; 64],
                TxPayload::DelegateRegistration { username: "oracle".to_string() },
            )
            .unwrap()
        };

        f.store
            .with_write_txn("apply", |txn| {
                let mut sender = f.accounts.set_account_and_get(&first_pk, txn)?;
                f.executor.apply(&register(first_pk, 1), &f.block, &mut sender, txn)?;
                Ok(())
            })
            .unwrap();

        let result = f.store.with_write_txn("apply", |txn| {
            let mut sender = f.accounts.set_account_and_get(&second_pk, txn)?;
            f.executor.apply(&register(second_pk, 2), &f.block, &mut sender, txn)
        });
        assert!(matches!(result, Err(ChainError::TransactionApply { .. })));

        // registration undo clears record and username index
        f.store
            .with_write_txn("undo", |txn| {
                let mut sender = f.accounts.get_account(&first_pk, txn)?;
                f.executor.undo(&register(first_pk, 1), &f.block, &mut sender, txn)?;
                Ok(())
            })
            .unwrap();
        assert!(f.accounts.delegate(&first_pk).unwrap().is_none());
        let account = f.accounts.get(&first_pk).unwrap().unwrap();
        assert_eq!(account.delegate, None);
        assert_eq!(account.balance.as_u128(), 20 * SCALE);
    }
}

//! Account store: the only component that reads or writes account rows.
//!
//! Accounts expose two balance views. `balance` is the confirmed ledger after
//! all committed blocks; `unconfirmed_balance` is confirmed minus the pending
//! effects of pool transactions, used to pre-validate further pending
//! transactions. The chain mutator and transaction executor mutate accounts
//! exclusively through this API, always inside an explicitly passed write
//! transaction.

use crate::error::StoreError;
use crate::store::ChainStore;
use crate::types::{Amount, PublicKey};
use lmdb::{RwTransaction, Transaction as LmdbTxn, WriteFlags};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub public_key: PublicKey,
    /// Confirmed balance: what the ledger shows after all committed blocks.
    pub balance: Amount,
    /// Confirmed minus pending pool effects.
    pub unconfirmed_balance: Amount,
    /// Delegates this account currently votes for.
    pub votes: Vec<PublicKey>,
    /// Username if this account registered as a delegate.
    pub delegate: Option<String>,
}

impl Account {
    pub fn empty(public_key: PublicKey) -> Self {
        Account {
            public_key,
            balance: Amount::zero(),
            unconfirmed_balance: Amount::zero(),
            votes: Vec::new(),
            delegate: None,
        }
    }
}

/// Delegate registry row. Vote transactions move `vote_weight`; round
/// boundaries credit `produced_blocks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateRecord {
    pub public_key: PublicKey,
    pub username: String,
    pub vote_weight: Amount,
    pub produced_blocks: u64,
}

impl DelegateRecord {
    pub fn new(public_key: PublicKey, username: String) -> Self {
        DelegateRecord {
            public_key,
            username,
            vote_weight: Amount::zero(),
            produced_blocks: 0,
        }
    }
}

#[derive(Clone)]
pub struct AccountStore {
    store: Arc<ChainStore>,
}

impl AccountStore {
    pub fn new(store: Arc<ChainStore>) -> Self {
        AccountStore { store }
    }

    // ------------------------
    // account rows
    // ------------------------

    /// Get-or-create inside the active write transaction. New accounts start
    /// with zero balances.
    pub fn set_account_and_get(
        &self,
        public_key: &PublicKey,
        txn: &mut RwTransaction<'_>,
    ) -> Result<Account, StoreError> {
        let existing = match txn.get(self.store.db_accounts, public_key.as_bytes()) {
            Ok(v) => Some(bincode::deserialize::<Account>(v)?),
            Err(lmdb::Error::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        match existing {
            Some(account) => Ok(account),
            None => {
                let account = Account::empty(*public_key);
                self.put_account(&account, txn)?;
                Ok(account)
            }
        }
    }

    /// Strict lookup inside the active write transaction.
    pub fn get_account(
        &self,
        public_key: &PublicKey,
        txn: &RwTransaction<'_>,
    ) -> Result<Account, StoreError> {
        match txn.get(self.store.db_accounts, public_key.as_bytes()) {
            Ok(v) => Ok(bincode::deserialize(v)?),
            Err(lmdb::Error::NotFound) => {
                Err(StoreError::not_found(format!("account {}", public_key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_account(
        &self,
        account: &Account,
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), StoreError> {
        let blob = bincode::serialize(account)?;
        txn.put(
            self.store.db_accounts,
            account.public_key.as_bytes(),
            &blob,
            WriteFlags::empty(),
        )?;
        Ok(())
    }

    /// Read-only view for collaborators outside the mutator.
    pub fn get(&self, public_key: &PublicKey) -> Result<Option<Account>, StoreError> {
        let rtxn = self.store.begin_ro()?;
        match rtxn.get(self.store.db_accounts, public_key.as_bytes()) {
            Ok(v) => Ok(Some(bincode::deserialize(v)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------
    // delegate registry
    // ------------------------

    pub fn get_delegate<T: LmdbTxn>(
        &self,
        txn: &T,
        public_key: &PublicKey,
    ) -> Result<Option<DelegateRecord>, StoreError> {
        match txn.get(self.store.db_delegates, public_key.as_bytes()) {
            Ok(v) => Ok(Some(bincode::deserialize(v)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_delegate(
        &self,
        record: &DelegateRecord,
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), StoreError> {
        let blob = bincode::serialize(record)?;
        txn.put(
            self.store.db_delegates,
            record.public_key.as_bytes(),
            &blob,
            WriteFlags::empty(),
        )?;
        txn.put(
            self.store.db_delegate_names,
            &record.username.as_bytes().to_vec(),
            record.public_key.as_bytes(),
            WriteFlags::empty(),
        )?;
        Ok(())
    }

    pub fn delete_delegate(
        &self,
        record: &DelegateRecord,
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), StoreError> {
        match txn.del(self.store.db_delegates, record.public_key.as_bytes(), None) {
            Ok(()) | Err(lmdb::Error::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        match txn.del(self.store.db_delegate_names, &record.username.as_bytes().to_vec(), None) {
            Ok(()) | Err(lmdb::Error::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub fn username_taken<T: LmdbTxn>(&self, txn: &T, username: &str) -> Result<bool, StoreError> {
        match txn.get(self.store.db_delegate_names, &username.as_bytes().to_vec()) {
            Ok(_) => Ok(true),
            Err(lmdb::Error::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-only delegate view.
    pub fn delegate(&self, public_key: &PublicKey) -> Result<Option<DelegateRecord>, StoreError> {
        let rtxn = self.store.begin_ro()?;
        self.get_delegate(&rtxn, public_key)
    }
}

/// Convenience used by tests and collaborators: confirmed balance or zero.
pub fn balance_of(accounts: &AccountStore, public_key: &PublicKey) -> Amount {
    accounts
        .get(public_key)
        .ok()
        .flatten()
        .map(|a| a.balance)
        .unwrap_or_else(Amount::zero)
}

/// Convenience: unconfirmed balance or zero.
pub fn unconfirmed_balance_of(accounts: &AccountStore, public_key: &PublicKey) -> Amount {
    accounts
        .get(public_key)
        .ok()
        .flatten()
        .map(|a| a.unconfirmed_balance)
        .unwrap_or_else(Amount::zero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<ChainStore>, AccountStore) {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChainStore::open(dir.path()).unwrap());
        let accounts = AccountStore::new(store.clone());
        (dir, store, accounts)
    }

    #[test]
    fn set_account_and_get_creates_once() {
        let (_dir, store, accounts) = setup();
        let (pk, _) = generate_keypair();

        store
            .with_write_txn("test", |txn| {
                let a = accounts.set_account_and_get(&pk, txn)?;
                assert_eq!(a.balance, Amount::zero());
                Ok(())
            })
            .unwrap();

        store
            .with_write_txn("test", |txn| {
                let mut a = accounts.set_account_and_get(&pk, txn)?;
                a.balance = Amount::new_raw(500);
                accounts.put_account(&a, txn)?;
                Ok(())
            })
            .unwrap();

        let loaded = accounts.get(&pk).unwrap().expect("account");
        assert_eq!(loaded.balance.as_u128(), 500);
    }

    #[test]
    fn get_account_is_strict() {
        let (_dir, store, accounts) = setup();
        let (pk, _) = generate_keypair();

        let result = store.with_write_txn("test", |txn| {
            accounts.get_account(&pk, txn).map_err(Into::into)
        });
        assert!(result.is_err());
    }

    #[test]
    fn delegate_registry_and_username_index() {
        let (_dir, store, accounts) = setup();
        let (pk, _) = generate_keypair();

        store
            .with_write_txn("test", |txn| {
                assert!(!accounts.username_taken(txn, "stellar").unwrap());
                let record = DelegateRecord::new(pk, "stellar".to_string());
                accounts.put_delegate(&record, txn)?;
                assert!(accounts.username_taken(txn, "stellar").unwrap());
                Ok(())
            })
            .unwrap();

        let record = accounts.delegate(&pk).unwrap().expect("delegate");
        assert_eq!(record.username, "stellar");
        assert_eq!(record.produced_blocks, 0);

        store
            .with_write_txn("test", |txn| {
                let record = accounts.get_delegate(txn, &pk)?.expect("delegate");
                accounts.delete_delegate(&record, txn)?;
                assert!(!accounts.username_taken(txn, "stellar").unwrap());
                Ok(())
            })
            .unwrap();
        assert!(accounts.delegate(&pk).unwrap().is_none());
    }
}

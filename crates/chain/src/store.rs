//! LMDB-backed chain store.
//!
//! One environment, named databases per table:
//!
//! | database | key | value |
//! |---|---|---|
//! | `blocks` | block id | bincode `StoredBlock` (header + ordered tx ids) |
//! | `block_heights` | height (BE bytes) | block id |
//! | `transactions` | tx id | bincode `Transaction` with `block_id` set |
//! | `accounts` | public key | bincode `Account` |
//! | `delegates` | public key | bincode `DelegateRecord` |
//! | `delegate_names` | username bytes | delegate public key |
//! | `rounds` | round number (BE) | bincode `RoundSlots` |
//! | `meta` | fixed keys | misc markers (genesis id) |
//!
//! Every multi-write sequence goes through [`ChainStore::with_write_txn`]:
//! the body runs against a single LMDB read-write transaction which commits
//! on `Ok` and aborts on `Err`. Components never hold a private handle; the
//! active transaction is always passed by argument.

use crate::block::Block;
use crate::error::{ChainError, StoreError};
use crate::tx::Transaction;
use crate::types::{Hash, PublicKey};
use chrono::{DateTime, Utc};
use lmdb::{
    Cursor,
    Database,
    DatabaseFlags,
    Environment,
    RwTransaction,
    Transaction as LmdbTxn,
    WriteFlags,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const META_GENESIS_ID: &[u8] = b"genesis_id";

/// Persisted block row: header fields plus the ordered transaction id list.
/// Transaction bodies live in the `transactions` database; the id list here
/// is what preserves the authoritative in-block ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredBlock {
    id: Hash,
    height: u64,
    previous_block_id: Option<Hash>,
    timestamp: DateTime<Utc>,
    generator_public_key: PublicKey,
    height_previous: u32,
    height_prevoted: u32,
    payload_hash: Hash,
    signature: Vec<u8>,
    tx_ids: Vec<Hash>,
}

#[derive(Clone)]
pub struct ChainStore {
    env: Arc<Environment>,
    pub(crate) db_blocks: Database,
    pub(crate) db_block_heights: Database,
    pub(crate) db_transactions: Database,
    pub(crate) db_accounts: Database,
    pub(crate) db_delegates: Database,
    pub(crate) db_delegate_names: Database,
    pub(crate) db_rounds: Database,
    pub(crate) db_meta: Database,
}

impl ChainStore {
    /// Open the LMDB environment at `path`, creating named databases.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let p = path.as_ref();
        std::fs::create_dir_all(p)?;

        let env = Environment::new()
            .set_max_dbs(12)
            .set_map_size(1_000_000_000usize)
            .open(p)?;

        let db_blocks = env.create_db(Some("blocks"), DatabaseFlags::empty())?;
        let db_block_heights = env.create_db(Some("block_heights"), DatabaseFlags::empty())?;
        let db_transactions = env.create_db(Some("transactions"), DatabaseFlags::empty())?;
        let db_accounts = env.create_db(Some("accounts"), DatabaseFlags::empty())?;
        let db_delegates = env.create_db(Some("delegates"), DatabaseFlags::empty())?;
        let db_delegate_names = env.create_db(Some("delegate_names"), DatabaseFlags::empty())?;
        let db_rounds = env.create_db(Some("rounds"), DatabaseFlags::empty())?;
        let db_meta = env.create_db(Some("meta"), DatabaseFlags::empty())?;

        Ok(Self {
            env: Arc::new(env),
            db_blocks,
            db_block_heights,
            db_transactions,
            db_accounts,
            db_delegates,
            db_delegate_names,
            db_rounds,
            db_meta,
        })
    }

    /// Run `body` inside a single read-write transaction. Commits on `Ok`,
    /// aborts on `Err`. `name` only labels diagnostics.
    pub fn with_write_txn<T, F>(&self, name: &str, body: F) -> Result<T, ChainError>
    where
        F: for<'env> FnOnce(&mut RwTransaction<'env>) -> Result<T, ChainError>,
    {
        let mut txn = self.env.begin_rw_txn().map_err(StoreError::from)?;
        match body(&mut txn) {
            Ok(value) => {
                txn.commit().map_err(StoreError::from)?;
                Ok(value)
            }
            Err(err) => {
                txn.abort();
                debug!(txn = name, error = %err, "write transaction aborted");
                Err(err)
            }
        }
    }

    /// Begin a read-only transaction for collaborator-facing read views.
    pub(crate) fn begin_ro(&self) -> Result<lmdb::RoTransaction<'_>, StoreError> {
        Ok(self.env.begin_ro_txn()?)
    }

    pub(crate) fn height_key(height: u64) -> [u8; 8] {
        height.to_be_bytes()
    }

    fn round_key(round: u64) -> [u8; 8] {
        round.to_be_bytes()
    }

    // ------------------------
    // block operations
    // ------------------------

    /// Write the block row, its height index entry, and every transaction
    /// row (with `block_id` assigned) as one batch inside `txn`.
    pub fn save_block(&self, block: &Block, txn: &mut RwTransaction<'_>) -> Result<(), StoreError> {
        let stored = StoredBlock {
            id: block.id,
            height: block.height,
            previous_block_id: block.previous_block_id,
            timestamp: block.timestamp,
            generator_public_key: block.generator_public_key,
            height_previous: block.height_previous,
            height_prevoted: block.height_prevoted,
            payload_hash: block.payload_hash,
            signature: block.signature.clone(),
            tx_ids: block.transactions.iter().map(|tx| tx.id).collect(),
        };
        let blob = bincode::serialize(&stored)?;
        txn.put(self.db_blocks, block.id.as_bytes(), &blob, WriteFlags::empty())?;
        txn.put(
            self.db_block_heights,
            &Self::height_key(block.height),
            block.id.as_bytes(),
            WriteFlags::empty(),
        )?;

        for tx in &block.transactions {
            let mut row = tx.clone();
            row.block_id = Some(block.id);
            let tx_blob = bincode::serialize(&row)?;
            txn.put(self.db_transactions, tx.id.as_bytes(), &tx_blob, WriteFlags::empty())?;
        }
        Ok(())
    }

    /// Delete the block row, its height index entry, and its transaction
    /// rows (the relational cascade, expressed explicitly).
    pub fn delete_block(&self, id: &Hash, txn: &mut RwTransaction<'_>) -> Result<(), StoreError> {
        let stored = self
            .read_stored(txn, id)?
            .ok_or_else(|| StoreError::not_found(format!("block {}", id)))?;

        for tx_id in &stored.tx_ids {
            match txn.del(self.db_transactions, tx_id.as_bytes(), None) {
                Ok(()) | Err(lmdb::Error::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        txn.del(self.db_block_heights, &Self::height_key(stored.height), None)?;
        txn.del(self.db_blocks, id.as_bytes(), None)?;
        Ok(())
    }

    fn read_stored<T: LmdbTxn>(&self, txn: &T, id: &Hash) -> Result<Option<StoredBlock>, StoreError> {
        match txn.get(self.db_blocks, id.as_bytes()) {
            Ok(v) => Ok(Some(bincode::deserialize(v)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn assemble<T: LmdbTxn>(&self, txn: &T, stored: StoredBlock) -> Result<Block, StoreError> {
        let mut transactions = Vec::with_capacity(stored.tx_ids.len());
        for tx_id in &stored.tx_ids {
            match txn.get(self.db_transactions, tx_id.as_bytes()) {
                Ok(v) => transactions.push(bincode::deserialize::<Transaction>(v)?),
                Err(lmdb::Error::NotFound) => {
                    return Err(StoreError::Corrupt(format!(
                        "block {} references missing transaction {}",
                        stored.id, tx_id
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Block {
            id: stored.id,
            height: stored.height,
            previous_block_id: stored.previous_block_id,
            timestamp: stored.timestamp,
            generator_public_key: stored.generator_public_key,
            height_previous: stored.height_previous,
            height_prevoted: stored.height_prevoted,
            payload_hash: stored.payload_hash,
            signature: stored.signature,
            transactions,
        })
    }

    /// Load a full block (header + transactions) inside an existing
    /// transaction. Used by the delete pipeline to fetch the parent within
    /// the same atomic scope.
    pub fn read_block<T: LmdbTxn>(&self, txn: &T, id: &Hash) -> Result<Option<Block>, StoreError> {
        match self.read_stored(txn, id)? {
            Some(stored) => Ok(Some(self.assemble(txn, stored)?)),
            None => Ok(None),
        }
    }

    /// Load a full block with its own read transaction.
    pub fn get_block(&self, id: &Hash) -> Result<Option<Block>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        self.read_block(&rtxn, id)
    }

    pub fn has_block(&self, id: &Hash) -> Result<bool, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        Ok(self.read_stored(&rtxn, id)?.is_some())
    }

    pub fn get_block_at_height(&self, height: u64) -> Result<Option<Block>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        let id = match rtxn.get(self.db_block_heights, &Self::height_key(height)) {
            Ok(v) => decode_hash(v)?,
            Err(lmdb::Error::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.read_block(&rtxn, &id)
    }

    /// Highest persisted height, if any block exists.
    pub fn max_height(&self) -> Result<Option<u64>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut cursor = rtxn.open_ro_cursor(self.db_block_heights)?;
        let mut max: Option<u64> = None;
        for (key, _val) in cursor.iter() {
            if key.len() == 8 {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(key);
                max = Some(u64::from_be_bytes(arr));
            }
        }
        Ok(max)
    }

    /// Reconstruct the tip for process startup: the block at max height.
    pub fn load_last_block(&self) -> Result<Option<Block>, StoreError> {
        let height = match self.max_height()? {
            Some(h) => h,
            None => return Ok(None),
        };
        let block = self.get_block_at_height(height)?.ok_or_else(|| {
            StoreError::Corrupt(format!("height index points at missing block (height {})", height))
        })?;
        Ok(Some(block))
    }

    /// Fetch full blocks for heights `from..=to`, in ascending order. Used
    /// for replay and peer serving. A gap is a corruption.
    pub fn load_blocks_range(&self, from: u64, to: u64) -> Result<Vec<Block>, StoreError> {
        let mut out = Vec::new();
        for height in from..=to {
            match self.get_block_at_height(height)? {
                Some(block) => out.push(block),
                None => {
                    return Err(StoreError::Corrupt(format!(
                        "gap in block range: no block at height {}",
                        height
                    )));
                }
            }
        }
        Ok(out)
    }

    // ------------------------
    // transaction operations
    // ------------------------

    pub fn get_transaction(&self, id: &Hash) -> Result<Option<Transaction>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        match rtxn.get(self.db_transactions, id.as_bytes()) {
            Ok(v) => Ok(Some(bincode::deserialize(v)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn has_transaction(&self, id: &Hash) -> Result<bool, StoreError> {
        Ok(self.get_transaction(id)?.is_some())
    }

    // ------------------------
    // meta (genesis marker)
    // ------------------------

    pub fn genesis_id(&self) -> Result<Option<Hash>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        match rtxn.get(self.db_meta, &META_GENESIS_ID) {
            Ok(v) => Ok(Some(decode_hash(v)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_genesis_id(&self, id: &Hash, txn: &mut RwTransaction<'_>) -> Result<(), StoreError> {
        txn.put(self.db_meta, &META_GENESIS_ID, id.as_bytes(), WriteFlags::empty())?;
        Ok(())
    }

    // ------------------------
    // rounds (slot bookkeeping owned by the round controller)
    // ------------------------

    pub(crate) fn read_round_raw<T: LmdbTxn>(
        &self,
        txn: &T,
        round: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        match txn.get(self.db_rounds, &Self::round_key(round)) {
            Ok(v) => Ok(Some(v.to_vec())),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn write_round_raw(
        &self,
        round: u64,
        blob: &[u8],
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), StoreError> {
        txn.put(self.db_rounds, &Self::round_key(round), &blob, WriteFlags::empty())?;
        Ok(())
    }

    pub(crate) fn delete_round(
        &self,
        round: u64,
        txn: &mut RwTransaction<'_>,
    ) -> Result<(), StoreError> {
        match txn.del(self.db_rounds, &Self::round_key(round), None) {
            Ok(()) | Err(lmdb::Error::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn decode_hash(v: &[u8]) -> Result<Hash, StoreError> {
    let arr: [u8; 64] = v
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("expected 64-byte hash, got {} bytes", v.len())))?;
    Ok(Hash::from_bytes(arr))
}

//! Block structure.
//!
//! A block is a finalized unit of state change. The core treats blocks as
//! immutable once received; the order of `transactions` is authoritative and
//! is preserved on apply and reversed on undo.
use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use crate::crypto::sha3_512;
use crate::tx::Transaction;
use crate::types::{Hash, PublicKey};
use anyhow::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: Hash,
    /// Monotonically increasing; genesis = 1.
    pub height: u64,
    /// None only for genesis.
    pub previous_block_id: Option<Hash>,
    pub timestamp: DateTime<Utc>,
    pub generator_public_key: PublicKey,
    /// Previous-round checkpoint heights carried in the header. Persisted
    /// NOT NULL, default 0.
    pub height_previous: u32,
    pub height_prevoted: u32,
    /// sha3-512 over the concatenated transaction ids, in block order.
    pub payload_hash: Hash,
    /// Opaque generator signature. Verified upstream of the core.
    pub signature: Vec<u8>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble a block, computing `payload_hash` and `id`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        height: u64,
        previous_block_id: Option<Hash>,
        timestamp: DateTime<Utc>,
        generator_public_key: PublicKey,
        height_previous: u32,
        height_prevoted: u32,
        signature: Vec<u8>,
        transactions: Vec<Transaction>,
    ) -> Result<Self> {
        let payload_hash = Self::compute_payload_hash(&transactions);
        let id = Self::compute_id(
            height,
            previous_block_id.as_ref(),
            &timestamp,
            &generator_public_key,
            height_previous,
            height_prevoted,
            &payload_hash,
            &signature,
        )?;
        Ok(Block {
            id,
            height,
            previous_block_id,
            timestamp,
            generator_public_key,
            height_previous,
            height_prevoted,
            payload_hash,
            signature,
            transactions,
        })
    }

    /// payload_hash covers transaction ids only; transaction bodies are
    /// already sealed by their own ids.
    pub fn compute_payload_hash(transactions: &[Transaction]) -> Hash {
        if transactions.is_empty() {
            return sha3_512(b"");
        }
        let mut accum = Vec::with_capacity(transactions.len() * 64);
        for tx in transactions {
            accum.extend_from_slice(tx.id.as_bytes());
        }
        sha3_512(&accum)
    }

    /// id = sha3-512 over the bincode encoding of every header field except
    /// the id itself; `transactions` enter through `payload_hash`.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_id(
        height: u64,
        previous_block_id: Option<&Hash>,
        timestamp: &DateTime<Utc>,
        generator_public_key: &PublicKey,
        height_previous: u32,
        height_prevoted: u32,
        payload_hash: &Hash,
        signature: &[u8],
    ) -> Result<Hash> {
        let buf = bincode::serialize(&(
            height,
            previous_block_id,
            timestamp,
            generator_public_key,
            height_previous,
            height_prevoted,
            payload_hash,
            signature,
        ))?;
        Ok(sha3_512(&buf))
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 1
    }
}

/// Header-only view emitted on the bus for peer broadcast. Carries the
/// transaction count instead of the bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedBlock {
    pub id: Hash,
    pub height: u64,
    pub previous_block_id: Option<Hash>,
    pub timestamp: DateTime<Utc>,
    pub generator_public_key: PublicKey,
    pub height_previous: u32,
    pub height_prevoted: u32,
    pub payload_hash: Hash,
    pub number_of_transactions: usize,
}

impl From<&Block> for ReducedBlock {
    fn from(block: &Block) -> Self {
        ReducedBlock {
            id: block.id,
            height: block.height,
            previous_block_id: block.previous_block_id,
            timestamp: block.timestamp,
            generator_public_key: block.generator_public_key,
            height_previous: block.height_previous,
            height_prevoted: block.height_prevoted,
            payload_hash: block.payload_hash,
            number_of_transactions: block.transactions.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use chrono::TimeZone;

    fn empty_block(height: u64, prev: Option<Hash>) -> Block {
        let (generator, _) = generate_keypair();
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Block::new(height, prev, ts, generator, 0, 0, vec![3u8; 64], Vec::new()).unwrap()
    }

    #[test]
    fn id_changes_with_parent() {
        let genesis = empty_block(1, None);
        let a = empty_block(2, Some(genesis.id));
        let b = empty_block(2, Some(a.id));
        assert_ne!(a.id, b.id);
        assert!(genesis.is_genesis());
        assert!(!a.is_genesis());
    }

    #[test]
    fn payload_hash_tracks_tx_order() {
        use crate::tx::{Transaction, TxPayload};
        use crate::types::Amount;

        let (sender, _) = generate_keypair();
        let (recipient, _) = generate_keypair();
        let tx1 = Transaction::new(
            sender,
            Amount::new_raw(1),
            1,
            vec![1u8; 64],
            TxPayload::Transfer { recipient, amount: Amount::new_raw(10) },
        )
        .unwrap();
        let tx2 = Transaction::new(
            sender,
            Amount::new_raw(1),
            2,
            vec![2u8; 64],
            TxPayload::Transfer { recipient, amount: Amount::new_raw(20) },
        )
        .unwrap();

        let forward = Block::compute_payload_hash(&[tx1.clone(), tx2.clone()]);
        let reversed = Block::compute_payload_hash(&[tx2, tx1]);
        assert_ne!(forward, reversed);
    }

    #[test]
    fn reduced_block_carries_count_only() {
        let block = empty_block(5, Some(crate::crypto::sha3_512(b"prev")));
        let reduced = ReducedBlock::from(&block);
        assert_eq!(reduced.height, 5);
        assert_eq!(reduced.number_of_transactions, 0);
        assert_eq!(reduced.id, block.id);
    }
}

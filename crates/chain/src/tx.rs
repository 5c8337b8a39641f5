//! Transaction structure and payload variants.
//!
//! A transaction is immutable once created: the id is a sha3-512 digest over
//! the signable fields plus the signature, computed at construction. The
//! `block_id` back-reference is the only field the core ever rewrites, and
//! only when a transaction is embedded into (or popped off) a block.
use serde::{Serialize, Deserialize};
use crate::crypto::sha3_512;
use crate::types::{Amount, Hash, PublicKey};
use anyhow::Result;

/// Transaction type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    Transfer,
    Vote,
    DelegateRegistration,
}

/// Type-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPayload {
    /// Move `amount` to `recipient`; `fee` is burned from the sender.
    Transfer {
        recipient: PublicKey,
        amount: Amount,
    },

    /// Add/remove the sender's vote weight on delegates. A delegate may
    /// appear in at most one of the two lists.
    Vote {
        added: Vec<PublicKey>,
        removed: Vec<PublicKey>,
    },

    /// Register the sender as a delegate under a unique username.
    DelegateRegistration {
        username: String,
    },
}

impl TxPayload {
    pub fn tx_type(&self) -> TxType {
        match self {
            TxPayload::Transfer { .. } => TxType::Transfer,
            TxPayload::Vote { .. } => TxType::Vote,
            TxPayload::DelegateRegistration { .. } => TxType::DelegateRegistration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Hash,
    pub sender_public_key: PublicKey,
    /// Set when the transaction is embedded in a persisted block.
    pub block_id: Option<Hash>,
    pub fee: Amount,
    /// Unix seconds at creation; part of the signable bytes.
    pub timestamp: i64,
    /// Opaque sender signature over the signable bytes. Verified upstream.
    pub signature: Vec<u8>,
    pub payload: TxPayload,
}

impl Transaction {
    /// Build a transaction and compute its id.
    pub fn new(
        sender_public_key: PublicKey,
        fee: Amount,
        timestamp: i64,
        signature: Vec<u8>,
        payload: TxPayload,
    ) -> Result<Self> {
        let id = Self::compute_id(&sender_public_key, fee, timestamp, &signature, &payload)?;
        Ok(Transaction {
            id,
            sender_public_key,
            block_id: None,
            fee,
            timestamp,
            signature,
            payload,
        })
    }

    /// id = sha3-512 over the bincode encoding of (sender, fee, timestamp,
    /// payload, signature). `block_id` is excluded: embedding a transaction
    /// does not change its identity.
    pub fn compute_id(
        sender: &PublicKey,
        fee: Amount,
        timestamp: i64,
        signature: &[u8],
        payload: &TxPayload,
    ) -> Result<Hash> {
        let buf = bincode::serialize(&(sender, fee, timestamp, payload, signature))?;
        Ok(sha3_512(&buf))
    }

    pub fn tx_type(&self) -> TxType {
        self.payload.tx_type()
    }

    pub fn is_vote(&self) -> bool {
        matches!(self.payload, TxPayload::Vote { .. })
    }

    /// Total unconfirmed/confirmed debit against the sender: amount + fee for
    /// transfers, fee alone otherwise. None on overflow.
    pub fn total_debit(&self) -> Option<Amount> {
        match &self.payload {
            TxPayload::Transfer { amount, .. } => self.fee.checked_add(*amount),
            _ => Some(self.fee),
        }
    }
}

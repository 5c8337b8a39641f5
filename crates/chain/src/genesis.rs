//! Genesis block construction.
//!
//! A genesis block sits at height 1 with no parent. Its transactions carry
//! zero fees; balances seeded here are the initial token distribution the
//! bootstrap replay applies against a clean account store.

use crate::block::Block;
use crate::tx::{Transaction, TxPayload};
use crate::types::{Amount, PublicKey};
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};

/// Network epoch used when no explicit genesis timestamp is configured.
pub const GENESIS_EPOCH_SECS: i64 = 1_590_000_000;

pub struct GenesisBuilder {
    generator: PublicKey,
    timestamp: DateTime<Utc>,
    transactions: Vec<Transaction>,
    seq: i64,
}

impl GenesisBuilder {
    pub fn new(generator: PublicKey) -> Self {
        GenesisBuilder {
            generator,
            timestamp: Utc.timestamp_opt(GENESIS_EPOCH_SECS, 0).unwrap(),
            transactions: Vec::new(),
            seq: 0,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    fn push(&mut self, sender: PublicKey, payload: TxPayload) -> Result<()> {
        // distinct timestamps keep genesis transaction ids distinct
        let tx = Transaction::new(sender, Amount::zero(), self.seq, Vec::new(), payload)?;
        self.seq += 1;
        self.transactions.push(tx);
        Ok(())
    }

    /// Seed `recipient` with `amount`, sent by the genesis generator.
    pub fn transfer(mut self, recipient: PublicKey, amount: Amount) -> Result<Self> {
        let generator = self.generator;
        self.push(generator, TxPayload::Transfer { recipient, amount })?;
        Ok(self)
    }

    pub fn transfer_from(
        mut self,
        sender: PublicKey,
        recipient: PublicKey,
        amount: Amount,
    ) -> Result<Self> {
        self.push(sender, TxPayload::Transfer { recipient, amount })?;
        Ok(self)
    }

    /// Register `delegate` under `username` at genesis.
    pub fn delegate(mut self, delegate: PublicKey, username: impl Into<String>) -> Result<Self> {
        self.push(delegate, TxPayload::DelegateRegistration { username: username.into() })?;
        Ok(self)
    }

    /// Cast genesis votes from `voter`.
    pub fn vote(mut self, voter: PublicKey, added: Vec<PublicKey>) -> Result<Self> {
        self.push(voter, TxPayload::Vote { added, removed: Vec::new() })?;
        Ok(self)
    }

    /// Assemble the genesis block in the raw (declared) transaction order.
    /// The bootstrap replay sorts votes last; the block itself preserves the
    /// declaration order.
    pub fn build(self) -> Result<Block> {
        Block::new(
            1,
            None,
            self.timestamp,
            self.generator,
            0,
            0,
            Vec::new(),
            self.transactions,
        )
    }
}

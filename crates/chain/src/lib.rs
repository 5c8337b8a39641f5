//! # Orbita Chain Core Library
//!
//! Block application and chain mutation core for the Orbita
//! delegated-proof-of-stake ledger. This crate owns the one place where
//! ordering, atomicity, persistence, and reversibility intersect: taking a
//! fully-validated candidate block and atomically advancing the persistent
//! chain state by one height, with a symmetric rollback path.
//!
//! ## Module Overview
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | `types` | Core types: `PublicKey`, `Hash`, `Amount`, supply constants |
//! | `crypto` | SHA3-512 identifiers, ed25519 key material for fixtures |
//! | `block` | `Block`, `ReducedBlock`, id and payload-hash computation |
//! | `tx` | `Transaction`, payload variants (transfer, vote, registration) |
//! | `error` | `ChainError` taxonomy incl. the ConsistencyFatal family |
//! | `store` | LMDB persistence: tables, write-transaction scope, replay reads |
//! | `account` | Account store: confirmed/unconfirmed balances, delegate registry |
//! | `executor` | Per-transaction apply/undo in unconfirmed and confirmed modes |
//! | `rounds` | Round controller: forward/backward ticks, snapshot sentinel |
//! | `pool` | Transaction pool: admission, unconfirmed effect bookkeeping |
//! | `last_block` | Single-slot register for the current tip |
//! | `bus` | Event fan-out: `newBlock`, `broadcastBlock`, `transactionsSaved` |
//! | `chain` | `ChainMutator`: the apply/undo pipelines and genesis bootstrap |
//! | `genesis` | Genesis block builder |
//!
//! ## Apply pipeline (consensus-critical ordering)
//!
//! ```text
//! 1. Preconditions: height == tip + 1, parent id matches, not active
//! 2. Undo every pooled transaction's unconfirmed effect (outside the txn)
//! 3. In one write transaction:
//!      apply-unconfirmed per transaction, in block order
//!      apply-confirmed  per transaction, same order
//!      save block + transaction rows (when persisting)
//!      forward round tick
//! 4. On commit: prune pool, update last-block register, emit newBlock
//! ```
//!
//! Deletion mirrors it exactly: parent load, per-transaction undo
//! (confirmed then unconfirmed, tail-to-head), backward tick, row delete,
//! register update, transactions back to the pool.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use orbita_chain::{ChainMutator, ChainStore, DposRounds, MessageBus};
//!
//! let store = Arc::new(ChainStore::open("./data")?);
//! let rounds = Box::new(DposRounds::new(store.clone()));
//! let mutator = ChainMutator::new(store, rounds, MessageBus::new(), genesis);
//! mutator.save_genesis_block()?;
//! mutator.apply_genesis_block(&genesis)?;
//! let tip = mutator.apply_block(candidate, true)?;
//! ```

pub mod types;
pub mod crypto;
pub mod error;
pub mod block;
pub mod tx;
pub mod store;
pub mod account;
pub mod executor;
pub mod rounds;
pub mod pool;
pub mod last_block;
pub mod bus;
pub mod chain;
pub mod genesis;

pub use account::{Account, AccountStore, DelegateRecord};
pub use block::{Block, ReducedBlock};
pub use bus::{ChainEvent, MessageBus};
pub use chain::ChainMutator;
pub use error::{ChainError, StoreError, ValidationKind};
pub use executor::TransactionExecutor;
pub use genesis::GenesisBuilder;
pub use last_block::LastBlockRegister;
pub use pool::TransactionPool;
pub use rounds::{DposRounds, RoundController, DEFAULT_ROUND_LENGTH};
pub use store::ChainStore;
pub use tx::{Transaction, TxPayload, TxType};
pub use types::{Amount, Hash, PublicKey};

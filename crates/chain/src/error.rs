//! Error taxonomy for the chain core.
//!
//! Four recoverable kinds (validation, transaction apply, storage) and a
//! fatal family: once memory tables can diverge from storage the embedding
//! process must shut the node down. The library itself never terminates the
//! process; `ChainError::is_fatal()` is the supervisor's signal.

use crate::types::Hash;
use thiserror::Error;

/// Storage-layer failures. Wrapped into `ChainError::Storage` at the
/// component boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lmdb error: {0}")]
    Lmdb(#[from] lmdb::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{what} not found")]
    NotFound { what: String },

    /// A stored record contradicts the chain invariants (dangling tx id,
    /// height index without a block row, undecodable row).
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound { what: what.into() }
    }
}

/// Precondition violations surfaced to the caller. Recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationKind {
    #[error("unexpected block height: expected {expected}, got {actual}")]
    UnexpectedHeight { expected: u64, actual: u64 },

    #[error("unexpected parent block: expected {expected}, got {actual}")]
    UnexpectedParent { expected: String, actual: String },

    #[error("the genesis block cannot be deleted")]
    CannotDeleteGenesis,

    #[error("chain has no tip yet; bootstrap from genesis first")]
    NotBootstrapped,

    #[error("another chain mutation is in flight")]
    MutationInProgress,
}

/// Error type for every public chain-core operation.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Precondition violated. The caller may retry with different input.
    #[error("validation failed: {0}")]
    Validation(ValidationKind),

    /// A transaction's effect could not be committed. The enclosing write
    /// transaction aborts; the caller may re-request a different block.
    #[error("transaction {id} could not be applied: {reason}")]
    TransactionApply { id: Hash, reason: String },

    /// Persistence-layer I/O failure. Aborts; retryable.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    /// Rolling back the unconfirmed pool failed. Memory tables no longer
    /// match storage.
    #[error("fatal: undoing the unconfirmed pool failed: {0}")]
    UnconfirmedUndoFatal(String),

    /// Undoing a committed block failed mid-way.
    #[error("fatal: undo of block {id} failed: {reason}")]
    BlockUndoFatal { id: Hash, reason: String },

    /// The parent of the current tip could not be loaded.
    #[error("fatal: parent block {id} is missing from storage")]
    ParentMissing { id: Hash },

    /// A round tick failed inside the persistence transaction.
    #[error("fatal: round tick failed: {0}")]
    RoundTickFatal(String),

    /// Genesis replay failed; the node cannot bootstrap.
    #[error("fatal: genesis block could not be applied: {0}")]
    GenesisApplyFatal(String),

    /// Orderly-termination sentinel from the round controller's snapshot
    /// mode. Not a failure: the supervisor should shut the process down.
    #[error("snapshot finished")]
    SnapshotComplete,
}

impl ChainError {
    pub fn validation(kind: ValidationKind) -> Self {
        ChainError::Validation(kind)
    }

    pub fn tx_apply(id: Hash, reason: impl Into<String>) -> Self {
        ChainError::TransactionApply { id, reason: reason.into() }
    }

    /// True for the ConsistencyFatal family: the embedding process must map
    /// these to shutdown and never retry in-process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChainError::UnconfirmedUndoFatal(_)
                | ChainError::BlockUndoFatal { .. }
                | ChainError::ParentMissing { .. }
                | ChainError::RoundTickFatal(_)
                | ChainError::GenesisApplyFatal(_)
        )
    }

    /// True for the snapshot sentinel: success plus a shutdown request.
    pub fn is_shutdown_signal(&self) -> bool {
        matches!(self, ChainError::SnapshotComplete)
    }
}

use alloy::primitives::U256;
use rollup_smt::SmtError;
use thiserror::Error;

use crate::events::LogPosition;
use crate::types::{AccountIdx, BatchNumber, CoinId};

/// Malformed base-ledger data. The batch it belongs to stays unconsolidated
/// and is retried once the ledger data is fetched again.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{what} is {len} bytes long, not a multiple of the {record}-byte record size")]
    TruncatedRecords {
        what: &'static str,
        len: usize,
        record: usize,
    },

    #[error("transaction record {0} has a zero sender index")]
    ZeroSender(usize),

    #[error("transaction record {0} sends to its own sender")]
    SelfTransfer(usize),

    #[error("transaction record {0} has a zero amount")]
    ZeroAmount(usize),

    #[error("fee plan lists {coins} coins but {rates} rates")]
    FeePlanLength { coins: usize, rates: usize },

    #[error("fee plan lists coin {0} twice")]
    DuplicateFeeCoin(CoinId),

    #[error("coin {0} is not registered")]
    UnknownCoin(CoinId),

    #[error("value {value} does not fit in {field}")]
    Overflow { field: &'static str, value: U256 },

    #[error("log {0} is missing its position in the ledger")]
    MissingLogPosition(&'static str),

    #[error("invalid ABI encoding for {what}: {reason}")]
    Abi { what: &'static str, reason: String },
}

/// Failures of the state tree engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("account {0} does not exist")]
    MissingAccount(AccountIdx),

    #[error("account {0} already exists")]
    AccountExists(AccountIdx),

    #[error("account {0} does not match its leaf in the tree")]
    LeafMismatch(AccountIdx),

    #[error("rebuilt root {computed:#x} does not match the recorded root {expected:#x}")]
    RootMismatch { computed: U256, expected: U256 },

    #[error("account index {0} is outside the tree")]
    IndexOutOfRange(AccountIdx),

    #[error("account {idx} duplicates the identity of account {existing}")]
    DuplicateIdentity {
        idx: AccountIdx,
        existing: AccountIdx,
    },

    #[error(transparent)]
    Tree(#[from] SmtError),
}

/// Why a transaction cannot be applied. Only a contract that accepted a
/// batch it should not have would produce one of these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidTransaction {
    #[error("nonce {found} does not match account nonce {expected}")]
    Nonce { expected: u64, found: u64 },

    #[error("account holds coin {account}, transaction moves coin {tx}")]
    CoinMismatch { account: CoinId, tx: CoinId },

    #[error("balance {balance} cannot cover {amount}")]
    InsufficientBalance { balance: U256, amount: U256 },

    #[error("fee {fee} exceeds amount {amount}")]
    FeeExceedsAmount { fee: U256, amount: U256 },

    #[error("balance overflows")]
    Overflow,
}

/// Failure to replay a batch. The batch is never partially applied.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsolidationError {
    #[error("batch {batch}: computed state root {computed:#x}, ledger holds {expected:#x}")]
    RootMismatch {
        batch: BatchNumber,
        computed: U256,
        expected: U256,
    },

    #[error("batch {batch}: computed exit root {computed:#x}, ledger holds {expected:#x}")]
    ExitRootMismatch {
        batch: BatchNumber,
        computed: U256,
        expected: U256,
    },

    #[error("batch {batch}: expected batch {expected} next")]
    OutOfOrder {
        batch: BatchNumber,
        expected: BatchNumber,
    },

    #[error("batch {batch}, transaction {tx}: {source}")]
    CorruptState {
        batch: BatchNumber,
        tx: usize,
        #[source]
        source: StateError,
    },

    #[error("batch {batch}, transaction {tx}: {source}")]
    InvalidTransaction {
        batch: BatchNumber,
        tx: usize,
        #[source]
        source: InvalidTransaction,
    },

    #[error("batch {batch}: account tree: {source}")]
    AccountTree {
        batch: BatchNumber,
        #[source]
        source: StateError,
    },

    #[error("batch {batch}: exit tree: {source}")]
    ExitTree {
        batch: BatchNumber,
        #[source]
        source: StateError,
    },
}

/// Failures of the persistent key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored record {key} is unreadable: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("stored state does not match its checkpoint: {0}")]
    Inconsistent(String),
}

/// Errors surfaced by the synchronizer loop.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Ledger unreachable or slow. Retried after a backoff.
    #[error("ledger access failed: {0:#}")]
    Transient(anyhow::Error),

    #[error("log at {position:?} cannot be decoded: {source}")]
    Log {
        position: Option<LogPosition>,
        #[source]
        source: DecodeError,
    },

    #[error("batch {batch} cannot be decoded: {source}")]
    Decode {
        batch: BatchNumber,
        #[source]
        source: DecodeError,
    },

    #[error(transparent)]
    Consolidation(#[from] ConsolidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Fatal errors stop the loop. The last published state stays queryable.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Transient(_) | SyncError::Log { .. } | SyncError::Decode { .. } => false,
            SyncError::Consolidation(_) | SyncError::Store(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality() {
        assert!(!SyncError::Transient(anyhow::anyhow!("timeout")).is_fatal());
        assert!(!SyncError::Decode {
            batch: 3,
            source: DecodeError::ZeroSender(0)
        }
        .is_fatal());
        assert!(SyncError::from(ConsolidationError::RootMismatch {
            batch: 3,
            computed: U256::from(1),
            expected: U256::from(2),
        })
        .is_fatal());
        assert!(SyncError::from(StoreError::Inconsistent("root".into())).is_fatal());
    }

    #[test]
    fn messages_name_the_batch() {
        let err = ConsolidationError::InvalidTransaction {
            batch: 9,
            tx: 2,
            source: InvalidTransaction::Nonce {
                expected: 1,
                found: 4,
            },
        };
        assert_eq!(
            err.to_string(),
            "batch 9, transaction 2: nonce 4 does not match account nonce 1"
        );
    }
}

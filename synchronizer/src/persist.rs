//! Layout of the synchronizer state in a [`KvStore`].
//!
//! | key                 | value                                   |
//! |---------------------|-----------------------------------------|
//! | `checkpoint`        | [`Checkpoint`]                          |
//! | `smt/<node hash>`   | `(hash, node)` of the account tree      |
//! | `acct/<idx>`        | [`AccountState`]                        |
//! | `batch/<n>`         | [`BatchSummary`]                        |
//! | `exit/<n>`          | [`ExitRecord`]                          |
//! | `registry/coins`    | [`CoinRegistry`]                        |
//! | `registry/fees`     | [`FeeRegistry`]                         |
//! | `registry/operators`| [`OperatorRegistry`]                    |
//!
//! Numbers in keys are fixed-width hex so that key order is numeric order.
//! Values are JSON.

use std::collections::BTreeSet;
use std::sync::Arc;

use alloy::primitives::U256;
use plonky2::field::types::PrimeField64;
use rollup_smt::utils::u2hashout;
use rollup_smt::{Key, Node};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SyncMode;
use crate::error::StoreError;
use crate::events::LogPosition;
use crate::exit_tree::{ExitArchive, ExitRecord, ExitTree};
use crate::fees::{CoinRegistry, FeeRegistry};
use crate::operators::OperatorRegistry;
use crate::snapshot::Snapshot;
use crate::state::{StateChanges, StateTree};
use crate::store::{KvStore, WriteBatch};
use crate::types::{AccountIdx, AccountState, BatchNumber, BatchSummary, PendingDeposit};

const CHECKPOINT: &str = "checkpoint";
const SMT_PREFIX: &str = "smt/";
const ACCOUNT_PREFIX: &str = "acct/";
const BATCH_PREFIX: &str = "batch/";
const EXIT_PREFIX: &str = "exit/";
const COINS: &str = "registry/coins";
const FEES: &str = "registry/fees";
const OPERATORS: &str = "registry/operators";

/// Where the replay stands. Written with every commit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// First block the next poll fetches.
    pub next_block: u64,
    /// Last block fully replayed, `None` before the first poll completes.
    pub last_block: Option<u64>,
    pub last_batch: BatchNumber,
    pub mode: SyncMode,
    pub state_root: U256,
    pub next_idx: AccountIdx,
    /// Deposits seen on the ledger whose batch is not consolidated yet.
    pub pending_deposits: Vec<(LogPosition, PendingDeposit)>,
}

/// What changed since the previous commit.
#[derive(Debug, Default)]
pub struct Delta {
    pub changes: StateChanges,
    pub batches: BTreeSet<BatchNumber>,
    /// Exit trees created, updated or dropped.
    pub exits: BTreeSet<BatchNumber>,
}

impl Delta {
    pub fn absorb(&mut self, changes: StateChanges) {
        self.changes.nodes.extend(changes.nodes);
        self.changes.accounts.extend(changes.accounts);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.nodes.is_empty()
            && self.changes.accounts.is_empty()
            && self.batches.is_empty()
            && self.exits.is_empty()
    }
}

fn node_key(key: &Key) -> String {
    let [a, b, c, d] = key.0.map(|x| x.to_canonical_u64());
    format!("{SMT_PREFIX}{a:016x}{b:016x}{c:016x}{d:016x}")
}

fn numbered(prefix: &str, n: u64) -> String {
    format!("{prefix}{n:016x}")
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        source,
    })
}

/// Typed access to the synchronizer's records in a [`KvStore`].
#[derive(Debug)]
pub struct StateStore<S> {
    kv: S,
}

impl<S: KvStore> StateStore<S> {
    pub fn new(kv: S) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &S {
        &self.kv
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.kv
            .get(key.as_bytes())?
            .map(|bytes| decode(key.as_bytes(), &bytes))
            .transpose()
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StoreError> {
        self.kv
            .scan_prefix(prefix.as_bytes())?
            .iter()
            .map(|(k, v)| decode(k, v))
            .collect()
    }

    pub fn checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        self.get(CHECKPOINT)
    }

    /// Rebuilds the last committed snapshot, or `None` for an empty store.
    pub fn load(&self) -> Result<Option<(Snapshot, Checkpoint)>, StoreError> {
        let Some(checkpoint) = self.checkpoint()? else {
            return Ok(None);
        };

        let nodes: Vec<(Key, Node)> = self.scan(SMT_PREFIX)?;
        let accounts: Vec<AccountState> = self.scan(ACCOUNT_PREFIX)?;
        let account_count = accounts.len();
        let state = StateTree::restore(
            nodes,
            u2hashout(checkpoint.state_root),
            accounts,
            checkpoint.next_idx,
        )
        .map_err(|e| StoreError::Inconsistent(format!("account tree: {e}")))?;
        if state.root_u256() != checkpoint.state_root {
            return Err(StoreError::Inconsistent(format!(
                "account tree root {:#x}, checkpoint holds {:#x}",
                state.root_u256(),
                checkpoint.state_root
            )));
        }

        let mut exits = ExitArchive::default();
        for record in self.scan::<ExitRecord>(EXIT_PREFIX)? {
            let batch = record.batch;
            let tree = ExitTree::from_record(record)
                .map_err(|e| StoreError::Inconsistent(format!("exit tree {batch}: {e}")))?;
            exits.insert(tree);
        }

        let batches = self
            .scan::<BatchSummary>(BATCH_PREFIX)?
            .into_iter()
            .map(|s| (s.number, s))
            .collect();

        let snapshot = Snapshot {
            last_batch: checkpoint.last_batch,
            last_block: checkpoint.last_block.unwrap_or_default(),
            state: Arc::new(state),
            exits: Arc::new(exits),
            batches: Arc::new(batches),
            coins: Arc::new(self.get::<CoinRegistry>(COINS)?.unwrap_or_default()),
            fees: Arc::new(self.get::<FeeRegistry>(FEES)?.unwrap_or_default()),
            operators: Arc::new(self.get::<OperatorRegistry>(OPERATORS)?.unwrap_or_default()),
        };
        debug!(
            accounts = account_count,
            exit_trees = snapshot.exits.len(),
            last_batch = snapshot.last_batch,
            "loaded checkpoint"
        );
        Ok(Some((snapshot, checkpoint)))
    }

    /// Writes `delta` and `checkpoint` in one atomic batch. Registries are
    /// small and rewritten whole.
    pub fn commit(
        &self,
        checkpoint: &Checkpoint,
        snapshot: &Snapshot,
        delta: Delta,
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();

        for (key, node) in &delta.changes.nodes {
            let k = node_key(key);
            match node {
                Some(node) => batch.put(k.clone(), encode(&k, &(key, node))?),
                None => batch.delete(k),
            }
        }
        for (idx, account) in &delta.changes.accounts {
            let k = numbered(ACCOUNT_PREFIX, *idx);
            match account {
                Some(account) => batch.put(k.clone(), encode(&k, account)?),
                None => batch.delete(k),
            }
        }
        for n in &delta.batches {
            if let Some(summary) = snapshot.batches.get(n) {
                let k = numbered(BATCH_PREFIX, *n);
                batch.put(k.clone(), encode(&k, summary)?);
            }
        }
        for n in &delta.exits {
            let k = numbered(EXIT_PREFIX, *n);
            match snapshot.exits.get(*n) {
                Some(tree) => batch.put(k.clone(), encode(&k, &tree.to_record())?),
                None => batch.delete(k),
            }
        }

        batch.put(COINS, encode(COINS, snapshot.coins.as_ref())?);
        batch.put(FEES, encode(FEES, snapshot.fees.as_ref())?);
        batch.put(OPERATORS, encode(OPERATORS, snapshot.operators.as_ref())?);
        batch.put(CHECKPOINT, encode(CHECKPOINT, checkpoint)?);

        debug!(
            writes = batch.len(),
            next_block = checkpoint.next_block,
            last_batch = checkpoint.last_batch,
            "committing checkpoint"
        );
        self.kv.write_batch(batch)
    }
}

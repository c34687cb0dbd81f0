//! Per-batch exit trees: what each owner may withdraw on the base ledger
//! after a batch, and the proofs that back the withdrawal.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use alloy::primitives::U256;
use rollup_smt::db::MemoryDb;
use rollup_smt::smt::HashOut;
use rollup_smt::{Key, MerkleProof, Smt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{InvalidTransaction, StateError};
use crate::types::{AccountIdx, AccountState, BatchNumber, CoinId, Identity};

/// A leaf of an exit tree. `account.balance` is the withdrawable amount.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitLeaf {
    pub account: AccountState,
    pub withdrawn: bool,
}

/// Collects the exits of the batch being replayed.
#[derive(Debug, Default)]
pub struct ExitTreeBuilder {
    leaves: BTreeMap<AccountIdx, AccountState>,
}

impl ExitTreeBuilder {
    /// Adds `amount` to the exit leaf of `sender`, which holds the sender's
    /// latest state with its balance replaced by the total exited amount.
    pub fn add(&mut self, sender: &AccountState, amount: U256) -> Result<(), InvalidTransaction> {
        let total = match self.leaves.get(&sender.idx) {
            Some(prev) => prev
                .balance
                .checked_add(amount)
                .ok_or(InvalidTransaction::Overflow)?,
            None => amount,
        };
        self.leaves.insert(
            sender.idx,
            AccountState {
                balance: total,
                ..sender.clone()
            },
        );
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Total exited per coin.
    pub fn totals(&self) -> BTreeMap<CoinId, U256> {
        let mut out = BTreeMap::<CoinId, U256>::new();
        for leaf in self.leaves.values() {
            let slot = out.entry(leaf.coin).or_default();
            *slot = slot.saturating_add(leaf.balance);
        }
        out
    }

    pub fn freeze(self, batch: BatchNumber) -> Result<ExitTree, StateError> {
        ExitTree::build(
            batch,
            self.leaves.into_values().map(|account| ExitLeaf {
                account,
                withdrawn: false,
            }),
        )
    }
}

/// The frozen exit tree of one batch. Only withdrawal flags change after
/// consolidation, and they are not part of the root.
#[derive(Clone, Debug)]
pub struct ExitTree {
    batch: BatchNumber,
    smt: Smt<MemoryDb>,
    leaves: BTreeMap<AccountIdx, ExitLeaf>,
    by_identity: HashMap<Identity, AccountIdx>,
}

/// Persisted form of an [`ExitTree`]. Nodes are recomputed on load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub batch: BatchNumber,
    pub root: U256,
    pub leaves: Vec<ExitLeaf>,
}

impl ExitTree {
    pub fn build(
        batch: BatchNumber,
        leaves: impl IntoIterator<Item = ExitLeaf>,
    ) -> Result<Self, StateError> {
        let mut tree = Self {
            batch,
            smt: Smt::default(),
            leaves: BTreeMap::new(),
            by_identity: HashMap::new(),
        };
        for leaf in leaves {
            let idx = leaf.account.idx;
            if tree.leaves.contains_key(&idx) {
                return Err(StateError::AccountExists(idx));
            }
            tree.smt
                .set(Key::from_index(idx), leaf.account.leaf_hash())?;
            tree.by_identity.insert(leaf.account.identity(), idx);
            tree.leaves.insert(idx, leaf);
        }
        // Exit trees are persisted as leaves, not nodes.
        tree.smt.prune()?;
        tree.smt.db.take_journal();
        Ok(tree)
    }

    pub fn from_record(record: ExitRecord) -> Result<Self, StateError> {
        let tree = Self::build(record.batch, record.leaves)?;
        if tree.root_u256() != record.root {
            return Err(StateError::RootMismatch {
                computed: tree.root_u256(),
                expected: record.root,
            });
        }
        Ok(tree)
    }

    pub fn to_record(&self) -> ExitRecord {
        ExitRecord {
            batch: self.batch,
            root: self.root_u256(),
            leaves: self.leaves.values().cloned().collect(),
        }
    }

    pub fn batch(&self) -> BatchNumber {
        self.batch
    }

    pub fn root(&self) -> HashOut {
        self.smt.root
    }

    pub fn root_u256(&self) -> U256 {
        self.smt.root_u256()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &ExitLeaf> {
        self.leaves.values()
    }

    pub fn find(&self, identity: &Identity) -> Option<&ExitLeaf> {
        self.by_identity
            .get(identity)
            .and_then(|idx| self.leaves.get(idx))
    }

    /// Inclusion proof of the leaf at `idx`, or a proof of its absence.
    pub fn proof(&self, idx: AccountIdx) -> Result<MerkleProof, StateError> {
        Ok(self.smt.prove(Key::from_index(idx))?)
    }

    pub fn fully_withdrawn(&self) -> bool {
        self.leaves.values().all(|l| l.withdrawn)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WithdrawOutcome {
    Withdrawn { pruned: bool },
    AlreadyWithdrawn,
    Unknown,
}

/// Exit trees of consolidated batches, and which batches each identity
/// exited in.
#[derive(Clone, Debug, Default)]
pub struct ExitArchive {
    trees: BTreeMap<BatchNumber, Arc<ExitTree>>,
    by_identity: HashMap<Identity, BTreeSet<BatchNumber>>,
}

impl ExitArchive {
    pub fn insert(&mut self, tree: ExitTree) {
        for leaf in tree.leaves() {
            self.by_identity
                .entry(leaf.account.identity())
                .or_default()
                .insert(tree.batch);
        }
        self.trees.insert(tree.batch, Arc::new(tree));
    }

    pub fn get(&self, batch: BatchNumber) -> Option<&ExitTree> {
        self.trees.get(&batch).map(Arc::as_ref)
    }

    pub fn contains(&self, batch: BatchNumber) -> bool {
        self.trees.contains_key(&batch)
    }

    pub fn trees(&self) -> impl Iterator<Item = &ExitTree> {
        self.trees.values().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    /// Batches holding an exit leaf for `identity`, in ascending order.
    pub fn batches_for(&self, identity: &Identity) -> Vec<BatchNumber> {
        self.by_identity
            .get(identity)
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Records the on-chain withdrawal of leaf `idx` of `batch`. With
    /// `prune`, a tree is dropped once all of its leaves are withdrawn.
    pub fn mark_withdrawn(
        &mut self,
        batch: BatchNumber,
        idx: AccountIdx,
        prune: bool,
    ) -> WithdrawOutcome {
        let Some(tree) = self.trees.get_mut(&batch) else {
            return WithdrawOutcome::Unknown;
        };
        match tree.leaves.get(&idx) {
            None => return WithdrawOutcome::Unknown,
            Some(leaf) if leaf.withdrawn => return WithdrawOutcome::AlreadyWithdrawn,
            Some(_) => {}
        }
        let tree = Arc::make_mut(tree);
        if let Some(leaf) = tree.leaves.get_mut(&idx) {
            leaf.withdrawn = true;
        }

        let pruned = prune && tree.fully_withdrawn();
        if pruned {
            self.remove(batch);
            debug!(batch, "dropped fully withdrawn exit tree");
        }
        WithdrawOutcome::Withdrawn { pruned }
    }

    fn remove(&mut self, batch: BatchNumber) {
        let Some(tree) = self.trees.remove(&batch) else {
            return;
        };
        for leaf in tree.leaves() {
            let identity = leaf.account.identity();
            if let Some(set) = self.by_identity.get_mut(&identity) {
                set.remove(&batch);
                if set.is_empty() {
                    self.by_identity.remove(&identity);
                }
            }
        }
    }
}

//! Read-only access to the last published snapshot.
//!
//! Every call loads the published snapshot once and answers from it, so a
//! call never mixes two batches. Callers that need several answers from the
//! same batch take a [`StateQuery::snapshot`] and query it directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use rollup_common::EraClock;
use rollup_smt::utils::hashout2u;
use rollup_smt::MerkleProof;
use serde::Serialize;

use crate::error::StateError;
use crate::operators::Operator;
use crate::snapshot::{Published, Snapshot};
use crate::types::{AccountIdx, AccountState, BatchNumber, BatchSummary, CoinId, Identity, PublicKey};

/// An account leaf with its Merkle path against `root`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccountProof {
    pub idx: AccountIdx,
    pub account: Option<AccountState>,
    pub root: U256,
    /// Sibling hashes from the root down, in on-chain encoding.
    pub siblings: Vec<U256>,
    pub proof: MerkleProof,
}

/// What an owner may withdraw after a batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub batch: BatchNumber,
    pub found: bool,
    /// The exit leaf; its balance is the withdrawable amount.
    pub state: Option<AccountState>,
    pub withdrawn: bool,
    pub root: U256,
    pub siblings: Vec<U256>,
    pub proof: Option<MerkleProof>,
}

fn siblings(proof: &MerkleProof) -> Vec<U256> {
    proof.siblings.iter().copied().map(hashout2u).collect()
}

#[derive(Clone, Debug)]
pub struct StateQuery {
    published: Published,
    clock: EraClock,
}

impl StateQuery {
    pub fn new(published: Published, clock: EraClock) -> Self {
        Self { published, clock }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.published.load()
    }

    pub fn last_batch(&self) -> BatchNumber {
        self.snapshot().last_batch
    }

    pub fn state_root(&self) -> U256 {
        self.snapshot().state.root_u256()
    }

    /// The account of `key` for `coin`, `None` if it was never created.
    pub fn get_state_by_account(&self, coin: CoinId, ax: U256, ay: U256) -> Option<AccountState> {
        let identity = Identity::new(coin, PublicKey::new(ax, ay));
        self.snapshot().state.find(&identity).cloned()
    }

    /// Accounts of `key` in every coin.
    pub fn get_state_by_public_key(&self, ax: U256, ay: U256) -> Vec<AccountState> {
        self.snapshot()
            .state
            .by_public_key(&PublicKey::new(ax, ay))
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn get_state_by_address(&self, address: Address) -> Vec<AccountState> {
        self.snapshot()
            .state
            .by_address(&address)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn get_state_by_index(&self, idx: AccountIdx) -> Option<AccountState> {
        self.snapshot().state.get(idx).cloned()
    }

    /// Merkle proof of account `idx`, or of its absence.
    pub fn get_account_proof(&self, idx: AccountIdx) -> Result<AccountProof, StateError> {
        let snapshot = self.snapshot();
        let proof = snapshot.state.proof(idx)?;
        Ok(AccountProof {
            idx,
            account: snapshot.state.get(idx).cloned(),
            root: snapshot.state.root_u256(),
            siblings: siblings(&proof),
            proof,
        })
    }

    /// Batches whose exit tree holds a leaf for the identity. Pruned trees
    /// are not listed.
    pub fn get_exit_batches(&self, coin: CoinId, ax: U256, ay: U256) -> Vec<BatchNumber> {
        let identity = Identity::new(coin, PublicKey::new(ax, ay));
        self.snapshot().exits.batches_for(&identity)
    }

    /// The exit leaf of the identity in `batch` with its proof. `None` when
    /// the batch has no exit tree, `found == false` when the tree has no
    /// leaf for the identity.
    pub fn get_exit_proof(
        &self,
        batch: BatchNumber,
        coin: CoinId,
        ax: U256,
        ay: U256,
    ) -> Result<Option<ExitInfo>, StateError> {
        let snapshot = self.snapshot();
        let Some(tree) = snapshot.exits.get(batch) else {
            return Ok(None);
        };
        let identity = Identity::new(coin, PublicKey::new(ax, ay));
        let root = tree.root_u256();

        let Some(leaf) = tree.find(&identity) else {
            return Ok(Some(ExitInfo {
                batch,
                found: false,
                state: None,
                withdrawn: false,
                root,
                siblings: Vec::new(),
                proof: None,
            }));
        };
        let proof = tree.proof(leaf.account.idx)?;
        Ok(Some(ExitInfo {
            batch,
            found: proof.found(),
            state: Some(leaf.account.clone()),
            withdrawn: leaf.withdrawn,
            root,
            siblings: siblings(&proof),
            proof: Some(proof),
        }))
    }

    pub fn get_batch(&self, number: BatchNumber) -> Option<BatchSummary> {
        self.snapshot().batches.get(&number).cloned()
    }

    pub fn get_coins(&self) -> BTreeMap<CoinId, Address> {
        self.snapshot().coins.iter().collect()
    }

    /// Fees collected per coin since the first batch.
    pub fn get_fee_totals(&self) -> BTreeMap<CoinId, U256> {
        self.snapshot().fees.totals().clone()
    }

    /// Operators allowed to forge in the era of the last replayed block.
    pub fn get_active_operators(&self) -> Vec<Operator> {
        let snapshot = self.snapshot();
        let era = self.clock.era_of(snapshot.last_block);
        snapshot.operators.active(era).into_iter().cloned().collect()
    }

    pub fn get_active_operators_at(&self, era: u64) -> Vec<Operator> {
        self.snapshot()
            .operators
            .active(era)
            .into_iter()
            .cloned()
            .collect()
    }
}

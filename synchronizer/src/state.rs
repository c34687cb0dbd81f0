//! The account tree: a sparse Merkle tree keyed by account index, plus the
//! secondary indexes used to find accounts by owner.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use alloy::primitives::{Address, U256};
use rollup_common::{FIRST_ACCOUNT_IDX, MAX_ACCOUNT_IDX};
use rollup_smt::db::MemoryDb;
use rollup_smt::smt::HashOut;
use rollup_smt::{Key, MerkleProof, Node, Smt};
use tracing::trace;

use crate::error::StateError;
use crate::types::{AccountIdx, AccountState, Identity, PublicKey};

/// Accounts and the tree committing to them.
///
/// Index `0` is never used: it is the exit sentinel. Indices are handed out
/// densely from [`FIRST_ACCOUNT_IDX`] and never reused, even once an account
/// is removed.
#[derive(Clone, Debug)]
pub struct StateTree {
    smt: Smt<MemoryDb>,
    accounts: BTreeMap<AccountIdx, AccountState>,
    by_identity: HashMap<Identity, AccountIdx>,
    by_key: HashMap<PublicKey, BTreeSet<AccountIdx>>,
    by_address: HashMap<Address, BTreeSet<AccountIdx>>,
    next_idx: AccountIdx,
    /// Accounts touched since the last [`StateTree::take_changes`].
    dirty: BTreeSet<AccountIdx>,
}

impl Default for StateTree {
    fn default() -> Self {
        Self {
            smt: Smt::default(),
            accounts: BTreeMap::new(),
            by_identity: HashMap::new(),
            by_key: HashMap::new(),
            by_address: HashMap::new(),
            next_idx: FIRST_ACCOUNT_IDX,
            dirty: BTreeSet::new(),
        }
    }
}

/// What changed in a [`StateTree`] since the previous drain. `nodes` and
/// `accounts` map each touched key to its new value, `None` once dropped.
#[derive(Debug, Default)]
pub struct StateChanges {
    pub nodes: Vec<(Key, Option<Node>)>,
    pub accounts: Vec<(AccountIdx, Option<AccountState>)>,
}

impl StateTree {
    /// Rebuilds a tree from persisted nodes and accounts, checking that both
    /// agree with `root`.
    pub fn restore(
        nodes: impl IntoIterator<Item = (Key, Node)>,
        root: HashOut,
        accounts: impl IntoIterator<Item = AccountState>,
        next_idx: AccountIdx,
    ) -> Result<Self, StateError> {
        let mut db = MemoryDb::default();
        db.extend(nodes);
        let mut tree = Self {
            smt: Smt::with_root(db, root),
            next_idx: next_idx.max(FIRST_ACCOUNT_IDX),
            ..Default::default()
        };
        for account in accounts {
            let stored = tree.smt.get(Key::from_index(account.idx))?;
            if stored != Some(account.leaf_hash()) {
                return Err(StateError::LeafMismatch(account.idx));
            }
            tree.check_unique(&account)?;
            tree.index(&account);
            tree.accounts.insert(account.idx, account);
        }
        // Stores written before pruning existed may hold unreachable nodes.
        tree.smt.prune()?;
        Ok(tree)
    }

    pub fn root(&self) -> HashOut {
        self.smt.root
    }

    /// Root in the form the rollup contract stores it.
    pub fn root_u256(&self) -> U256 {
        self.smt.root_u256()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Index the next created account will get.
    pub fn next_idx(&self) -> AccountIdx {
        self.next_idx
    }

    pub fn get(&self, idx: AccountIdx) -> Option<&AccountState> {
        self.accounts.get(&idx)
    }

    pub fn find(&self, identity: &Identity) -> Option<&AccountState> {
        self.by_identity
            .get(identity)
            .and_then(|idx| self.accounts.get(idx))
    }

    pub fn by_public_key(&self, key: &PublicKey) -> Vec<&AccountState> {
        self.lookup(self.by_key.get(key))
    }

    pub fn by_address(&self, address: &Address) -> Vec<&AccountState> {
        self.lookup(self.by_address.get(address))
    }

    fn lookup(&self, idxs: Option<&BTreeSet<AccountIdx>>) -> Vec<&AccountState> {
        idxs.into_iter()
            .flatten()
            .filter_map(|idx| self.accounts.get(idx))
            .collect()
    }

    pub fn accounts(&self) -> impl Iterator<Item = &AccountState> {
        self.accounts.values()
    }

    fn check_unique(&self, account: &AccountState) -> Result<(), StateError> {
        match self.by_identity.get(&account.identity()) {
            Some(&existing) if existing != account.idx => Err(StateError::DuplicateIdentity {
                idx: account.idx,
                existing,
            }),
            _ => Ok(()),
        }
    }

    fn index(&mut self, account: &AccountState) {
        self.by_identity.insert(account.identity(), account.idx);
        self.by_key
            .entry(account.key)
            .or_default()
            .insert(account.idx);
        self.by_address
            .entry(account.address)
            .or_default()
            .insert(account.idx);
    }

    fn unindex(&mut self, account: &AccountState) {
        self.by_identity.remove(&account.identity());
        if let Some(set) = self.by_key.get_mut(&account.key) {
            set.remove(&account.idx);
            if set.is_empty() {
                self.by_key.remove(&account.key);
            }
        }
        if let Some(set) = self.by_address.get_mut(&account.address) {
            set.remove(&account.idx);
            if set.is_empty() {
                self.by_address.remove(&account.address);
            }
        }
    }

    /// Adds a leaf at `account.idx`, which must be free.
    pub fn insert(&mut self, account: AccountState) -> Result<(), StateError> {
        if account.idx < FIRST_ACCOUNT_IDX || account.idx > MAX_ACCOUNT_IDX {
            return Err(StateError::IndexOutOfRange(account.idx));
        }
        if self.accounts.contains_key(&account.idx) {
            return Err(StateError::AccountExists(account.idx));
        }
        self.check_unique(&account)?;
        self.smt
            .set(Key::from_index(account.idx), account.leaf_hash())?;
        self.index(&account);
        self.next_idx = self.next_idx.max(account.idx + 1);
        self.dirty.insert(account.idx);
        self.accounts.insert(account.idx, account);
        Ok(())
    }

    /// Creates an account at the next free index.
    pub fn create(
        &mut self,
        identity: Identity,
        address: Address,
        balance: U256,
    ) -> Result<AccountIdx, StateError> {
        let idx = self.next_idx;
        self.insert(AccountState {
            idx,
            coin: identity.coin,
            key: identity.key,
            address,
            balance,
            nonce: 0,
        })?;
        Ok(idx)
    }

    /// Applies `f` to the leaf at `idx` and recommits it. The owner fields
    /// are not expected to change.
    pub fn update<T, E>(
        &mut self,
        idx: AccountIdx,
        f: impl FnOnce(&mut AccountState) -> Result<T, E>,
    ) -> Result<Result<T, E>, StateError> {
        let Some(account) = self.accounts.get_mut(&idx) else {
            return Err(StateError::MissingAccount(idx));
        };
        let mut next = account.clone();
        let out = match f(&mut next) {
            Ok(out) => out,
            Err(e) => return Ok(Err(e)),
        };
        self.smt.set(Key::from_index(idx), next.leaf_hash())?;
        *account = next;
        self.dirty.insert(idx);
        Ok(Ok(out))
    }

    /// Removes the leaf at `idx`. Its index is not handed out again.
    pub fn remove(&mut self, idx: AccountIdx) -> Result<AccountState, StateError> {
        if !self.accounts.contains_key(&idx) {
            return Err(StateError::MissingAccount(idx));
        }
        self.smt.delete(Key::from_index(idx))?;
        let account = self
            .accounts
            .remove(&idx)
            .ok_or(StateError::MissingAccount(idx))?;
        self.unindex(&account);
        self.dirty.insert(idx);
        Ok(account)
    }

    /// Merkle proof of the leaf at `idx`, or of its absence.
    pub fn proof(&self, idx: AccountIdx) -> Result<MerkleProof, StateError> {
        Ok(self.smt.prove(Key::from_index(idx))?)
    }

    /// Number of tree nodes held in memory.
    pub fn node_count(&self) -> usize {
        self.smt.db.len()
    }

    /// Drops tree nodes left behind by earlier updates, then drains the
    /// nodes and accounts changed since the previous call.
    pub fn take_changes(&mut self) -> Result<StateChanges, StateError> {
        let pruned = self.smt.prune()?;
        trace!(pruned, nodes = self.smt.db.len(), "pruned account tree");
        let nodes = self.smt.db.take_journal();
        let accounts = std::mem::take(&mut self.dirty)
            .into_iter()
            .map(|idx| (idx, self.accounts.get(&idx).cloned()))
            .collect();
        Ok(StateChanges { nodes, accounts })
    }
}

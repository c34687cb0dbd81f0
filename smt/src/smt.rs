#![allow(clippy::needless_range_loop)]

use std::collections::HashSet;

use plonky2::field::goldilocks_field::GoldilocksField;
use plonky2::field::types::{Field, PrimeField64};
use plonky2::hash::poseidon::PoseidonHash;
use plonky2::plonk::config::Hasher;
use ruint::aliases::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bits::{Bit, Bits};
use crate::db::Db;
use crate::proof::{MerkleProof, ProofTerminal};
use crate::utils::{hash_key_hash, hash_node, hashout2u, unique_child};

pub type F = GoldilocksField;
pub type Hash = PoseidonHash;
pub type HashOut = <PoseidonHash as Hasher<F>>::Hash;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key(pub [F; 4]);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node(pub [F; 12]);

/// Stores the result of tree operations.
pub type SmtResult<T> = Result<T, SmtError>;

/// An error type for tree operations. Any of these means the node store does
/// not hold the tree its root claims.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum SmtError {
    /// A node referenced by its parent is missing from the store.
    #[error("Node {0:?} referenced by the tree is missing from the node store")]
    MissingNode(Key),

    /// A node that should hold at least one child has none.
    #[error("Internal node {0:?} has no children left after a deletion")]
    EmptyInternalNode(Key),
}

impl Key {
    pub const ZERO: Key = Key([F::ZERO; 4]);

    /// Key of the leaf holding account `idx`.
    pub fn from_index(idx: u64) -> Self {
        Key([F::from_noncanonical_u64(idx), F::ZERO, F::ZERO, F::ZERO])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(F::is_zero)
    }

    /// The path of this key through the tree: bit `i` of limb `j` is taken at
    /// depth `4 * i + j`.
    pub fn split(&self) -> Bits {
        let mut bits = Bits::empty();
        let mut arr: [_; 4] = std::array::from_fn(|i| self.0[i].to_canonical_u64());
        for _ in 0..64 {
            for j in 0..4 {
                bits.push_bit(arr[j] & 1 == 1);
                arr[j] >>= 1;
            }
        }
        bits
    }

    /// Rebuilds a full key from the path walked so far and the remaining key
    /// stored in a leaf.
    pub fn join(bits: Bits, rem_key: Self) -> Self {
        let mut n = [0u32; 4];
        let mut accs = [0u64; 4];
        for i in 0..bits.count {
            if bits.get_bit(i) {
                accs[i % 4] |= 1 << n[i % 4];
            }
            n[i % 4] += 1;
        }
        Key(std::array::from_fn(|i| {
            let rem = rem_key.0[i].to_canonical_u64().checked_shl(n[i]).unwrap_or(0);
            F::from_canonical_u64(rem | accs[i])
        }))
    }

    /// The key left once the first `nbits` steps of the path are consumed.
    pub(crate) fn remove_key_bits(&self, nbits: usize) -> Self {
        let full_levels = nbits / 4;
        let mut auxk = self.0.map(|x| x.to_canonical_u64());
        for i in 0..4 {
            let mut n = full_levels;
            if full_levels * 4 + i < nbits {
                n += 1;
            }
            auxk[i] >>= n;
        }
        Key(auxk.map(F::from_canonical_u64))
    }
}

impl Node {
    pub const EMPTY: Node = Node([F::ZERO; 12]);

    /// A leaf: remaining key, value hash and the leaf marker at index 8.
    pub fn leaf(rem_key: Key, value: [F; 4]) -> Self {
        let mut node = Self::EMPTY;
        node.0[0..4].copy_from_slice(&rem_key.0);
        node.0[4..8].copy_from_slice(&value);
        node.0[8] = F::ONE;
        node
    }

    pub fn is_leaf(&self) -> bool {
        self.0[8].is_one()
    }

    pub fn child(&self, right: Bit) -> Key {
        let i = right as usize * 4;
        Key([self.0[i], self.0[i + 1], self.0[i + 2], self.0[i + 3]])
    }

    pub fn set_child(&mut self, right: Bit, hash: [F; 4]) {
        let i = right as usize * 4;
        self.0[i..i + 4].copy_from_slice(&hash);
    }

    pub fn rem_key(&self) -> Key {
        self.child(false)
    }

    pub fn value_hash(&self) -> [F; 4] {
        self.child(true).0
    }
}

/// Sparse Merkle tree (SMT).
///
/// Leaves hold the hash of a value together with the key bits not consumed by
/// their position, so a leaf sits at the shallowest depth that still
/// distinguishes it from every other key. Internal nodes hold the hashes of
/// their two children. Leaves are hashed with a capacity of `[1,0,0,0]`,
/// internal nodes with `[0,0,0,0]`. The empty tree has an all-zero root.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Smt<D: Db> {
    pub db: D,
    pub root: HashOut,
}

impl<D: Db> Smt<D> {
    /// Reopens a tree over an existing node store.
    pub fn with_root(db: D, root: HashOut) -> Self {
        Self { db, root }
    }

    /// The root as anchored on the base ledger.
    pub fn root_u256(&self) -> U256 {
        hashout2u(self.root)
    }

    fn node(&self, key: &Key) -> SmtResult<Node> {
        self.db
            .get_node(key)
            .copied()
            .ok_or(SmtError::MissingNode(*key))
    }

    /// Hashes an internal node and saves it in the DB.
    fn store_internal(&mut self, node: Node) -> [F; 4] {
        let h = hash_node(&node);
        self.db.set_node(Key(h), node);
        h
    }

    /// Returns `Poseidon(key || h, [1,0,0,0])` and saves the leaf in the DB.
    fn store_leaf(&mut self, k: Key, h: [F; 4]) -> [F; 4] {
        let hash = hash_key_hash(k, h);
        self.db.set_node(Key(hash), Node::leaf(k, h));
        hash
    }

    /// Returns the value hash stored under `key`, if any.
    pub fn get(&self, key: Key) -> SmtResult<Option<HashOut>> {
        let path = key.split();
        let mut level = 0;
        let mut acc_key = Bits::empty();
        let mut r = Key(self.root.elements);

        while !r.is_zero() {
            let node = self.node(&r)?;
            if node.is_leaf() {
                let found_key = Key::join(acc_key, node.rem_key());
                return Ok((found_key == key).then_some(HashOut {
                    elements: node.value_hash(),
                }));
            }
            let b = path.get_bit(level);
            r = node.child(b);
            acc_key.push_bit(b);
            level += 1;
        }
        Ok(None)
    }

    /// Set the value hash associated with the key. A zero value removes the
    /// key, collapsing any branch left with a single leaf so the resulting
    /// root only depends on the set of keys and values present.
    pub fn set(&mut self, key: Key, value: HashOut) -> SmtResult<()> {
        let value = value.elements;
        let removing = value.iter().all(F::is_zero);
        let path = key.split();
        let mut r = Key(self.root.elements);
        let mut new_root = self.root.elements;
        let mut level = 0isize;
        let mut acc_key = Bits::empty();
        // (full key, remaining key, value hash) of the leaf ending the walk.
        let mut found: Option<(Key, Key, [F; 4])> = None;
        let mut siblings = vec![];

        while !r.is_zero() {
            let node = self.node(&r)?;
            siblings.push(node);
            if node.is_leaf() {
                let rem_key = node.rem_key();
                found = Some((Key::join(acc_key, rem_key), rem_key, node.value_hash()));
                break;
            }
            let b = path.get_bit(level as usize);
            r = node.child(b);
            acc_key.push_bit(b);
            level += 1;
        }

        // `level` now indexes the deepest internal node on the path, `acc_key`
        // is the path leading to it.
        level -= 1;
        if !acc_key.is_empty() {
            acc_key.pop_last();
        }

        match found {
            Some((found_key, _, _)) if removing && found_key == key => {
                if level >= 0 {
                    let lvl = level as usize;
                    siblings[lvl].set_child(path.get_bit(lvl), [F::ZERO; 4]);
                    let Some(side) = unique_child(&siblings[lvl]) else {
                        return Err(SmtError::EmptyInternalNode(Key(hash_node(&siblings[lvl]))));
                    };
                    let sibling = self.node(&siblings[lvl].child(side))?;
                    siblings[lvl + 1] = sibling;
                    if sibling.is_leaf() {
                        // The remaining sibling leaf climbs up as long as its
                        // ancestors have no other child.
                        let val_h = sibling.value_hash();
                        let ins_key = Key::join(acc_key.with_bit(side), sibling.rem_key());
                        let mut lone = true;
                        while lone && level >= 0 {
                            level -= 1;
                            if level >= 0 {
                                lone = unique_child(&siblings[level as usize]).is_some();
                            }
                        }

                        let old_key = ins_key.remove_key_bits((level + 1) as usize);
                        let old_leaf_hash = self.store_leaf(old_key, val_h);
                        if level >= 0 {
                            let lvl = level as usize;
                            siblings[lvl].set_child(path.get_bit(lvl), old_leaf_hash);
                        } else {
                            new_root = old_leaf_hash;
                        }
                    }
                } else {
                    new_root = [F::ZERO; 4];
                }
            }
            // Removing a key that is not present leaves the tree unchanged.
            _ if removing => {}
            Some((found_key, found_rem_key, _)) if found_key == key => {
                let new_leaf_hash = self.store_leaf(found_rem_key, value);
                if level >= 0 {
                    let lvl = level as usize;
                    siblings[lvl].set_child(path.get_bit(lvl), new_leaf_hash);
                } else {
                    new_root = new_leaf_hash;
                }
            }
            Some((found_key, _, found_val)) => {
                // Push both leaves down to the first depth where their paths
                // diverge.
                let found_path = found_key.split();
                let mut level2 = (level + 1) as usize;
                while path.get_bit(level2) == found_path.get_bit(level2) {
                    level2 += 1;
                }
                let old_leaf_hash =
                    self.store_leaf(found_key.remove_key_bits(level2 + 1), found_val);
                let new_leaf_hash = self.store_leaf(key.remove_key_bits(level2 + 1), value);

                let mut node = Node::EMPTY;
                node.set_child(path.get_bit(level2), new_leaf_hash);
                node.set_child(found_path.get_bit(level2), old_leaf_hash);
                let mut r2 = self.store_internal(node);
                let mut level2 = level2 as isize - 1;

                while level2 != level {
                    let mut node = Node::EMPTY;
                    node.set_child(path.get_bit(level2 as usize), r2);
                    r2 = self.store_internal(node);
                    level2 -= 1;
                }

                if level >= 0 {
                    let lvl = level as usize;
                    siblings[lvl].set_child(path.get_bit(lvl), r2);
                } else {
                    new_root = r2;
                }
            }
            None => {
                let new_key = key.remove_key_bits((level + 1) as usize);
                let new_leaf_hash = self.store_leaf(new_key, value);
                if level >= 0 {
                    let lvl = level as usize;
                    siblings[lvl].set_child(path.get_bit(lvl), new_leaf_hash);
                } else {
                    new_root = new_leaf_hash;
                }
            }
        }

        siblings.truncate((level + 1) as usize);
        while level >= 0 {
            new_root = self.store_internal(siblings[level as usize]);
            level -= 1;
            if level >= 0 {
                let lvl = level as usize;
                siblings[lvl].set_child(path.get_bit(lvl), new_root);
            }
        }
        self.root = HashOut { elements: new_root };
        Ok(())
    }

    /// Drops every stored node the current root no longer reaches and
    /// returns how many went. Older roots cannot be read afterwards.
    pub fn prune(&mut self) -> SmtResult<usize> {
        let mut live = HashSet::new();
        let mut pending = vec![Key(self.root.elements)];
        while let Some(k) = pending.pop() {
            if k.is_zero() || !live.insert(k) {
                continue;
            }
            let node = self.node(&k)?;
            if !node.is_leaf() {
                pending.push(node.child(false));
                pending.push(node.child(true));
            }
        }
        Ok(self.db.retain_nodes(&live))
    }

    /// Delete the key in the SMT.
    pub fn delete(&mut self, key: Key) -> SmtResult<()> {
        self.set(key, HashOut::ZERO)
    }

    /// Builds the Merkle path for `key`. The proof shows inclusion when the
    /// key is present and non-inclusion otherwise.
    pub fn prove(&self, key: Key) -> SmtResult<MerkleProof> {
        let path = key.split();
        let mut siblings = vec![];
        let mut r = Key(self.root.elements);
        let mut terminal = ProofTerminal::Empty;

        while !r.is_zero() {
            let node = self.node(&r)?;
            if node.is_leaf() {
                terminal = ProofTerminal::Leaf {
                    rem_key: node.rem_key(),
                    value: HashOut {
                        elements: node.value_hash(),
                    },
                };
                break;
            }
            let b = path.get_bit(siblings.len());
            siblings.push(HashOut {
                elements: node.child(!b).0,
            });
            r = node.child(b);
        }

        Ok(MerkleProof {
            key,
            siblings,
            terminal,
        })
    }
}

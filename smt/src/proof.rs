use plonky2::field::types::Field;
use serde::{Deserialize, Serialize};

use crate::bits::{Bits, KEY_BITS};
use crate::smt::{HashOut, Key, Node, F};
use crate::utils::{hash_key_hash, hash_node};

/// What the walk towards a key ended on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofTerminal {
    /// An empty subtree: the key is absent.
    Empty,
    /// A leaf. It holds the key itself when its remaining key matches,
    /// otherwise it proves that the key is absent.
    Leaf { rem_key: Key, value: HashOut },
}

/// Merkle path from the root down to where `key` lives or would live.
/// `siblings[i]` is the hash of the subtree hanging off the path at depth `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub key: Key,
    pub siblings: Vec<HashOut>,
    pub terminal: ProofTerminal,
}

impl MerkleProof {
    /// A path through a tree of distinct keys is shorter than a key.
    fn well_formed(&self) -> bool {
        self.siblings.len() < KEY_BITS
    }

    /// Whether the proof shows `key` to be present.
    pub fn found(&self) -> bool {
        if !self.well_formed() {
            return false;
        }
        match self.terminal {
            ProofTerminal::Empty => false,
            ProofTerminal::Leaf { rem_key, .. } => {
                let path: Bits = self.key.split().prefix(self.siblings.len());
                Key::join(path, rem_key) == self.key
            }
        }
    }

    /// The value hash proven for `key`, if present.
    pub fn value(&self) -> Option<HashOut> {
        match self.terminal {
            ProofTerminal::Leaf { value, .. } if self.found() => Some(value),
            _ => None,
        }
    }

    /// Recomputes the root from the path and compares it with `root`.
    pub fn verify(&self, root: HashOut) -> bool {
        if !self.well_formed() {
            return false;
        }
        let path = self.key.split();
        let mut cur = match self.terminal {
            ProofTerminal::Empty => [F::ZERO; 4],
            ProofTerminal::Leaf { rem_key, value } => hash_key_hash(rem_key, value.elements),
        };
        for (depth, sibling) in self.siblings.iter().enumerate().rev() {
            let b = path.get_bit(depth);
            let mut node = Node::EMPTY;
            node.set_child(b, cur);
            node.set_child(!b, sibling.elements);
            cur = hash_node(&node);
        }
        cur == root.elements
    }
}

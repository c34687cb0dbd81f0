use plonky2::field::types::{Field, PrimeField64};
use plonky2::hash::poseidon::{Poseidon, PoseidonHash};
use plonky2::plonk::config::Hasher;
use ruint::aliases::U256;

use crate::smt::{HashOut, Key, Node, F};

fn first_four(x: [F; 12]) -> [F; 4] {
    [x[0], x[1], x[2], x[3]]
}

/// Returns `Poseidon(key || h, [1,0,0,0])`, the hash of a leaf holding the
/// remaining key bits `k` and the value hash `h`.
pub(crate) fn hash_key_hash(k: Key, h: [F; 4]) -> [F; 4] {
    first_four(F::poseidon(Node::leaf(k, h).0))
}

/// Hash of a stored node, `Poseidon(left || right, [0,0,0,0])` for internal
/// nodes. Internal and leaf nodes differ by the capacity element at index 8.
pub(crate) fn hash_node(node: &Node) -> [F; 4] {
    first_four(F::poseidon(node.0))
}

/// Poseidon sponge over an arbitrary number of field elements. Used to turn a
/// leaf's attributes into the value hash stored in the tree.
pub fn hash_fields(fields: &[F]) -> HashOut {
    PoseidonHash::hash_no_pad(fields)
}

/// Split a U256 into 8 32-bit limbs in little-endian order.
pub fn u256_limbs(x: U256) -> [F; 8] {
    let limbs = x.as_limbs();
    std::array::from_fn(|i| F::from_canonical_u32((limbs[i / 2] >> (32 * (i % 2))) as u32))
}

/// Split 20 address bytes into 5 big-endian 32-bit limbs.
pub fn address_limbs(addr: &[u8; 20]) -> [F; 5] {
    std::array::from_fn(|i| {
        F::from_canonical_u32(u32::from_be_bytes([
            addr[4 * i],
            addr[4 * i + 1],
            addr[4 * i + 2],
            addr[4 * i + 3],
        ]))
    })
}

/// Convert a `HashOut` to a `U256`, lowest limb first. This is how roots are
/// anchored on-chain.
pub fn hashout2u(h: HashOut) -> U256 {
    key2u(Key(h.elements))
}

/// Convert a `Key` to a `U256`.
pub fn key2u(key: Key) -> U256 {
    U256::from_limbs(key.0.map(|x| x.to_canonical_u64()))
}

/// Convert a `U256` produced by [`hashout2u`] back into a `HashOut`. Limbs
/// outside the field are reduced, so only round-trips of real hashes are
/// exact.
pub fn u2hashout(x: U256) -> HashOut {
    HashOut {
        elements: x.as_limbs().map(F::from_noncanonical_u64),
    }
}

/// Given a node, return the side of its unique non-empty child, or `None` if
/// it has zero or two children.
pub(crate) fn unique_child(node: &Node) -> Option<bool> {
    match (node.child(false).is_zero(), node.child(true).is_zero()) {
        (false, true) => Some(false),
        (true, false) => Some(true),
        _ => None,
    }
}

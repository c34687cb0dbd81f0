#![allow(clippy::too_long_first_doc_paragraph)]

pub mod bits;
pub mod db;
pub mod proof;
pub mod smt;
pub mod utils;

pub use proof::{MerkleProof, ProofTerminal};
pub use smt::{Key, Node, Smt, SmtError, F};

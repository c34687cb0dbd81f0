//! Domain types shared by the decoder, the state engine and the query layer.

use std::fmt;

use alloy::primitives::{Address, U256};
use plonky2::field::types::Field;
use rollup_smt::smt::HashOut;
use rollup_smt::utils::{address_limbs, hash_fields, u256_limbs};
use rollup_smt::F;
use serde::{Deserialize, Serialize};

/// Position of a leaf in the state tree.
pub type AccountIdx = u64;

/// Token identifier assigned by the rollup contract.
pub type CoinId = u16;

/// Sequence number of a forged batch. The first batch is `1`.
pub type BatchNumber = u64;

/// Baby-jubjub public key owning rollup accounts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey {
    pub ax: U256,
    pub ay: U256,
}

impl PublicKey {
    pub const fn new(ax: U256, ay: U256) -> Self {
        Self { ax, ay }
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:#x}, {:#x})", self.ax, self.ay)
    }
}

/// `(coin, Ax, Ay)`: at most one live account exists per identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub coin: CoinId,
    pub key: PublicKey,
}

impl Identity {
    pub const fn new(coin: CoinId, key: PublicKey) -> Self {
        Self { coin, key }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coin {} key {}", self.coin, self.key)
    }
}

/// A leaf of the state tree. Exit trees use the same layout, with `balance`
/// holding the amount withdrawable by the owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub idx: AccountIdx,
    pub coin: CoinId,
    pub key: PublicKey,
    pub address: Address,
    pub balance: U256,
    pub nonce: u64,
}

impl AccountState {
    pub fn identity(&self) -> Identity {
        Identity::new(self.coin, self.key)
    }

    /// Value hash committed to by the tree: coin, nonce, then the 32-bit
    /// limbs of the balance, `Ax`, `Ay` and the address.
    pub fn leaf_hash(&self) -> HashOut {
        let mut fields = Vec::with_capacity(2 + 8 * 3 + 5);
        fields.push(F::from_canonical_u32(self.coin as u32));
        fields.push(F::from_noncanonical_u64(self.nonce));
        fields.extend(u256_limbs(self.balance));
        fields.extend(u256_limbs(self.key.ax));
        fields.extend(u256_limbs(self.key.ay));
        fields.extend(address_limbs(&self.address.0 .0));
        hash_fields(&fields)
    }
}

/// One state transition of a batch, in replay order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transaction {
    /// Funds locked in the rollup contract through an `OnChainTx` event.
    /// Credits the identity's account, creating it if needed.
    Deposit {
        coin: CoinId,
        key: PublicKey,
        address: Address,
        amount: U256,
    },
    /// Account creation submitted by the operator with the batch. Carries no
    /// funds.
    CreateAccount {
        coin: CoinId,
        key: PublicKey,
        address: Address,
    },
    /// Off-chain transfer between two accounts of the same coin.
    Transfer {
        from: AccountIdx,
        to: AccountIdx,
        coin: CoinId,
        amount: U256,
        fee: U256,
        nonce: u64,
    },
    /// Off-chain transfer to the exit sentinel. Moves `amount - fee` into the
    /// batch's exit tree.
    Exit {
        from: AccountIdx,
        coin: CoinId,
        amount: U256,
        fee: U256,
        nonce: u64,
    },
}

impl Transaction {
    pub fn coin(&self) -> CoinId {
        match self {
            Self::Deposit { coin, .. }
            | Self::CreateAccount { coin, .. }
            | Self::Transfer { coin, .. }
            | Self::Exit { coin, .. } => *coin,
        }
    }
}

/// A deposit seen on the base ledger and waiting for the batch it was
/// attributed to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDeposit {
    pub batch: BatchNumber,
    pub coin: CoinId,
    pub key: PublicKey,
    pub address: Address,
    pub amount: U256,
}

impl From<PendingDeposit> for Transaction {
    fn from(d: PendingDeposit) -> Self {
        Transaction::Deposit {
            coin: d.coin,
            key: d.key,
            address: d.address,
            amount: d.amount,
        }
    }
}

/// A forged batch, decoded and ready to be replayed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub number: BatchNumber,
    /// Base-ledger block holding the `ForgeBatch` event.
    pub block: u64,
    pub fee_plan: crate::fees::FeePlan,
    pub transactions: Vec<Transaction>,
    /// Roots the contract accepted for this batch.
    pub state_root: U256,
    pub exit_root: U256,
}

/// What a consolidated batch did, kept for queries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub number: BatchNumber,
    pub block: u64,
    pub state_root: U256,
    pub exit_root: U256,
    pub transactions: usize,
    pub accounts_created: usize,
    /// Value that entered the tree through deposits, per coin.
    pub deposited: std::collections::BTreeMap<CoinId, U256>,
    /// Value moved into the exit tree, per coin.
    pub exited: std::collections::BTreeMap<CoinId, U256>,
    /// Fees collected by the operator, per coin.
    pub fees: std::collections::BTreeMap<CoinId, U256>,
}

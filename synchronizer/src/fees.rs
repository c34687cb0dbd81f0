//! Registered coins and the per-batch fee schedule.

use std::collections::BTreeMap;

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DecodeError, InvalidTransaction};
use crate::types::{BatchNumber, CoinId};

/// Coins registered with the rollup contract through `AddToken`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinRegistry {
    tokens: BTreeMap<CoinId, Address>,
}

impl CoinRegistry {
    /// Records `coin` as representing `token`. A coin id is bound once; a
    /// later registration with another token is ignored.
    pub fn register(&mut self, coin: CoinId, token: Address) {
        match self.tokens.get(&coin) {
            None => {
                self.tokens.insert(coin, token);
            }
            Some(existing) if *existing != token => {
                warn!(coin, %existing, %token, "ignoring re-registration of coin");
            }
            Some(_) => {}
        }
    }

    pub fn contains(&self, coin: CoinId) -> bool {
        self.tokens.contains_key(&coin)
    }

    pub fn token(&self, coin: CoinId) -> Option<Address> {
        self.tokens.get(&coin).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CoinId, Address)> + '_ {
        self.tokens.iter().map(|(c, a)| (*c, *a))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Fee per transaction for each coin, as declared by the operator with a
/// batch. Coins not listed are free.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePlan {
    rates: BTreeMap<CoinId, U256>,
}

impl FeePlan {
    /// Validates the `(feeCoins, feeRates)` directive of a `forgeBatch` call.
    pub fn from_directive(
        coins: &[CoinId],
        rates: &[U256],
        registry: &CoinRegistry,
    ) -> Result<Self, DecodeError> {
        if coins.len() != rates.len() {
            return Err(DecodeError::FeePlanLength {
                coins: coins.len(),
                rates: rates.len(),
            });
        }
        let mut plan = BTreeMap::new();
        for (&coin, &rate) in coins.iter().zip(rates) {
            if !registry.contains(coin) {
                return Err(DecodeError::UnknownCoin(coin));
            }
            if plan.insert(coin, rate).is_some() {
                return Err(DecodeError::DuplicateFeeCoin(coin));
            }
        }
        Ok(Self { rates: plan })
    }

    pub fn rate(&self, coin: CoinId) -> U256 {
        self.rates.get(&coin).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CoinId, U256)> + '_ {
        self.rates.iter().map(|(c, r)| (*c, *r))
    }
}

/// The fee plan in force and what it has collected.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRegistry {
    batch: BatchNumber,
    plan: FeePlan,
    collected: BTreeMap<CoinId, U256>,
    totals: BTreeMap<CoinId, U256>,
}

impl FeeRegistry {
    /// Puts `plan` in force for `batch`, replacing the previous batch's plan.
    pub fn install(&mut self, batch: BatchNumber, plan: FeePlan) {
        self.batch = batch;
        self.plan = plan;
        self.collected.clear();
    }

    pub fn rate(&self, coin: CoinId) -> U256 {
        self.plan.rate(coin)
    }

    pub fn plan(&self) -> &FeePlan {
        &self.plan
    }

    /// Batch the current plan belongs to.
    pub fn batch(&self) -> BatchNumber {
        self.batch
    }

    pub fn collect(&mut self, coin: CoinId, fee: U256) -> Result<(), InvalidTransaction> {
        if fee.is_zero() {
            return Ok(());
        }
        for map in [&mut self.collected, &mut self.totals] {
            let slot = map.entry(coin).or_default();
            *slot = slot
                .checked_add(fee)
                .ok_or(InvalidTransaction::Overflow)?;
        }
        Ok(())
    }

    /// Fees collected by the current batch.
    pub fn collected(&self) -> &BTreeMap<CoinId, U256> {
        &self.collected
    }

    /// Fees collected since genesis.
    pub fn totals(&self) -> &BTreeMap<CoinId, U256> {
        &self.totals
    }
}

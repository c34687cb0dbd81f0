use std::collections::BTreeMap;

use alloy::primitives::{Address, U256};
use rollup_common::OPERATOR_ACTIVATION_DELAY;
use serde::{Deserialize, Serialize};

/// An operator staked in the staking contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub id: u32,
    pub staker: Address,
    pub beneficiary: Address,
    pub stake: U256,
    /// Era the `CreateOperator` event was emitted in.
    pub registered_era: u64,
}

impl Operator {
    /// First era the operator may forge in.
    pub fn active_from(&self) -> u64 {
        self.registered_era + OPERATOR_ACTIVATION_DELAY
    }
}

/// Operators known from staking events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorRegistry {
    operators: BTreeMap<u32, Operator>,
}

impl OperatorRegistry {
    /// Registering an id twice keeps the first registration, so replaying a
    /// block range is harmless.
    pub fn register(&mut self, operator: Operator) {
        self.operators.entry(operator.id).or_insert(operator);
    }

    pub fn remove(&mut self, id: u32) -> Option<Operator> {
        self.operators.remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<&Operator> {
        self.operators.get(&id)
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Operators allowed to forge during `era`.
    pub fn active(&self, era: u64) -> Vec<&Operator> {
        self.operators
            .values()
            .filter(|op| op.active_from() <= era)
            .collect()
    }
}

//! Events and calldata emitted by the rollup and staking contracts.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::{SolCall, SolEvent};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::types::{BatchNumber, CoinId, PendingDeposit, PublicKey};

pub mod abi {
    alloy::sol! {
        #[derive(Debug, PartialEq, Eq)]
        event AddToken(address tokenAddress, uint16 tokenId);

        #[derive(Debug, PartialEq, Eq)]
        event OnChainTx(
            uint64 indexed batchNumber,
            uint16 coin,
            uint128 loadAmount,
            address ethAddress,
            uint256 ax,
            uint256 ay
        );

        #[derive(Debug, PartialEq, Eq)]
        event ForgeBatch(uint64 indexed batchNumber, uint256 stateRoot, uint256 exitRoot);

        #[derive(Debug, PartialEq, Eq)]
        event Withdraw(uint64 indexed batchNumber, uint64 idx);

        #[derive(Debug, PartialEq, Eq)]
        event CreateOperator(
            uint32 indexed operatorId,
            address staker,
            address beneficiary,
            uint256 stake
        );

        #[derive(Debug, PartialEq, Eq)]
        event RemoveOperator(uint32 indexed operatorId);

        #[derive(Debug, PartialEq, Eq)]
        function forgeBatch(
            bytes32 revealHash,
            bytes offChainTxs,
            bytes offChainDeposits,
            uint16[] feeCoins,
            uint256[] feeRates,
            bytes proof
        ) external;
    }
}

/// Total order of events on the base ledger.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LogPosition {
    pub block: u64,
    pub log_index: u64,
}

impl LogPosition {
    pub const fn new(block: u64, log_index: u64) -> Self {
        Self { block, log_index }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEvent {
    AddToken {
        coin: CoinId,
        token: Address,
    },
    Deposit(PendingDeposit),
    ForgeBatch {
        batch: BatchNumber,
        state_root: U256,
        exit_root: U256,
    },
    Withdraw {
        batch: BatchNumber,
        idx: u64,
    },
    CreateOperator {
        operator: u32,
        staker: Address,
        beneficiary: Address,
        stake: U256,
    },
    RemoveOperator {
        operator: u32,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PositionedEvent {
    pub position: LogPosition,
    /// Transaction that emitted the log. Batch calldata is read from it.
    pub tx_hash: B256,
    pub event: LedgerEvent,
}

fn abi_error(what: &'static str) -> impl FnOnce(alloy::sol_types::Error) -> DecodeError {
    move |e| DecodeError::Abi {
        what,
        reason: e.to_string(),
    }
}

/// Decodes a log of either contract. Logs with an unknown signature are
/// skipped.
pub fn decode_log(log: &Log) -> Result<Option<PositionedEvent>, DecodeError> {
    let Some(topic0) = log.inner.data.topics().first() else {
        return Ok(None);
    };
    let data = &log.inner.data;

    let event = match *topic0 {
        t if t == abi::AddToken::SIGNATURE_HASH => {
            let ev = abi::AddToken::decode_log_data(data, true).map_err(abi_error("AddToken"))?;
            LedgerEvent::AddToken {
                coin: ev.tokenId,
                token: ev.tokenAddress,
            }
        }
        t if t == abi::OnChainTx::SIGNATURE_HASH => {
            let ev =
                abi::OnChainTx::decode_log_data(data, true).map_err(abi_error("OnChainTx"))?;
            LedgerEvent::Deposit(PendingDeposit {
                batch: ev.batchNumber,
                coin: ev.coin,
                key: PublicKey::new(ev.ax, ev.ay),
                address: ev.ethAddress,
                amount: U256::from(ev.loadAmount),
            })
        }
        t if t == abi::ForgeBatch::SIGNATURE_HASH => {
            let ev =
                abi::ForgeBatch::decode_log_data(data, true).map_err(abi_error("ForgeBatch"))?;
            LedgerEvent::ForgeBatch {
                batch: ev.batchNumber,
                state_root: ev.stateRoot,
                exit_root: ev.exitRoot,
            }
        }
        t if t == abi::Withdraw::SIGNATURE_HASH => {
            let ev = abi::Withdraw::decode_log_data(data, true).map_err(abi_error("Withdraw"))?;
            LedgerEvent::Withdraw {
                batch: ev.batchNumber,
                idx: ev.idx,
            }
        }
        t if t == abi::CreateOperator::SIGNATURE_HASH => {
            let ev = abi::CreateOperator::decode_log_data(data, true)
                .map_err(abi_error("CreateOperator"))?;
            LedgerEvent::CreateOperator {
                operator: ev.operatorId,
                staker: ev.staker,
                beneficiary: ev.beneficiary,
                stake: ev.stake,
            }
        }
        t if t == abi::RemoveOperator::SIGNATURE_HASH => {
            let ev = abi::RemoveOperator::decode_log_data(data, true)
                .map_err(abi_error("RemoveOperator"))?;
            LedgerEvent::RemoveOperator {
                operator: ev.operatorId,
            }
        }
        _ => return Ok(None),
    };

    let block = log
        .block_number
        .ok_or(DecodeError::MissingLogPosition("block number"))?;
    let log_index = log
        .log_index
        .ok_or(DecodeError::MissingLogPosition("log index"))?;
    let tx_hash = log
        .transaction_hash
        .ok_or(DecodeError::MissingLogPosition("transaction hash"))?;

    Ok(Some(PositionedEvent {
        position: LogPosition::new(block, log_index),
        tx_hash,
        event,
    }))
}

/// The parts of a `forgeBatch` call the synchronizer replays.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForgeCalldata {
    pub off_chain_txs: Bytes,
    pub off_chain_deposits: Bytes,
    pub fee_coins: Vec<CoinId>,
    pub fee_rates: Vec<U256>,
}

impl ForgeCalldata {
    pub fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        let call = abi::forgeBatchCall::abi_decode(input, true).map_err(abi_error("forgeBatch"))?;
        Ok(Self {
            off_chain_txs: call.offChainTxs,
            off_chain_deposits: call.offChainDeposits,
            fee_coins: call.feeCoins,
            fee_rates: call.feeRates,
        })
    }

    /// ABI-encodes a `forgeBatch` call carrying this data, with an empty proof.
    pub fn encode(&self) -> Bytes {
        abi::forgeBatchCall {
            revealHash: B256::ZERO,
            offChainTxs: self.off_chain_txs.clone(),
            offChainDeposits: self.off_chain_deposits.clone(),
            feeCoins: self.fee_coins.clone(),
            feeRates: self.fee_rates.clone(),
            proof: Bytes::new(),
        }
        .abi_encode()
        .into()
    }
}

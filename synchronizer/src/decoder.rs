//! Turns the data published with a `forgeBatch` call into the ordered list of
//! transactions it applies.
//!
//! Off-chain data uses fixed-size big-endian records:
//!
//! | record          | layout                                                           |
//! |-----------------|------------------------------------------------------------------|
//! | transaction     | `fromIdx u32 · toIdx u32 · coin u16 · amount u128 · nonce u32`    |
//! | account deposit | `coin u16 · Ax u256 · Ay u256 · address [20]`                     |
//!
//! A transaction to index `0` is an exit.

use alloy::primitives::{Address, Bytes, U256};
use rollup_common::EXIT_IDX;

use crate::error::DecodeError;
use crate::events::ForgeCalldata;
use crate::fees::{CoinRegistry, FeePlan};
use crate::types::{Batch, BatchNumber, CoinId, PendingDeposit, PublicKey, Transaction};

pub const TX_RECORD_LEN: usize = 30;
pub const DEPOSIT_RECORD_LEN: usize = 86;

fn be<const N: usize>(bytes: &[u8]) -> [u8; N] {
    std::array::from_fn(|i| bytes[i])
}

/// A transaction record as published by the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OffChainTx {
    pub from: u32,
    pub to: u32,
    pub coin: CoinId,
    pub amount: u128,
    pub nonce: u32,
}

impl OffChainTx {
    pub fn encode(&self) -> [u8; TX_RECORD_LEN] {
        let mut out = [0u8; TX_RECORD_LEN];
        out[0..4].copy_from_slice(&self.from.to_be_bytes());
        out[4..8].copy_from_slice(&self.to.to_be_bytes());
        out[8..10].copy_from_slice(&self.coin.to_be_bytes());
        out[10..26].copy_from_slice(&self.amount.to_be_bytes());
        out[26..30].copy_from_slice(&self.nonce.to_be_bytes());
        out
    }

    fn parse(rec: &[u8]) -> Self {
        Self {
            from: u32::from_be_bytes(be(&rec[0..4])),
            to: u32::from_be_bytes(be(&rec[4..8])),
            coin: u16::from_be_bytes(be(&rec[8..10])),
            amount: u128::from_be_bytes(be(&rec[10..26])),
            nonce: u32::from_be_bytes(be(&rec[26..30])),
        }
    }
}

/// An account creation record as published by the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OffChainDeposit {
    pub coin: CoinId,
    pub key: PublicKey,
    pub address: Address,
}

impl OffChainDeposit {
    pub fn encode(&self) -> [u8; DEPOSIT_RECORD_LEN] {
        let mut out = [0u8; DEPOSIT_RECORD_LEN];
        out[0..2].copy_from_slice(&self.coin.to_be_bytes());
        out[2..34].copy_from_slice(&self.key.ax.to_be_bytes::<32>());
        out[34..66].copy_from_slice(&self.key.ay.to_be_bytes::<32>());
        out[66..86].copy_from_slice(self.address.as_slice());
        out
    }

    fn parse(rec: &[u8]) -> Self {
        Self {
            coin: u16::from_be_bytes(be(&rec[0..2])),
            key: PublicKey::new(
                U256::from_be_slice(&rec[2..34]),
                U256::from_be_slice(&rec[34..66]),
            ),
            address: Address::from_slice(&rec[66..86]),
        }
    }
}

/// Concatenates records into the byte string carried by the calldata.
pub fn encode_records<const N: usize>(records: impl IntoIterator<Item = [u8; N]>) -> Bytes {
    records.into_iter().flatten().collect::<Vec<u8>>().into()
}

fn records<'a>(
    data: &'a [u8],
    len: usize,
    what: &'static str,
) -> Result<std::slice::ChunksExact<'a, u8>, DecodeError> {
    if data.len() % len != 0 {
        return Err(DecodeError::TruncatedRecords {
            what,
            len: data.len(),
            record: len,
        });
    }
    Ok(data.chunks_exact(len))
}

/// Decodes the off-chain transaction records, pricing each with `plan`.
pub fn decode_offchain_txs(
    data: &[u8],
    plan: &FeePlan,
    coins: &CoinRegistry,
) -> Result<Vec<Transaction>, DecodeError> {
    records(data, TX_RECORD_LEN, "off-chain transaction data")?
        .enumerate()
        .map(|(i, rec)| {
            let tx = OffChainTx::parse(rec);
            if u64::from(tx.from) == EXIT_IDX {
                return Err(DecodeError::ZeroSender(i));
            }
            if tx.from == tx.to {
                return Err(DecodeError::SelfTransfer(i));
            }
            if tx.amount == 0 {
                return Err(DecodeError::ZeroAmount(i));
            }
            if !coins.contains(tx.coin) {
                return Err(DecodeError::UnknownCoin(tx.coin));
            }
            let amount = U256::from(tx.amount);
            let fee = plan.rate(tx.coin);
            Ok(if u64::from(tx.to) == EXIT_IDX {
                Transaction::Exit {
                    from: tx.from.into(),
                    coin: tx.coin,
                    amount,
                    fee,
                    nonce: tx.nonce.into(),
                }
            } else {
                Transaction::Transfer {
                    from: tx.from.into(),
                    to: tx.to.into(),
                    coin: tx.coin,
                    amount,
                    fee,
                    nonce: tx.nonce.into(),
                }
            })
        })
        .collect()
}

/// Decodes the off-chain account creation records.
pub fn decode_offchain_deposits(
    data: &[u8],
    coins: &CoinRegistry,
) -> Result<Vec<Transaction>, DecodeError> {
    records(data, DEPOSIT_RECORD_LEN, "off-chain deposit data")?
        .map(|rec| {
            let d = OffChainDeposit::parse(rec);
            if !coins.contains(d.coin) {
                return Err(DecodeError::UnknownCoin(d.coin));
            }
            Ok(Transaction::CreateAccount {
                coin: d.coin,
                key: d.key,
                address: d.address,
            })
        })
        .collect()
}

/// Where a `ForgeBatch` event sits and what it committed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForgeHeader {
    pub number: BatchNumber,
    pub block: u64,
    pub state_root: U256,
    pub exit_root: U256,
}

/// Assembles a batch in replay order: on-chain deposits in ledger order,
/// then off-chain account creations, then off-chain transactions.
///
/// `deposits` must already be sorted by ledger position. Every coin the
/// batch touches, on-chain deposits included, must be registered.
pub fn decode_batch(
    header: ForgeHeader,
    calldata: &[u8],
    deposits: Vec<PendingDeposit>,
    coins: &CoinRegistry,
) -> Result<Batch, DecodeError> {
    if let Some(d) = deposits.iter().find(|d| !coins.contains(d.coin)) {
        return Err(DecodeError::UnknownCoin(d.coin));
    }
    let call = ForgeCalldata::decode(calldata)?;
    let fee_plan = FeePlan::from_directive(&call.fee_coins, &call.fee_rates, coins)?;

    let mut transactions: Vec<Transaction> = deposits.into_iter().map(Into::into).collect();
    transactions.extend(decode_offchain_deposits(&call.off_chain_deposits, coins)?);
    transactions.extend(decode_offchain_txs(&call.off_chain_txs, &fee_plan, coins)?);

    Ok(Batch {
        number: header.number,
        block: header.block,
        fee_plan,
        transactions,
        state_root: header.state_root,
        exit_root: header.exit_root,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coins() -> CoinRegistry {
        let mut c = CoinRegistry::default();
        c.register(0, Address::repeat_byte(0x10));
        c.register(1, Address::repeat_byte(0x11));
        c
    }

    fn tx(from: u32, to: u32, amount: u128) -> OffChainTx {
        OffChainTx {
            from,
            to,
            coin: 0,
            amount,
            nonce: 3,
        }
    }

    #[test]
    fn record_layout() {
        let rec = OffChainTx {
            from: 1,
            to: 2,
            coin: 0x0102,
            amount: 3,
            nonce: 4,
        }
        .encode();
        assert_eq!(&rec[0..4], &[0, 0, 0, 1]);
        assert_eq!(&rec[4..8], &[0, 0, 0, 2]);
        assert_eq!(&rec[8..10], &[1, 2]);
        assert_eq!(rec[25], 3);
        assert_eq!(&rec[26..30], &[0, 0, 0, 4]);
    }

    #[test]
    fn transfers_and_exits() {
        let plan = FeePlan::from_directive(&[0], &[U256::from(1)], &coins()).unwrap();
        let data = encode_records([tx(1, 2, 5).encode(), tx(2, 0, 4).encode()]);
        let txs = decode_offchain_txs(&data, &plan, &coins()).unwrap();
        assert_eq!(
            txs,
            vec![
                Transaction::Transfer {
                    from: 1,
                    to: 2,
                    coin: 0,
                    amount: U256::from(5),
                    fee: U256::from(1),
                    nonce: 3,
                },
                Transaction::Exit {
                    from: 2,
                    coin: 0,
                    amount: U256::from(4),
                    fee: U256::from(1),
                    nonce: 3,
                },
            ]
        );
    }

    #[test]
    fn malformed_transactions() {
        let plan = FeePlan::default();
        let decode = |t: OffChainTx| decode_offchain_txs(&t.encode(), &plan, &coins());

        assert_eq!(decode(tx(0, 2, 5)), Err(DecodeError::ZeroSender(0)));
        assert_eq!(decode(tx(2, 2, 5)), Err(DecodeError::SelfTransfer(0)));
        assert_eq!(decode(tx(1, 2, 0)), Err(DecodeError::ZeroAmount(0)));
        let mut unknown = tx(1, 2, 5);
        unknown.coin = 7;
        assert_eq!(decode(unknown), Err(DecodeError::UnknownCoin(7)));

        let data = tx(1, 2, 5).encode();
        assert_eq!(
            decode_offchain_txs(&data[..29], &plan, &coins()),
            Err(DecodeError::TruncatedRecords {
                what: "off-chain transaction data",
                len: 29,
                record: TX_RECORD_LEN,
            })
        );
        assert_eq!(decode_offchain_txs(&[], &plan, &coins()), Ok(vec![]));
    }

    #[test]
    fn account_creations() {
        let dep = OffChainDeposit {
            coin: 1,
            key: PublicKey::new(U256::MAX, U256::from(9)),
            address: Address::repeat_byte(0x42),
        };
        let txs = decode_offchain_deposits(&dep.encode(), &coins()).unwrap();
        assert_eq!(
            txs,
            vec![Transaction::CreateAccount {
                coin: 1,
                key: dep.key,
                address: dep.address,
            }]
        );
        assert!(decode_offchain_deposits(&dep.encode()[1..], &coins()).is_err());
    }

    #[test]
    fn batch_order() {
        let deposit = PendingDeposit {
            batch: 1,
            coin: 0,
            key: PublicKey::new(U256::from(1), U256::from(2)),
            address: Address::repeat_byte(1),
            amount: U256::from(10),
        };
        let creation = OffChainDeposit {
            coin: 1,
            key: PublicKey::new(U256::from(3), U256::from(4)),
            address: Address::repeat_byte(2),
        };
        let calldata = ForgeCalldata {
            off_chain_txs: encode_records([tx(1, 2, 5).encode()]),
            off_chain_deposits: encode_records([creation.encode()]),
            fee_coins: vec![],
            fee_rates: vec![],
        }
        .encode();
        let header = ForgeHeader {
            number: 1,
            block: 20,
            state_root: U256::from(7),
            exit_root: U256::ZERO,
        };

        let batch = decode_batch(header, &calldata, vec![deposit.clone()], &coins()).unwrap();
        assert_eq!(batch.number, 1);
        assert_eq!(batch.transactions.len(), 3);
        assert_eq!(batch.transactions[0], Transaction::from(deposit));
        assert!(matches!(batch.transactions[1], Transaction::CreateAccount { coin: 1, .. }));
        assert!(matches!(batch.transactions[2], Transaction::Transfer { fee, .. } if fee.is_zero()));
    }

    #[test]
    fn deposit_of_unregistered_coin_rejects_the_batch() {
        let deposit = PendingDeposit {
            batch: 1,
            coin: 5,
            key: PublicKey::new(U256::from(1), U256::from(2)),
            address: Address::repeat_byte(1),
            amount: U256::from(10),
        };
        let calldata = ForgeCalldata::default().encode();
        let header = ForgeHeader {
            number: 1,
            block: 1,
            state_root: U256::ZERO,
            exit_root: U256::ZERO,
        };
        assert_eq!(
            decode_batch(header, &calldata, vec![deposit], &coins()),
            Err(DecodeError::UnknownCoin(5))
        );
    }

    #[test]
    fn bad_fee_directive_rejects_the_batch() {
        let calldata = ForgeCalldata {
            fee_coins: vec![0, 0],
            fee_rates: vec![U256::from(1), U256::from(2)],
            ..Default::default()
        }
        .encode();
        let header = ForgeHeader {
            number: 1,
            block: 1,
            state_root: U256::ZERO,
            exit_root: U256::ZERO,
        };
        assert_eq!(
            decode_batch(header, &calldata, vec![], &coins()),
            Err(DecodeError::DuplicateFeeCoin(0))
        );
    }
}

//! An in-memory base ledger and a batch forger driving it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, LogData, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use anyhow::bail;
use parking_lot::Mutex;
use rollup_common::EraClock;
use rollup_synchronizer::config::{SyncConfig, SyncMode};
use rollup_synchronizer::consolidate::{computed_roots, consolidate};
use rollup_synchronizer::decoder::{
    decode_batch, encode_records, ForgeHeader, OffChainDeposit, OffChainTx,
};
use rollup_synchronizer::events::{abi, ForgeCalldata};
use rollup_synchronizer::provider::LedgerProvider;
use rollup_synchronizer::snapshot::Snapshot;
use rollup_synchronizer::store::KvStore;
use rollup_synchronizer::sync::Synchronizer;
use rollup_synchronizer::types::{Batch, BatchNumber, CoinId, PendingDeposit, PublicKey};
use tokio::sync::Notify;

pub const ROLLUP: Address = Address::repeat_byte(0xaa);
pub const STAKING: Address = Address::repeat_byte(0xbb);

pub fn key(n: u64) -> PublicKey {
    PublicKey::new(U256::from(n), U256::from(1_000 + n))
}

pub fn address(n: u64) -> Address {
    Address::repeat_byte(n as u8)
}

#[derive(Default)]
struct Chain {
    head: u64,
    rollup: Vec<Log>,
    staking: Vec<Log>,
    calldata: HashMap<B256, Bytes>,
    next_log_index: u64,
    next_tx: u64,
    failures: usize,
}

impl Chain {
    fn tx_hash(&mut self) -> B256 {
        self.next_tx += 1;
        B256::left_padding_from(&self.next_tx.to_be_bytes())
    }

    fn log(&mut self, contract: Address, data: LogData, tx_hash: B256) -> Log {
        let log = Log {
            inner: alloy::primitives::Log {
                address: contract,
                data,
            },
            block_number: Some(self.head),
            log_index: Some(self.next_log_index),
            transaction_hash: Some(tx_hash),
            ..Default::default()
        };
        self.next_log_index += 1;
        log
    }

    fn fail(&mut self) -> anyhow::Result<()> {
        if self.failures > 0 {
            self.failures -= 1;
            bail!("ledger unavailable");
        }
        Ok(())
    }
}

/// Base ledger kept in memory. Every emitted log lands in the current head
/// block.
#[derive(Default)]
pub struct FakeLedger {
    chain: Mutex<Chain>,
    calldata_gate: Mutex<Option<Arc<Notify>>>,
    calldata_parked: Notify,
}

impl FakeLedger {
    pub fn head(&self) -> u64 {
        self.chain.lock().head
    }

    /// Moves the head `blocks` blocks forward.
    pub fn mine(&self, blocks: u64) -> u64 {
        let mut chain = self.chain.lock();
        chain.head += blocks;
        chain.next_log_index = 0;
        chain.head
    }

    /// Makes the next `n` requests fail.
    pub fn fail_next(&self, n: usize) {
        self.chain.lock().failures = n;
    }

    /// Makes the next calldata fetch wait until the returned handle is
    /// notified.
    pub fn hold_next_calldata(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.calldata_gate.lock() = Some(gate.clone());
        gate
    }

    /// Resolves once a held calldata fetch is waiting.
    pub async fn calldata_parked(&self) {
        self.calldata_parked.notified().await
    }

    pub fn emit_rollup<E: SolEvent>(&self, event: &E) -> B256 {
        let mut chain = self.chain.lock();
        let tx = chain.tx_hash();
        let log = chain.log(ROLLUP, event.encode_log_data(), tx);
        chain.rollup.push(log);
        tx
    }

    pub fn emit_staking<E: SolEvent>(&self, event: &E) {
        let mut chain = self.chain.lock();
        let tx = chain.tx_hash();
        let log = chain.log(STAKING, event.encode_log_data(), tx);
        chain.staking.push(log);
    }

    /// Emits `event` from a transaction carrying `calldata`.
    pub fn emit_call<E: SolEvent>(&self, event: &E, calldata: Bytes) {
        let mut chain = self.chain.lock();
        let tx = chain.tx_hash();
        let log = chain.log(ROLLUP, event.encode_log_data(), tx);
        chain.rollup.push(log);
        chain.calldata.insert(tx, calldata);
    }
}

fn in_range(logs: &[Log], from: u64, to: u64) -> Vec<Log> {
    logs.iter()
        .filter(|l| l.block_number.is_some_and(|b| (from..=to).contains(&b)))
        .cloned()
        .collect()
}

impl LedgerProvider for FakeLedger {
    async fn latest_block_number(&self) -> anyhow::Result<u64> {
        let mut chain = self.chain.lock();
        chain.fail()?;
        Ok(chain.head)
    }

    async fn rollup_logs(&self, from: u64, to: u64) -> anyhow::Result<Vec<Log>> {
        let mut chain = self.chain.lock();
        chain.fail()?;
        Ok(in_range(&chain.rollup, from, to))
    }

    async fn staking_logs(&self, from: u64, to: u64) -> anyhow::Result<Vec<Log>> {
        let mut chain = self.chain.lock();
        chain.fail()?;
        Ok(in_range(&chain.staking, from, to))
    }

    async fn transaction_input(&self, tx_hash: B256) -> anyhow::Result<Bytes> {
        let input = {
            let mut chain = self.chain.lock();
            chain.fail()?;
            match chain.calldata.get(&tx_hash) {
                Some(input) => input.clone(),
                None => bail!("unknown transaction {tx_hash}"),
            }
        };
        let gate = self.calldata_gate.lock().take();
        if let Some(gate) = gate {
            self.calldata_parked.notify_one();
            gate.notified().await;
        }
        Ok(input)
    }
}

/// Contents of one forged batch.
#[derive(Clone, Debug, Default)]
pub struct BatchPlan {
    pub creates: Vec<OffChainDeposit>,
    pub txs: Vec<OffChainTx>,
    pub fees: Vec<(CoinId, u64)>,
}

impl BatchPlan {
    pub fn tx(mut self, from: u32, to: u32, amount: u128, nonce: u32) -> Self {
        self.txs.push(OffChainTx {
            from,
            to,
            coin: 0,
            amount,
            nonce,
        });
        self
    }

    pub fn create(mut self, n: u64) -> Self {
        self.creates.push(OffChainDeposit {
            coin: 0,
            key: key(n),
            address: address(n),
        });
        self
    }

    pub fn fee(mut self, coin: CoinId, rate: u64) -> Self {
        self.fees.push((coin, rate));
        self
    }

    fn calldata(&self) -> Bytes {
        let (fee_coins, fee_rates): (Vec<CoinId>, Vec<U256>) = self
            .fees
            .iter()
            .map(|(c, r)| (*c, U256::from(*r)))
            .unzip();
        ForgeCalldata {
            off_chain_txs: encode_records(self.txs.iter().map(OffChainTx::encode)),
            off_chain_deposits: encode_records(self.creates.iter().map(OffChainDeposit::encode)),
            fee_coins,
            fee_rates,
        }
        .encode()
    }
}

/// Forges batches with correct roots, computed on its own replay of the
/// rollup.
pub struct Forger {
    pub ledger: Arc<FakeLedger>,
    pub model: Snapshot,
    queued: Vec<PendingDeposit>,
}

impl Forger {
    pub fn new() -> Self {
        let ledger = Arc::new(FakeLedger::default());
        ledger.mine(1);
        Self {
            ledger,
            model: Snapshot::default(),
            queued: Vec::new(),
        }
    }

    pub fn next_batch(&self) -> BatchNumber {
        self.model.last_batch + 1
    }

    pub fn add_token(&mut self, coin: CoinId) {
        let token = Address::repeat_byte(0xc0 + coin as u8);
        Arc::make_mut(&mut self.model.coins).register(coin, token);
        self.ledger.emit_rollup(&abi::AddToken {
            tokenAddress: token,
            tokenId: coin,
        });
    }

    /// Queues an on-chain deposit of `amount` for `key(n)`, consumed by the
    /// next forged batch.
    pub fn deposit(&mut self, n: u64, amount: u128) {
        self.deposit_for(self.next_batch(), n, amount);
    }

    pub fn deposit_for(&mut self, batch: BatchNumber, n: u64, amount: u128) {
        let k = key(n);
        self.ledger.emit_rollup(&abi::OnChainTx {
            batchNumber: batch,
            coin: 0,
            loadAmount: amount,
            ethAddress: address(n),
            ax: k.ax,
            ay: k.ay,
        });
        self.queued.push(PendingDeposit {
            batch,
            coin: 0,
            key: k,
            address: address(n),
            amount: U256::from(amount),
        });
    }

    /// Roots the batch described by `plan` would commit to.
    pub fn roots(&self, plan: &BatchPlan) -> (U256, U256) {
        let batch = self.decode(plan, U256::ZERO, U256::ZERO);
        computed_roots(&self.model, &batch).unwrap()
    }

    fn decode(&self, plan: &BatchPlan, state_root: U256, exit_root: U256) -> Batch {
        let number = self.next_batch();
        let deposits = self
            .queued
            .iter()
            .filter(|d| d.batch == number)
            .cloned()
            .collect();
        decode_batch(
            ForgeHeader {
                number,
                block: self.ledger.head(),
                state_root,
                exit_root,
            },
            &plan.calldata(),
            deposits,
            &self.model.coins,
        )
        .unwrap()
    }

    /// Forges the next batch with correct roots.
    pub fn forge(&mut self, plan: BatchPlan) -> BatchNumber {
        let (state_root, exit_root) = self.roots(&plan);
        let batch = self.decode(&plan, state_root, exit_root);
        let number = batch.number;
        self.model = consolidate(&self.model, batch).unwrap().snapshot;
        self.queued.retain(|d| d.batch != number);
        self.emit_forge(number, &plan, state_root, exit_root);
        number
    }

    /// Forges the next batch declaring `state_root`, without applying it to
    /// the model.
    pub fn forge_with_root(&mut self, plan: BatchPlan, state_root: U256) {
        let (_, exit_root) = self.roots(&plan);
        self.emit_forge(self.next_batch(), &plan, state_root, exit_root);
    }

    /// Forges the next batch with calldata that is not a `forgeBatch` call.
    pub fn forge_garbage(&mut self) {
        self.ledger.emit_call(
            &abi::ForgeBatch {
                batchNumber: self.next_batch(),
                stateRoot: U256::ZERO,
                exitRoot: U256::ZERO,
            },
            Bytes::from_static(b"not a forge call"),
        );
    }

    fn emit_forge(&self, number: BatchNumber, plan: &BatchPlan, state_root: U256, exit_root: U256) {
        self.ledger.emit_call(
            &abi::ForgeBatch {
                batchNumber: number,
                stateRoot: state_root,
                exitRoot: exit_root,
            },
            plan.calldata(),
        );
    }

    pub fn withdraw(&self, batch: BatchNumber, idx: u64) {
        self.ledger.emit_rollup(&abi::Withdraw {
            batchNumber: batch,
            idx,
        });
    }

    pub fn create_operator(&self, id: u32) {
        self.ledger.emit_staking(&abi::CreateOperator {
            operatorId: id,
            staker: Address::repeat_byte(0x51),
            beneficiary: Address::repeat_byte(0x52),
            stake: U256::from(1_000),
        });
    }

    pub fn remove_operator(&self, id: u32) {
        self.ledger
            .emit_staking(&abi::RemoveOperator { operatorId: id });
    }
}

pub fn config(mode: SyncMode) -> SyncConfig {
    SyncConfig {
        mode,
        creation_block: 1,
        poll_interval: Duration::from_millis(5),
        error_backoff: Duration::from_millis(5),
        fetch_timeout: Duration::from_secs(5),
        max_block_range: 4,
        clock: EraClock::new(1, 5, 2),
    }
}

/// Steps until the synchronizer reaches the chain head.
pub async fn catch_up<S: KvStore>(sync: &mut Synchronizer<Arc<FakeLedger>, S>) {
    loop {
        let outcome = sync.step().await.unwrap();
        if !outcome.behind {
            break;
        }
    }
}

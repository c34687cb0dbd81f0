use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use alloy::primitives::{Address, Bytes, B256};
use alloy::rpc::types::{Filter, Log};
use alloy::{providers::Provider, transports::Transport};
use anyhow::Context;
use mockall::automock;
use tokio::sync::{Mutex, Semaphore};
use tracing::trace;

const CALLDATA_CACHE_SIZE: usize = 256;
const MAX_NUMBER_OF_PARALLEL_REQUESTS: usize = 64;

/// Read access to the base ledger, limited to what the synchronizer needs.
#[automock]
pub trait LedgerProvider {
    fn latest_block_number(&self) -> impl Future<Output = anyhow::Result<u64>> + Send;

    /// Logs emitted by the rollup contract in blocks `from..=to`.
    fn rollup_logs(
        &self,
        from: u64,
        to: u64,
    ) -> impl Future<Output = anyhow::Result<Vec<Log>>> + Send;

    /// Logs emitted by the staking contract in blocks `from..=to`.
    fn staking_logs(
        &self,
        from: u64,
        to: u64,
    ) -> impl Future<Output = anyhow::Result<Vec<Log>>> + Send;

    /// Calldata of the transaction `tx_hash`.
    fn transaction_input(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = anyhow::Result<Bytes>> + Send;
}

impl<T: LedgerProvider + Send + Sync> LedgerProvider for Arc<T> {
    fn latest_block_number(&self) -> impl Future<Output = anyhow::Result<u64>> + Send {
        (**self).latest_block_number()
    }

    fn rollup_logs(
        &self,
        from: u64,
        to: u64,
    ) -> impl Future<Output = anyhow::Result<Vec<Log>>> + Send {
        (**self).rollup_logs(from, to)
    }

    fn staking_logs(
        &self,
        from: u64,
        to: u64,
    ) -> impl Future<Output = anyhow::Result<Vec<Log>>> + Send {
        (**self).staking_logs(from, to)
    }

    fn transaction_input(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = anyhow::Result<Bytes>> + Send {
        (**self).transaction_input(tx_hash)
    }
}

/// Addresses of the contracts the synchronizer follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContractAddresses {
    pub rollup: Address,
    pub staking: Address,
}

/// [`LedgerProvider`] over an alloy provider, caching transaction calldata.
pub struct RpcLedgerProvider<ProviderT, TransportT> {
    provider: Arc<ProviderT>,
    contracts: ContractAddresses,
    // The HTTP client behind alloy has an unbounded connection pool, so the
    // number of requests in flight is bounded here.
    semaphore: Arc<Semaphore>,
    calldata: Arc<Mutex<lru::LruCache<B256, Bytes>>>,
    _phantom: std::marker::PhantomData<TransportT>,
}

impl<ProviderT, TransportT> RpcLedgerProvider<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    pub fn new(provider: ProviderT, contracts: ContractAddresses) -> Self {
        Self {
            provider: provider.into(),
            contracts,
            semaphore: Arc::new(Semaphore::new(MAX_NUMBER_OF_PARALLEL_REQUESTS)),
            calldata: Arc::new(Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(CALLDATA_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            ))),
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn contracts(&self) -> ContractAddresses {
        self.contracts
    }

    async fn logs(&self, address: Address, from: u64, to: u64) -> anyhow::Result<Vec<Log>> {
        let _permit = self.semaphore.acquire().await?;
        let filter = Filter::new().address(address).from_block(from).to_block(to);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .with_context(|| format!("fetching logs of {address} in blocks {from}..={to}"))?;
        trace!(%address, from, to, count = logs.len(), "fetched logs");
        Ok(logs)
    }
}

impl<ProviderT, TransportT> LedgerProvider for RpcLedgerProvider<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    async fn latest_block_number(&self) -> anyhow::Result<u64> {
        let _permit = self.semaphore.acquire().await?;
        Ok(self.provider.get_block_number().await?)
    }

    async fn rollup_logs(&self, from: u64, to: u64) -> anyhow::Result<Vec<Log>> {
        self.logs(self.contracts.rollup, from, to).await
    }

    async fn staking_logs(&self, from: u64, to: u64) -> anyhow::Result<Vec<Log>> {
        self.logs(self.contracts.staking, from, to).await
    }

    async fn transaction_input(&self, tx_hash: B256) -> anyhow::Result<Bytes> {
        if let Some(input) = self.calldata.lock().await.get(&tx_hash).cloned() {
            return Ok(input);
        }

        let tx = {
            let _permit = self.semaphore.acquire().await?;
            self.provider
                .get_transaction_by_hash(tx_hash)
                .await?
                .with_context(|| format!("transaction {tx_hash} does not exist"))?
        };
        self.calldata.lock().await.put(tx_hash, tx.input.clone());
        Ok(tx.input)
    }
}

//! Where the replay stands on the base ledger, and the deposits waiting for
//! the batch that will consume them.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use alloy::primitives::{Bytes, B256};
use alloy::rpc::types::Log;
use anyhow::anyhow;
use futures::future::{try_join, try_join_all};
use tracing::{debug, trace};

use crate::error::SyncError;
use crate::events::{decode_log, LedgerEvent, LogPosition, PositionedEvent};
use crate::provider::LedgerProvider;
use crate::types::{BatchNumber, PendingDeposit};

/// Events of one block range, in ledger order, with the calldata of the
/// batches they forge.
#[derive(Debug, Default)]
pub struct Fetched {
    pub head: u64,
    pub from: u64,
    pub to: u64,
    pub events: Vec<PositionedEvent>,
    pub calldata: HashMap<B256, Bytes>,
}

#[derive(Debug)]
pub enum PollOutcome {
    /// Every block up to `head` is replayed already.
    UpToDate { head: u64 },
    Fetched(Fetched),
}

async fn timed<T>(
    what: impl FnOnce() -> String,
    limit: Duration,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, SyncError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(SyncError::Transient(e.context(what()))),
        Err(_) => Err(SyncError::Transient(anyhow!(
            "{} timed out after {limit:?}",
            what()
        ))),
    }
}

fn decode_logs(logs: Vec<Log>) -> Result<Vec<PositionedEvent>, SyncError> {
    let mut events = Vec::with_capacity(logs.len());
    for log in &logs {
        match decode_log(log) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => trace!(block = ?log.block_number, "skipping unknown log"),
            Err(source) => {
                let position = log
                    .block_number
                    .zip(log.log_index)
                    .map(|(block, index)| LogPosition::new(block, index));
                return Err(SyncError::Log { position, source });
            }
        }
    }
    events.sort_by_key(|e| e.position);
    Ok(events)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncCursor {
    next_block: u64,
    deposits: BTreeMap<LogPosition, PendingDeposit>,
}

impl SyncCursor {
    pub fn new(next_block: u64) -> Self {
        Self {
            next_block,
            deposits: BTreeMap::new(),
        }
    }

    pub fn restore(
        next_block: u64,
        deposits: impl IntoIterator<Item = (LogPosition, PendingDeposit)>,
    ) -> Self {
        Self {
            next_block,
            deposits: deposits.into_iter().collect(),
        }
    }

    /// First block not replayed yet.
    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    /// The blocks the next poll covers, given the chain head.
    pub fn range(&self, head: u64, max_range: u64) -> Option<(u64, u64)> {
        if self.next_block > head {
            return None;
        }
        let to = self
            .next_block
            .saturating_add(max_range.max(1) - 1)
            .min(head);
        Some((self.next_block, to))
    }

    /// Fetches the next block range. Calldata is fetched only for batches
    /// after `last_batch`. Every request is bounded by `timeout`; nothing is
    /// changed in the cursor.
    pub async fn poll<P: LedgerProvider>(
        &self,
        provider: &P,
        last_batch: BatchNumber,
        max_range: u64,
        timeout: Duration,
    ) -> Result<PollOutcome, SyncError> {
        let head = timed(
            || "fetching chain head".to_string(),
            timeout,
            provider.latest_block_number(),
        )
        .await?;
        let Some((from, to)) = self.range(head, max_range) else {
            return Ok(PollOutcome::UpToDate { head });
        };

        let (rollup, staking) = try_join(
            timed(
                || format!("fetching rollup logs {from}..={to}"),
                timeout,
                provider.rollup_logs(from, to),
            ),
            timed(
                || format!("fetching staking logs {from}..={to}"),
                timeout,
                provider.staking_logs(from, to),
            ),
        )
        .await?;
        let events = decode_logs(rollup.into_iter().chain(staking).collect())?;

        let forges = events.iter().filter_map(|e| match e.event {
            LedgerEvent::ForgeBatch { batch, .. } if batch > last_batch => Some(e.tx_hash),
            _ => None,
        });
        let calldata = try_join_all(forges.map(|tx_hash| async move {
            let input = timed(
                || format!("fetching calldata of {tx_hash}"),
                timeout,
                provider.transaction_input(tx_hash),
            )
            .await?;
            Ok::<_, SyncError>((tx_hash, input))
        }))
        .await?
        .into_iter()
        .collect();

        debug!(from, to, head, events = events.len(), "fetched block range");
        Ok(PollOutcome::Fetched(Fetched {
            head,
            from,
            to,
            events,
            calldata,
        }))
    }

    /// Records a deposit seen at `position`. Returns `false` if it was known.
    pub fn add_deposit(&mut self, position: LogPosition, deposit: PendingDeposit) -> bool {
        if self.deposits.contains_key(&position) {
            return false;
        }
        self.deposits.insert(position, deposit);
        true
    }

    /// Deposits addressed to `batch`, in ledger order.
    pub fn deposits_for(&self, batch: BatchNumber) -> Vec<PendingDeposit> {
        self.deposits
            .values()
            .filter(|d| d.batch == batch)
            .cloned()
            .collect()
    }

    /// Forgets the deposits of `batch` and of every batch before it.
    pub fn drop_deposits(&mut self, batch: BatchNumber) {
        self.deposits.retain(|_, d| d.batch > batch);
    }

    pub fn pending_deposits(&self) -> impl Iterator<Item = (&LogPosition, &PendingDeposit)> {
        self.deposits.iter()
    }

    pub fn advance(&mut self, to: u64) {
        self.next_block = self.next_block.max(to.saturating_add(1));
    }
}

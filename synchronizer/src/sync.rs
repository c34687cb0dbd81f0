//! The synchronization loop: the only writer of the replayed state.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Bytes, B256};
use anyhow::anyhow;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::config::{SyncConfig, SyncMode};
use crate::consolidate::{consolidate, Consolidated};
use crate::cursor::{PollOutcome, SyncCursor};
use crate::decoder::{decode_batch, ForgeHeader};
use crate::error::SyncError;
use crate::events::{LedgerEvent, PositionedEvent};
use crate::exit_tree::WithdrawOutcome;
use crate::operators::Operator;
use crate::persist::{Checkpoint, Delta, StateStore};
use crate::provider::LedgerProvider;
use crate::query::StateQuery;
use crate::snapshot::{Published, Snapshot};
use crate::store::KvStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Polling again right away: the last poll consolidated a batch or the
    /// chain head is further than one block range away.
    #[default]
    CatchingUp,
    /// Caught up, sleeping for the poll interval.
    Idle,
    /// Sleeping after a failed poll.
    ErrorBackoff,
}

/// Progress of the loop, published after every poll.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub state: LoopState,
    pub last_synced_block: Option<u64>,
    pub chain_head: Option<u64>,
    pub last_batch: u64,
    pub era: u64,
    pub slot: u64,
    /// Set once the loop stopped on a fatal error.
    pub halted: bool,
    pub error: Option<String>,
}

/// What one [`Synchronizer::step`] achieved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepOutcome {
    /// Batches consolidated.
    pub batches: usize,
    pub head: u64,
    /// Whether blocks up to `head` are still left to replay.
    pub behind: bool,
}

pub struct Synchronizer<P, S> {
    provider: P,
    store: StateStore<S>,
    config: SyncConfig,
    cursor: SyncCursor,
    /// Writer copy of the state. Its parts are shared with the published
    /// snapshot and copied on first write.
    snapshot: Snapshot,
    last_block: Option<u64>,
    /// Changes not committed yet.
    delta: Delta,
    published: Published,
    status: watch::Sender<SyncStatus>,
}

impl<P, S> Synchronizer<P, S>
where
    P: LedgerProvider,
    S: KvStore,
{
    /// Resumes from the checkpoint in `kv`, or starts at the creation block
    /// when there is none.
    pub fn open(provider: P, kv: S, config: SyncConfig) -> Result<Self, SyncError> {
        let store = StateStore::new(kv);
        let (snapshot, cursor, last_block) = match store.load()? {
            Some((snapshot, checkpoint)) => {
                if checkpoint.mode != config.mode {
                    warn!(
                        stored = %checkpoint.mode,
                        configured = %config.mode,
                        "sync mode changed since the last run"
                    );
                }
                info!(
                    next_block = checkpoint.next_block,
                    last_batch = checkpoint.last_batch,
                    accounts = snapshot.state.len(),
                    "resuming from checkpoint"
                );
                (
                    snapshot,
                    SyncCursor::restore(checkpoint.next_block, checkpoint.pending_deposits),
                    checkpoint.last_block,
                )
            }
            None => {
                info!(
                    creation_block = config.creation_block,
                    mode = %config.mode,
                    "no checkpoint, starting from the creation block"
                );
                (
                    Snapshot::default(),
                    SyncCursor::new(config.creation_block),
                    None,
                )
            }
        };

        let status = SyncStatus {
            last_synced_block: last_block,
            last_batch: snapshot.last_batch,
            era: last_block.map_or(0, |b| config.clock.era_of(b)),
            slot: last_block.map_or(0, |b| config.clock.slot_of(b)),
            ..Default::default()
        };
        let (status, _) = watch::channel(status);

        Ok(Self {
            provider,
            store,
            config,
            cursor,
            published: Published::new(snapshot.clone()),
            snapshot,
            last_block,
            delta: Delta::default(),
            status,
        })
    }

    pub fn query(&self) -> StateQuery {
        StateQuery::new(self.published.clone(), self.config.clock)
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    pub fn store(&self) -> &StateStore<S> {
        &self.store
    }

    fn checkpoint(&self, cursor: &SyncCursor, snapshot: &Snapshot) -> Checkpoint {
        Checkpoint {
            next_block: cursor.next_block(),
            last_block: self.last_block,
            last_batch: snapshot.last_batch,
            mode: self.config.mode,
            state_root: snapshot.state.root_u256(),
            next_idx: snapshot.state.next_idx(),
            pending_deposits: cursor
                .pending_deposits()
                .map(|(p, d)| (*p, d.clone()))
                .collect(),
        }
    }

    /// Polls one block range and replays it. Batches are committed and
    /// published one by one; the cursor moves past the range only once every
    /// event in it is applied.
    pub async fn step(&mut self) -> Result<StepOutcome, SyncError> {
        let fetched = match self
            .cursor
            .poll(
                &self.provider,
                self.snapshot.last_batch,
                self.config.max_block_range,
                self.config.fetch_timeout,
            )
            .await?
        {
            PollOutcome::UpToDate { head } => {
                self.status.send_modify(|s| s.chain_head = Some(head));
                return Ok(StepOutcome {
                    batches: 0,
                    head,
                    behind: false,
                });
            }
            PollOutcome::Fetched(fetched) => fetched,
        };

        let mut batches = 0;
        for event in &fetched.events {
            if self.apply(event, &fetched.calldata).await? {
                batches += 1;
            }
        }

        let mut cursor = self.cursor.clone();
        cursor.advance(fetched.to);
        self.last_block = Some(fetched.to);
        self.snapshot.last_block = fetched.to;
        let checkpoint = self.checkpoint(&cursor, &self.snapshot);
        self.store.commit(
            &checkpoint,
            &self.snapshot,
            std::mem::take(&mut self.delta),
        )?;
        self.cursor = cursor;
        self.published.publish(self.snapshot.clone());

        let clock = self.config.clock;
        self.status.send_modify(|s| {
            s.last_synced_block = Some(fetched.to);
            s.chain_head = Some(fetched.head);
            s.last_batch = self.snapshot.last_batch;
            s.era = clock.era_of(fetched.to);
            s.slot = clock.slot_of(fetched.to);
        });
        debug!(
            from = fetched.from,
            to = fetched.to,
            head = fetched.head,
            batches,
            "replayed block range"
        );

        Ok(StepOutcome {
            batches,
            head: fetched.head,
            behind: fetched.to < fetched.head,
        })
    }

    /// Applies one ledger event. Returns whether a batch was consolidated.
    /// Replaying an already applied event changes nothing.
    async fn apply(
        &mut self,
        event: &PositionedEvent,
        calldata: &HashMap<B256, Bytes>,
    ) -> Result<bool, SyncError> {
        let position = event.position;
        match &event.event {
            LedgerEvent::AddToken { coin, token } => {
                if self.snapshot.coins.token(*coin) != Some(*token) {
                    Arc::make_mut(&mut self.snapshot.coins).register(*coin, *token);
                    info!(coin, %token, "registered coin");
                }
            }
            LedgerEvent::Deposit(deposit) if deposit.batch <= self.snapshot.last_batch => {
                // A re-polled deposit sits at or before the forge of its batch.
                let forged_at = self.snapshot.batches.get(&deposit.batch).map(|s| s.block);
                if forged_at.is_some_and(|block| position.block <= block) {
                    trace!(batch = deposit.batch, ?position, "deposit already consolidated");
                } else {
                    warn!(
                        batch = deposit.batch,
                        ?position,
                        coin = deposit.coin,
                        amount = %deposit.amount,
                        "dropping on-chain deposit for an already consolidated batch"
                    );
                }
            }
            LedgerEvent::Deposit(deposit) => {
                if self.cursor.add_deposit(position, deposit.clone()) {
                    debug!(
                        batch = deposit.batch,
                        block = position.block,
                        coin = deposit.coin,
                        "queued on-chain deposit"
                    );
                }
            }
            LedgerEvent::ForgeBatch {
                batch,
                state_root,
                exit_root,
            } => {
                if *batch <= self.snapshot.last_batch {
                    debug!(batch, "batch already consolidated");
                    return Ok(false);
                }
                let input = calldata.get(&event.tx_hash).ok_or_else(|| {
                    SyncError::Transient(anyhow!(
                        "calldata of transaction {} was not fetched",
                        event.tx_hash
                    ))
                })?;
                let header = ForgeHeader {
                    number: *batch,
                    block: position.block,
                    state_root: *state_root,
                    exit_root: *exit_root,
                };
                self.forge(header, input).await?;
                return Ok(true);
            }
            LedgerEvent::Withdraw { batch, idx } => {
                let prune = self.config.mode == SyncMode::Pruning;
                let exits = Arc::make_mut(&mut self.snapshot.exits);
                match exits.mark_withdrawn(*batch, *idx, prune) {
                    WithdrawOutcome::Withdrawn { pruned } => {
                        self.delta.exits.insert(*batch);
                        debug!(batch, idx, pruned, "exit leaf withdrawn");
                    }
                    WithdrawOutcome::AlreadyWithdrawn => {}
                    WithdrawOutcome::Unknown if prune => {}
                    WithdrawOutcome::Unknown => {
                        warn!(batch, idx, "withdrawal of an unknown exit leaf")
                    }
                }
            }
            LedgerEvent::CreateOperator {
                operator,
                staker,
                beneficiary,
                stake,
            } => {
                let registered_era = self.config.clock.era_of(position.block);
                Arc::make_mut(&mut self.snapshot.operators).register(Operator {
                    id: *operator,
                    staker: *staker,
                    beneficiary: *beneficiary,
                    stake: *stake,
                    registered_era,
                });
                debug!(operator, registered_era, "operator registered");
            }
            LedgerEvent::RemoveOperator { operator } => {
                if Arc::make_mut(&mut self.snapshot.operators)
                    .remove(*operator)
                    .is_some()
                {
                    debug!(operator, "operator removed");
                }
            }
        }
        Ok(false)
    }

    /// Decodes, consolidates, commits and publishes one batch.
    async fn forge(&mut self, header: ForgeHeader, input: &[u8]) -> Result<(), SyncError> {
        let number = header.number;
        let deposits = self.cursor.deposits_for(number);
        let batch = decode_batch(header, input, deposits, &self.snapshot.coins).map_err(|source| {
            error!(batch = number, error = %source, "batch cannot be decoded");
            SyncError::Decode {
                batch: number,
                source,
            }
        })?;

        let base = self.snapshot.clone();
        let Consolidated {
            mut snapshot,
            summary,
            changes,
            exit_tree,
        } = tokio::task::spawn_blocking(move || consolidate(&base, batch))
            .await
            .map_err(|e| {
                SyncError::Transient(anyhow!("consolidation of batch {number} aborted: {e}"))
            })??;

        snapshot.last_block = self.snapshot.last_block;
        self.delta.absorb(changes);
        self.delta.batches.insert(number);
        if exit_tree.is_some() {
            self.delta.exits.insert(number);
        }

        let mut cursor = self.cursor.clone();
        cursor.drop_deposits(number);
        let checkpoint = self.checkpoint(&cursor, &snapshot);
        self.store
            .commit(&checkpoint, &snapshot, std::mem::take(&mut self.delta))?;

        self.cursor = cursor;
        self.snapshot = snapshot;
        self.published.publish(self.snapshot.clone());
        self.status.send_modify(|s| s.last_batch = number);
        debug!(batch = number, fees = ?summary.fees, "batch committed");
        Ok(())
    }

    fn set_state(&self, state: LoopState) {
        self.status.send_if_modified(|s| {
            let changed = s.state != state;
            s.state = state;
            changed
        });
    }

    /// Runs until `stop` turns `true` or a fatal error occurs. A step in
    /// progress is always completed; only the sleeps between steps are cut
    /// short by a stop request.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> Result<(), SyncError> {
        let mut state = LoopState::CatchingUp;
        loop {
            if *stop.borrow() {
                info!(last_batch = self.snapshot.last_batch, "synchronizer stopped");
                return Ok(());
            }
            self.set_state(state);

            let pause = match self.step().await {
                Ok(outcome) if outcome.batches > 0 || outcome.behind => {
                    state = LoopState::CatchingUp;
                    None
                }
                Ok(_) => {
                    state = LoopState::Idle;
                    Some(self.config.poll_interval)
                }
                Err(e) if e.is_fatal() => {
                    error!(
                        error = %e,
                        last_batch = self.snapshot.last_batch,
                        "synchronizer halted, serving the last consolidated state"
                    );
                    self.status.send_modify(|s| {
                        s.halted = true;
                        s.error = Some(e.to_string());
                    });
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?self.config.error_backoff, "sync step failed");
                    state = LoopState::ErrorBackoff;
                    Some(self.config.error_backoff)
                }
            };
            self.set_state(state);

            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    changed = stop.changed() => {
                        if changed.is_err() {
                            info!("stop handle dropped, synchronizer stopped");
                            return Ok(());
                        }
                    }
                }
                if state == LoopState::ErrorBackoff {
                    state = LoopState::CatchingUp;
                }
            }
        }
    }
}

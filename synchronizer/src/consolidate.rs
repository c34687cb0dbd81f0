//! Replays one decoded batch on top of a snapshot.
//!
//! Work happens on private copies of the touched parts of the snapshot, so a
//! failure at any transaction leaves the input snapshot untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy::primitives::U256;
use tracing::{debug, info};

use crate::error::{ConsolidationError, InvalidTransaction, StateError};
use crate::exit_tree::{ExitRecord, ExitTreeBuilder};
use crate::fees::FeeRegistry;
use crate::snapshot::Snapshot;
use crate::state::{StateChanges, StateTree};
use crate::types::{AccountIdx, Batch, BatchSummary, CoinId, Identity, Transaction};

/// The outcome of a successful replay, ready to be persisted and published.
#[derive(Debug)]
pub struct Consolidated {
    pub snapshot: Snapshot,
    pub summary: BatchSummary,
    pub changes: StateChanges,
    /// The batch's exit tree, if any account exited.
    pub exit_tree: Option<ExitRecord>,
}

enum Failure {
    State(StateError),
    Invalid(InvalidTransaction),
}

impl From<StateError> for Failure {
    fn from(e: StateError) -> Self {
        Failure::State(e)
    }
}

impl From<InvalidTransaction> for Failure {
    fn from(e: InvalidTransaction) -> Self {
        Failure::Invalid(e)
    }
}

fn credit(map: &mut BTreeMap<CoinId, U256>, coin: CoinId, amount: U256) {
    let slot = map.entry(coin).or_default();
    *slot = slot.saturating_add(amount);
}

struct Replay<'a> {
    state: &'a mut StateTree,
    fees: &'a mut FeeRegistry,
    exits: &'a mut ExitTreeBuilder,
    summary: &'a mut BatchSummary,
}

impl Replay<'_> {
    fn apply(&mut self, tx: &Transaction) -> Result<(), Failure> {
        match *tx {
            Transaction::Deposit {
                coin,
                key,
                address,
                amount,
            } => {
                let identity = Identity::new(coin, key);
                match self.state.find(&identity).map(|a| a.idx) {
                    Some(idx) => self.state.update(idx, |acc| {
                        acc.balance = acc
                            .balance
                            .checked_add(amount)
                            .ok_or(InvalidTransaction::Overflow)?;
                        Ok::<_, InvalidTransaction>(())
                    })??,
                    None => {
                        self.state.create(identity, address, amount)?;
                        self.summary.accounts_created += 1;
                    }
                }
                credit(&mut self.summary.deposited, coin, amount);
            }
            Transaction::CreateAccount { coin, key, address } => {
                let identity = Identity::new(coin, key);
                if self.state.find(&identity).is_none() {
                    self.state.create(identity, address, U256::ZERO)?;
                    self.summary.accounts_created += 1;
                }
            }
            Transaction::Transfer {
                from,
                to,
                coin,
                amount,
                fee,
                nonce,
            } => {
                let credited = amount
                    .checked_sub(fee)
                    .ok_or(InvalidTransaction::FeeExceedsAmount { fee, amount })?;
                let recipient = self
                    .state
                    .get(to)
                    .ok_or(StateError::MissingAccount(to))?;
                if recipient.coin != coin {
                    return Err(InvalidTransaction::CoinMismatch {
                        account: recipient.coin,
                        tx: coin,
                    }
                    .into());
                }
                self.debit(from, coin, amount, nonce)?;
                self.state.update(to, |acc| {
                    acc.balance = acc
                        .balance
                        .checked_add(credited)
                        .ok_or(InvalidTransaction::Overflow)?;
                    Ok::<_, InvalidTransaction>(())
                })??;
                self.fees.collect(coin, fee)?;
            }
            Transaction::Exit {
                from,
                coin,
                amount,
                fee,
                nonce,
            } => {
                let exited = amount
                    .checked_sub(fee)
                    .ok_or(InvalidTransaction::FeeExceedsAmount { fee, amount })?;
                self.debit(from, coin, amount, nonce)?;
                let sender = self
                    .state
                    .get(from)
                    .ok_or(StateError::MissingAccount(from))?;
                self.exits.add(sender, exited)?;
                if sender.balance.is_zero() {
                    self.state.remove(from)?;
                    debug!(idx = from, "account drained by exit");
                }
                self.fees.collect(coin, fee)?;
            }
        }
        Ok(())
    }

    /// Takes `amount` from `idx` and bumps its nonce.
    fn debit(
        &mut self,
        idx: AccountIdx,
        coin: CoinId,
        amount: U256,
        nonce: u64,
    ) -> Result<(), Failure> {
        self.state.update(idx, |acc| {
            if acc.coin != coin {
                return Err(InvalidTransaction::CoinMismatch {
                    account: acc.coin,
                    tx: coin,
                });
            }
            if acc.nonce != nonce {
                return Err(InvalidTransaction::Nonce {
                    expected: acc.nonce,
                    found: nonce,
                });
            }
            acc.balance = acc.balance.checked_sub(amount).ok_or(
                InvalidTransaction::InsufficientBalance {
                    balance: acc.balance,
                    amount,
                },
            )?;
            acc.nonce += 1;
            Ok(())
        })??;
        Ok(())
    }
}

struct Replayed {
    state: StateTree,
    fees: FeeRegistry,
    exits: ExitTreeBuilder,
    summary: BatchSummary,
}

fn replay(base: &Snapshot, batch: &Batch) -> Result<Replayed, ConsolidationError> {
    let number = batch.number;
    let expected = base.last_batch + 1;
    if number != expected {
        return Err(ConsolidationError::OutOfOrder {
            batch: number,
            expected,
        });
    }

    let mut state = (*base.state).clone();
    let mut fees = (*base.fees).clone();
    let mut exits = ExitTreeBuilder::default();
    let mut summary = BatchSummary {
        number,
        block: batch.block,
        transactions: batch.transactions.len(),
        ..Default::default()
    };

    fees.install(number, batch.fee_plan.clone());
    let mut replay = Replay {
        state: &mut state,
        fees: &mut fees,
        exits: &mut exits,
        summary: &mut summary,
    };
    for (i, tx) in batch.transactions.iter().enumerate() {
        replay.apply(tx).map_err(|failure| match failure {
            Failure::State(source) => ConsolidationError::CorruptState {
                batch: number,
                tx: i,
                source,
            },
            Failure::Invalid(source) => ConsolidationError::InvalidTransaction {
                batch: number,
                tx: i,
                source,
            },
        })?;
    }
    Ok(Replayed {
        state,
        fees,
        exits,
        summary,
    })
}

/// The state and exit roots `batch` produces on top of `base`, without
/// comparing them with the roots the batch declares.
pub fn computed_roots(base: &Snapshot, batch: &Batch) -> Result<(U256, U256), ConsolidationError> {
    let Replayed { state, exits, .. } = replay(base, batch)?;
    let exit_tree = exits
        .freeze(batch.number)
        .map_err(|source| ConsolidationError::ExitTree {
            batch: batch.number,
            source,
        })?;
    Ok((state.root_u256(), exit_tree.root_u256()))
}

/// Applies `batch` to `base`. The batch must be the one following
/// `base.last_batch`, and both roots it declares must match the replay.
pub fn consolidate(base: &Snapshot, batch: Batch) -> Result<Consolidated, ConsolidationError> {
    let number = batch.number;
    let Replayed {
        mut state,
        fees,
        exits,
        mut summary,
    } = replay(base, &batch)?;

    let computed = state.root_u256();
    if computed != batch.state_root {
        return Err(ConsolidationError::RootMismatch {
            batch: number,
            computed,
            expected: batch.state_root,
        });
    }

    summary.exited = exits.totals();
    let exit_tree = exits
        .freeze(number)
        .map_err(|source| ConsolidationError::ExitTree {
            batch: number,
            source,
        })?;
    if exit_tree.root_u256() != batch.exit_root {
        return Err(ConsolidationError::ExitRootMismatch {
            batch: number,
            computed: exit_tree.root_u256(),
            expected: batch.exit_root,
        });
    }

    summary.state_root = computed;
    summary.exit_root = batch.exit_root;
    summary.fees = fees.collected().clone();

    let changes = state
        .take_changes()
        .map_err(|source| ConsolidationError::AccountTree {
            batch: number,
            source,
        })?;
    let mut archive = base.exits.clone();
    let exit_record = (!exit_tree.is_empty()).then(|| {
        let record = exit_tree.to_record();
        Arc::make_mut(&mut archive).insert(exit_tree);
        record
    });
    let mut batches = base.batches.clone();
    Arc::make_mut(&mut batches).insert(number, summary.clone());

    info!(
        batch = number,
        txs = summary.transactions,
        accounts = state.len(),
        root = %format!("{computed:#x}"),
        "consolidated batch"
    );

    Ok(Consolidated {
        snapshot: Snapshot {
            last_batch: number,
            last_block: base.last_block,
            state: Arc::new(state),
            exits: archive,
            batches,
            coins: base.coins.clone(),
            fees: Arc::new(fees),
            operators: base.operators.clone(),
        },
        summary,
        changes,
        exit_tree: exit_record,
    })
}

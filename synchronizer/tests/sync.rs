mod common;

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use rollup_smt::utils::u2hashout;
use rollup_synchronizer::config::SyncMode;
use rollup_synchronizer::error::{ConsolidationError, SyncError};
use rollup_synchronizer::query::StateQuery;
use rollup_synchronizer::store::{FileStore, KvStore, MemoryStore};
use rollup_synchronizer::sync::{LoopState, Synchronizer};
use tokio::sync::watch;

use self::common::*;

fn balance(query: &StateQuery, n: u64) -> Option<U256> {
    let k = key(n);
    query
        .get_state_by_account(0, k.ax, k.ay)
        .map(|account| account.balance)
}

#[tokio::test]
async fn deposit_transfer_and_exit() {
    let mut forger = Forger::new();
    forger.add_token(0);
    forger.deposit(1, 10);
    forger.forge(BatchPlan::default().create(2));

    let mut sync = Synchronizer::open(
        forger.ledger.clone(),
        MemoryStore::default(),
        config(SyncMode::Archive),
    )
    .unwrap();
    let query = sync.query();
    catch_up(&mut sync).await;
    assert_eq!(query.last_batch(), 1);
    assert_eq!(balance(&query, 1), Some(U256::from(10)));
    assert_eq!(balance(&query, 2), Some(U256::ZERO));

    forger.ledger.mine(1);
    forger.forge(BatchPlan::default().tx(1, 2, 3, 0));
    catch_up(&mut sync).await;
    assert_eq!(balance(&query, 1), Some(U256::from(7)));
    assert_eq!(balance(&query, 2), Some(U256::from(3)));

    forger.ledger.mine(1);
    let exit_batch = forger.forge(BatchPlan::default().tx(2, 0, 2, 0));
    catch_up(&mut sync).await;
    assert_eq!(balance(&query, 2), Some(U256::from(1)));
    assert_eq!(query.state_root(), forger.model.state.root_u256());

    let k = key(2);
    assert_eq!(query.get_exit_batches(0, k.ax, k.ay), vec![exit_batch]);
    let info = query
        .get_exit_proof(exit_batch, 0, k.ax, k.ay)
        .unwrap()
        .unwrap();
    assert!(info.found);
    assert!(!info.withdrawn);
    assert_eq!(info.state.unwrap().balance, U256::from(2));
    assert!(info.proof.unwrap().verify(u2hashout(info.root)));

    let summary = query.get_batch(exit_batch).unwrap();
    assert_eq!(summary.exited.get(&0), Some(&U256::from(2)));
    assert_eq!(summary.exit_root, info.root);
}

#[tokio::test]
async fn fees_are_collected_per_coin() {
    let mut forger = Forger::new();
    forger.add_token(0);
    forger.deposit(1, 5);
    forger.deposit(2, 0);
    forger.forge(BatchPlan::default());
    forger.ledger.mine(1);
    let charged = forger.forge(BatchPlan::default().fee(0, 5).tx(1, 2, 5, 0));

    let mut sync = Synchronizer::open(
        forger.ledger.clone(),
        MemoryStore::default(),
        config(SyncMode::Archive),
    )
    .unwrap();
    catch_up(&mut sync).await;

    let query = sync.query();
    assert_eq!(balance(&query, 1), Some(U256::ZERO));
    assert_eq!(balance(&query, 2), Some(U256::ZERO));
    assert_eq!(query.get_fee_totals().get(&0), Some(&U256::from(5)));
    assert_eq!(
        query.get_batch(charged).unwrap().fees.get(&0),
        Some(&U256::from(5))
    );
    assert!(query.get_coins().contains_key(&0));
}

#[tokio::test]
async fn independent_replays_agree() {
    let mut forger = Forger::new();
    forger.add_token(0);
    for n in 1..=4 {
        forger.deposit(n, 100 * n as u128);
    }
    forger.forge(BatchPlan::default().create(5));
    forger.ledger.mine(3);
    forger.forge(BatchPlan::default().tx(4, 5, 50, 0).tx(3, 0, 10, 0));

    let mut replays = Vec::new();
    for _ in 0..2 {
        let mut sync = Synchronizer::open(
            forger.ledger.clone(),
            MemoryStore::default(),
            config(SyncMode::Archive),
        )
        .unwrap();
        catch_up(&mut sync).await;
        replays.push(sync.query());
    }

    let (a, b) = (&replays[0], &replays[1]);
    assert_eq!(a.state_root(), b.state_root());
    assert_eq!(a.state_root(), forger.model.state.root_u256());
    for idx in 1..=5 {
        assert_eq!(a.get_state_by_index(idx), b.get_state_by_index(idx));
    }
}

#[tokio::test]
async fn undecodable_batch_is_retried_without_reapplying() {
    let mut forger = Forger::new();
    forger.add_token(0);
    forger.deposit(1, 10);
    forger.forge(BatchPlan::default());
    forger.forge_garbage();

    let mut sync = Synchronizer::open(
        forger.ledger.clone(),
        MemoryStore::default(),
        config(SyncMode::Archive),
    )
    .unwrap();
    let query = sync.query();

    for _ in 0..2 {
        let err = sync.step().await.unwrap_err();
        assert!(matches!(err, SyncError::Decode { batch: 2, .. }), "{err}");
        assert!(!err.is_fatal());
        assert_eq!(query.last_batch(), 1);
        assert_eq!(balance(&query, 1), Some(U256::from(10)));
        assert_eq!(sync.cursor().next_block(), 1);
    }
    assert_eq!(
        sync.store().checkpoint().unwrap().map(|c| c.last_batch),
        Some(1)
    );
}

#[tokio::test]
async fn root_mismatch_halts_the_loop() {
    let mut forger = Forger::new();
    forger.add_token(0);
    forger.deposit(1, 10);
    forger.forge(BatchPlan::default());
    forger.ledger.mine(1);
    forger.deposit(1, 5);
    let (computed, _) = forger.roots(&BatchPlan::default());
    forger.forge_with_root(BatchPlan::default(), U256::from(42));

    let mut sync = Synchronizer::open(
        forger.ledger.clone(),
        MemoryStore::default(),
        config(SyncMode::Archive),
    )
    .unwrap();
    let query = sync.query();
    let status = sync.status();
    let (_stop, stop_rx) = watch::channel(false);

    let err = tokio::time::timeout(Duration::from_secs(10), sync.run(stop_rx))
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_fatal());
    match err {
        SyncError::Consolidation(ConsolidationError::RootMismatch {
            batch,
            computed: c,
            expected,
        }) => {
            assert_eq!(batch, 2);
            assert_eq!(c, computed);
            assert_eq!(expected, U256::from(42));
        }
        other => panic!("unexpected error {other}"),
    }

    let status = status.borrow().clone();
    assert!(status.halted);
    assert!(status.error.is_some());
    assert_eq!(query.last_batch(), 1);
    assert_eq!(balance(&query, 1), Some(U256::from(10)));
}

#[tokio::test]
async fn deposits_wait_for_their_batch() {
    let mut forger = Forger::new();
    forger.add_token(0);
    forger.deposit(1, 10);
    forger.forge(BatchPlan::default());
    forger.ledger.mine(1);
    forger.deposit_for(3, 2, 7);
    forger.forge(BatchPlan::default());
    forger.ledger.mine(5);
    let last = forger.forge(BatchPlan::default());
    assert_eq!(last, 3);

    let kv = Arc::new(MemoryStore::default());
    let mut sync = Synchronizer::open(
        forger.ledger.clone(),
        kv.clone(),
        config(SyncMode::Archive),
    )
    .unwrap();
    let outcome = sync.step().await.unwrap();
    assert_eq!(outcome.batches, 2);
    assert!(outcome.behind);
    assert_eq!(balance(&sync.query(), 2), None);
    assert_eq!(sync.cursor().deposits_for(3).len(), 1);
    drop(sync);

    let mut sync =
        Synchronizer::open(forger.ledger.clone(), kv, config(SyncMode::Archive)).unwrap();
    assert_eq!(sync.cursor().next_block(), 5);
    assert_eq!(sync.cursor().deposits_for(3).len(), 1);
    catch_up(&mut sync).await;

    let query = sync.query();
    assert_eq!(query.last_batch(), 3);
    let k = key(2);
    let account = query.get_state_by_account(0, k.ax, k.ay).unwrap();
    assert_eq!(account.balance, U256::from(7));
    assert_eq!(account.idx, 2);
    assert_eq!(query.state_root(), forger.model.state.root_u256());
    assert!(sync.cursor().deposits_for(3).is_empty());
}

#[tokio::test]
async fn late_deposits_for_consolidated_batches_are_dropped() {
    let mut forger = Forger::new();
    forger.add_token(0);
    forger.deposit(1, 10);
    forger.forge(BatchPlan::default());

    let mut sync = Synchronizer::open(
        forger.ledger.clone(),
        MemoryStore::default(),
        config(SyncMode::Archive),
    )
    .unwrap();
    catch_up(&mut sync).await;

    forger.ledger.mine(1);
    forger.deposit_for(1, 2, 50);
    forger.ledger.mine(1);
    forger.forge(BatchPlan::default());
    catch_up(&mut sync).await;

    let query = sync.query();
    assert_eq!(query.last_batch(), 2);
    assert_eq!(balance(&query, 1), Some(U256::from(10)));
    assert_eq!(balance(&query, 2), None);
    assert!(sync.cursor().deposits_for(1).is_empty());
    assert_eq!(query.state_root(), forger.model.state.root_u256());
}

#[tokio::test]
async fn ledger_outages_are_retried() {
    let mut forger = Forger::new();
    forger.add_token(0);
    forger.deposit(1, 10);
    forger.forge(BatchPlan::default());
    forger.ledger.fail_next(3);

    let mut sync = Synchronizer::open(
        forger.ledger.clone(),
        MemoryStore::default(),
        config(SyncMode::Archive),
    )
    .unwrap();
    let err = sync.step().await.unwrap_err();
    assert!(matches!(err, SyncError::Transient(_)));
    assert!(!err.is_fatal());

    let query = sync.query();
    let mut status = sync.status();
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { sync.run(stop_rx).await });

    tokio::time::timeout(
        Duration::from_secs(10),
        status.wait_for(|s| s.last_batch == 1 && s.state == LoopState::Idle),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(balance(&query, 1), Some(U256::from(10)));
    assert!(!status.borrow().halted);

    stop_tx.send_replace(true);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_lets_the_step_in_flight_finish() {
    let mut forger = Forger::new();
    forger.add_token(0);
    forger.deposit(1, 10);
    forger.forge(BatchPlan::default());
    let release = forger.ledger.hold_next_calldata();

    let mut sync = Synchronizer::open(
        forger.ledger.clone(),
        MemoryStore::default(),
        config(SyncMode::Archive),
    )
    .unwrap();
    let query = sync.query();
    let status = sync.status();
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let result = sync.run(stop_rx).await;
        (result, sync)
    });

    tokio::time::timeout(Duration::from_secs(10), forger.ledger.calldata_parked())
        .await
        .unwrap();
    stop_tx.send_replace(true);
    assert_eq!(query.last_batch(), 0);
    release.notify_one();

    let (result, sync) = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap();
    result.unwrap();
    assert_eq!(query.last_batch(), 1);
    assert_eq!(balance(&query, 1), Some(U256::from(10)));
    assert_eq!(status.borrow().last_batch, 1);
    assert!(!status.borrow().halted);

    let checkpoint = sync.store().checkpoint().unwrap().unwrap();
    assert_eq!(checkpoint.last_batch, 1);
    assert_eq!(checkpoint.next_block, forger.ledger.head() + 1);
}

#[tokio::test]
async fn state_survives_a_restart() {
    let dir = std::env::temp_dir().join(format!(
        "rollup-sync-restart-{}-{}",
        std::process::id(),
        rand::random::<u64>()
    ));
    let mut forger = Forger::new();
    forger.add_token(0);
    forger.deposit(1, 10);
    forger.deposit(2, 10);
    forger.forge(BatchPlan::default());
    forger.ledger.mine(1);
    forger.forge(BatchPlan::default().tx(1, 2, 4, 0).tx(2, 0, 1, 0));
    forger.create_operator(3);

    let (root, next_block, exit) = {
        let mut sync = Synchronizer::open(
            forger.ledger.clone(),
            FileStore::open(&dir).unwrap(),
            config(SyncMode::Archive),
        )
        .unwrap();
        catch_up(&mut sync).await;
        let query = sync.query();
        let k = key(2);
        (
            query.state_root(),
            sync.cursor().next_block(),
            query.get_exit_proof(2, 0, k.ax, k.ay).unwrap().unwrap(),
        )
    };

    let mut sync = Synchronizer::open(
        forger.ledger.clone(),
        FileStore::open(&dir).unwrap(),
        config(SyncMode::Archive),
    )
    .unwrap();
    let query = sync.query();
    assert_eq!(query.state_root(), root);
    assert_eq!(query.last_batch(), 2);
    assert_eq!(sync.cursor().next_block(), next_block);
    assert_eq!(balance(&query, 1), Some(U256::from(6)));
    assert_eq!(balance(&query, 2), Some(U256::from(13)));
    assert_eq!(query.get_state_by_address(address(1)).len(), 1);
    assert_eq!(query.get_coins().len(), 1);
    assert_eq!(query.get_active_operators_at(2).len(), 1);
    let k = key(2);
    let reloaded = query.get_exit_proof(2, 0, k.ax, k.ay).unwrap().unwrap();
    assert_eq!(reloaded.root, exit.root);
    assert_eq!(reloaded.siblings, exit.siblings);
    assert_eq!(sync.status().borrow().last_batch, 2);
    assert_eq!(sync.status().borrow().last_synced_block, Some(2));

    forger.ledger.mine(1);
    forger.forge(BatchPlan::default().tx(1, 2, 6, 1));
    catch_up(&mut sync).await;
    assert_eq!(query.last_batch(), 3);
    assert_eq!(balance(&query, 1), Some(U256::ZERO));
    assert_eq!(query.state_root(), forger.model.state.root_u256());

    std::fs::remove_dir_all(&dir).unwrap();
}

/// Two accounts exit in batch 2 and the first one withdraws.
async fn one_of_two_withdrawn(
    mode: SyncMode,
) -> (Forger, Synchronizer<Arc<FakeLedger>, Arc<MemoryStore>>) {
    let mut forger = Forger::new();
    forger.add_token(0);
    forger.deposit(1, 10);
    forger.deposit(2, 10);
    forger.forge(BatchPlan::default());
    forger.ledger.mine(1);
    forger.forge(BatchPlan::default().tx(1, 0, 3, 0).tx(2, 0, 4, 0));
    forger.ledger.mine(1);
    forger.withdraw(2, 1);

    let mut sync = Synchronizer::open(
        forger.ledger.clone(),
        Arc::new(MemoryStore::default()),
        config(mode),
    )
    .unwrap();
    catch_up(&mut sync).await;
    (forger, sync)
}

#[tokio::test]
async fn archive_keeps_withdrawn_exits() {
    let (forger, mut sync) = one_of_two_withdrawn(SyncMode::Archive).await;
    let query = sync.query();
    let (k1, k2) = (key(1), key(2));
    let first = query.get_exit_proof(2, 0, k1.ax, k1.ay).unwrap().unwrap();
    let second = query.get_exit_proof(2, 0, k2.ax, k2.ay).unwrap().unwrap();
    assert!(first.withdrawn);
    assert!(!second.withdrawn);

    forger.ledger.mine(1);
    forger.withdraw(2, 2);
    forger.withdraw(2, 2);
    catch_up(&mut sync).await;

    let second = query.get_exit_proof(2, 0, k2.ax, k2.ay).unwrap().unwrap();
    assert!(second.withdrawn);
    assert!(second.proof.unwrap().verify(u2hashout(second.root)));
    assert_eq!(query.get_exit_batches(0, k1.ax, k1.ay), vec![2]);
    assert_eq!(sync.store().kv().scan_prefix(b"exit/").unwrap().len(), 1);
}

#[tokio::test]
async fn pruning_drops_fully_withdrawn_exits() {
    let (forger, mut sync) = one_of_two_withdrawn(SyncMode::Pruning).await;
    let query = sync.query();
    let k2 = key(2);
    assert!(query.get_exit_proof(2, 0, k2.ax, k2.ay).unwrap().is_some());

    forger.ledger.mine(1);
    forger.withdraw(2, 2);
    catch_up(&mut sync).await;

    assert!(query.get_exit_proof(2, 0, k2.ax, k2.ay).unwrap().is_none());
    assert!(query.get_exit_batches(0, k2.ax, k2.ay).is_empty());
    assert!(sync.store().kv().scan_prefix(b"exit/").unwrap().is_empty());
    assert_eq!(balance(&query, 1), Some(U256::from(7)));
}

#[tokio::test]
async fn every_exit_of_a_batch_is_provable() {
    let mut forger = Forger::new();
    forger.add_token(0);
    for n in 1..=3 {
        forger.deposit(n, 20);
    }
    forger.forge(BatchPlan::default());
    forger.ledger.mine(1);
    let plan = BatchPlan::default()
        .tx(1, 0, 5, 0)
        .tx(2, 0, 20, 0)
        .tx(3, 0, 1, 0)
        .tx(1, 0, 2, 1);
    let (_, exit_root) = forger.roots(&plan);
    forger.forge(plan);

    let mut sync = Synchronizer::open(
        forger.ledger.clone(),
        MemoryStore::default(),
        config(SyncMode::Archive),
    )
    .unwrap();
    catch_up(&mut sync).await;

    let query = sync.query();
    for (n, exited) in [(1, 7), (2, 20), (3, 1)] {
        let k = key(n);
        let info = query.get_exit_proof(2, 0, k.ax, k.ay).unwrap().unwrap();
        assert!(info.found, "exit of account {n}");
        assert_eq!(info.root, exit_root);
        assert_eq!(info.state.unwrap().balance, U256::from(exited));
        assert!(info.proof.unwrap().verify(u2hashout(exit_root)));
    }
    // Account 2 exited its whole balance.
    assert_eq!(balance(&query, 2), None);

    let stranger = key(9);
    let info = query
        .get_exit_proof(2, 0, stranger.ax, stranger.ay)
        .unwrap()
        .unwrap();
    assert!(!info.found);
    assert_eq!(
        query.get_batch(2).unwrap().exited.get(&0),
        Some(&U256::from(28))
    );
}

#[tokio::test]
async fn operators_activate_two_eras_after_registration() {
    let forger = Forger::new();
    forger.create_operator(7);
    forger.create_operator(7);
    forger.ledger.mine(10);

    let mut sync = Synchronizer::open(
        forger.ledger.clone(),
        MemoryStore::default(),
        config(SyncMode::Archive),
    )
    .unwrap();
    catch_up(&mut sync).await;
    let query = sync.query();
    assert_eq!(sync.status().borrow().era, 1);
    assert!(query.get_active_operators().is_empty());
    assert_eq!(query.get_active_operators_at(2).len(), 1);

    forger.ledger.mine(10);
    catch_up(&mut sync).await;
    let status = sync.status().borrow().clone();
    assert_eq!((status.era, status.slot), (2, 4));
    let active = query.get_active_operators();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, 7);
    assert_eq!(active[0].registered_era, 0);

    forger.ledger.mine(1);
    forger.remove_operator(7);
    catch_up(&mut sync).await;
    assert!(query.get_active_operators().is_empty());
}

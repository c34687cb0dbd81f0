use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;

use alloy::primitives::{Address, U256};
use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use rollup_synchronizer::operators::Operator;
use rollup_synchronizer::query::{AccountProof, ExitInfo, StateQuery};
use rollup_synchronizer::sync::SyncStatus;
use rollup_synchronizer::types::{AccountIdx, AccountState, BatchNumber, BatchSummary, CoinId};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    query: StateQuery,
    status: watch::Receiver<SyncStatus>,
}

type Reply<T> = Result<Json<T>, (StatusCode, String)>;

fn not_found<T>(what: impl std::fmt::Display) -> Reply<T> {
    Err((StatusCode::NOT_FOUND, format!("{what} not found")))
}

/// List lookups answer 404 rather than an empty list.
fn non_empty<T>(items: Vec<T>, what: impl std::fmt::Display) -> Reply<Vec<T>> {
    if items.is_empty() {
        return not_found(what);
    }
    Ok(Json(items))
}

fn parse_coordinate(s: &str) -> Result<U256, (StatusCode, String)> {
    U256::from_str(s).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("invalid key coordinate {s}: {e}"),
        )
    })
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    error!("query failed: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub(crate) fn router(query: StateQuery, status: watch::Receiver<SyncStatus>) -> Router {
    Router::new()
        .route("/status", get(sync_status))
        .route("/accounts/:coin/:ax/:ay", get(account))
        .route("/pubkeys/:ax/:ay", get(by_public_key))
        .route("/addresses/:address", get(by_address))
        .route("/proofs/:idx", get(account_proof))
        .route("/exit-batches/:coin/:ax/:ay", get(exit_batches))
        .route("/exits/:batch/:coin/:ax/:ay", get(exit_proof))
        .route("/batches/:n", get(batch))
        .route("/coins", get(coins))
        .route("/fees", get(fees))
        .route("/operators", get(operators))
        .with_state(AppState { query, status })
}

/// Serves queries until the server fails.
pub(crate) async fn http_main(
    query: StateQuery,
    status: watch::Receiver<SyncStatus>,
    port: u16,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("serving queries on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    Ok(axum::serve(listener, router(query, status)).await?)
}

async fn sync_status(State(app): State<AppState>) -> Json<SyncStatus> {
    Json(app.status.borrow().clone())
}

async fn account(
    State(app): State<AppState>,
    Path((coin, ax, ay)): Path<(CoinId, String, String)>,
) -> Reply<AccountState> {
    let (ax, ay) = (parse_coordinate(&ax)?, parse_coordinate(&ay)?);
    match app.query.get_state_by_account(coin, ax, ay) {
        Some(account) => Ok(Json(account)),
        None => not_found(format!("account of coin {coin}")),
    }
}

async fn by_public_key(
    State(app): State<AppState>,
    Path((ax, ay)): Path<(String, String)>,
) -> Reply<Vec<AccountState>> {
    let (ax, ay) = (parse_coordinate(&ax)?, parse_coordinate(&ay)?);
    non_empty(app.query.get_state_by_public_key(ax, ay), "accounts of key")
}

async fn by_address(
    State(app): State<AppState>,
    Path(address): Path<String>,
) -> Reply<Vec<AccountState>> {
    let address = Address::from_str(&address)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid address {address}: {e}")))?;
    non_empty(
        app.query.get_state_by_address(address),
        format!("accounts of {address}"),
    )
}

async fn account_proof(
    State(app): State<AppState>,
    Path(idx): Path<AccountIdx>,
) -> Reply<AccountProof> {
    app.query.get_account_proof(idx).map(Json).map_err(internal)
}

async fn exit_batches(
    State(app): State<AppState>,
    Path((coin, ax, ay)): Path<(CoinId, String, String)>,
) -> Reply<Vec<BatchNumber>> {
    let (ax, ay) = (parse_coordinate(&ax)?, parse_coordinate(&ay)?);
    non_empty(
        app.query.get_exit_batches(coin, ax, ay),
        format!("exits of coin {coin}"),
    )
}

async fn exit_proof(
    State(app): State<AppState>,
    Path((batch, coin, ax, ay)): Path<(BatchNumber, CoinId, String, String)>,
) -> Reply<ExitInfo> {
    let (ax, ay) = (parse_coordinate(&ax)?, parse_coordinate(&ay)?);
    match app.query.get_exit_proof(batch, coin, ax, ay).map_err(internal)? {
        Some(info) => Ok(Json(info)),
        None => not_found(format!("exit tree of batch {batch}")),
    }
}

async fn batch(State(app): State<AppState>, Path(n): Path<BatchNumber>) -> Reply<BatchSummary> {
    match app.query.get_batch(n) {
        Some(summary) => Ok(Json(summary)),
        None => not_found(format!("batch {n}")),
    }
}

async fn coins(State(app): State<AppState>) -> Json<BTreeMap<CoinId, Address>> {
    Json(app.query.get_coins())
}

#[derive(Serialize)]
struct FeeTotals {
    totals: BTreeMap<CoinId, U256>,
}

async fn fees(State(app): State<AppState>) -> Json<FeeTotals> {
    Json(FeeTotals {
        totals: app.query.get_fee_totals(),
    })
}

async fn operators(State(app): State<AppState>) -> Json<Vec<Operator>> {
    Json(app.query.get_active_operators())
}

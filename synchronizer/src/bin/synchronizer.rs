use anyhow::{Context, Result};
use clap::Parser;
use rollup_synchronizer::config::SyncConfig;
use rollup_synchronizer::env::load_dotenvy_vars_if_present;
use rollup_synchronizer::provider::{ContractAddresses, LedgerProvider, RpcLedgerProvider};
use rollup_synchronizer::retry::build_http_retry_provider;
use rollup_synchronizer::store::{FileStore, KvStore, MemoryStore};
use rollup_synchronizer::sync::Synchronizer;
use tokio::sync::watch;
use tracing::{error, info, warn};

use self::synchronizer::*;
mod synchronizer {
    pub mod cli;
    pub mod http;
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = load_dotenvy_vars_if_present();
    rollup_synchronizer::tracing::init();
    dotenv.log();

    let args = cli::Cli::parse();
    let contracts = ContractAddresses {
        rollup: args.rollup_address,
        staking: args.staking_address,
    };
    info!(
        rollup = %contracts.rollup,
        staking = %contracts.staking,
        "following {}",
        args.rpc_url
    );
    let provider = RpcLedgerProvider::new(
        build_http_retry_provider(args.rpc_url.clone(), args.rpc_backoff, args.rpc_max_retries),
        contracts,
    );
    let config = SyncConfig::from(args.sync.clone());

    if args.ephemeral {
        warn!("running without a data directory, the state is lost on exit");
        serve(provider, MemoryStore::default(), config, args.http_port).await
    } else {
        let dir = args.data_dir()?;
        let store = FileStore::open(&dir)
            .with_context(|| format!("opening the store in {}", dir.display()))?;
        info!("using store {}", store.path().display());
        serve(provider, store, config, args.http_port).await
    }
}

/// Runs the loop and the query server until Ctrl-C. A halted loop leaves the
/// server answering from the last consolidated state.
async fn serve<P, S>(provider: P, store: S, config: SyncConfig, port: u16) -> Result<()>
where
    P: LedgerProvider + Send + Sync + 'static,
    S: KvStore + 'static,
{
    let mut sync = Synchronizer::open(provider, store, config)?;
    let server = tokio::spawn(http::http_main(sync.query(), sync.status(), port));

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut sync_loop = tokio::spawn(async move { sync.run(stop_rx).await });

    let finished = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listening for Ctrl-C")?;
            info!("Ctrl-C received, stopping");
            None
        }
        res = server => {
            res??;
            return Ok(());
        }
        res = &mut sync_loop => Some(res?),
    };

    let result = match finished {
        Some(result) => {
            if let Err(e) = &result {
                error!("synchronizer halted: {e}, queries are still served");
            }
            tokio::signal::ctrl_c().await.context("listening for Ctrl-C")?;
            result
        }
        None => {
            stop_tx.send_replace(true);
            sync_loop.await?
        }
    };
    Ok(result?)
}

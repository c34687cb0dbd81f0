use std::path::PathBuf;

use alloy::primitives::Address;
use alloy::transports::http::reqwest::Url;
use anyhow::Result;
use clap::{Parser, ValueHint};
use directories::ProjectDirs;
use rollup_synchronizer::config::CliSyncConfig;

const DATA_DIR_NAME: &str = "rollup_synchronizer";

/// Follows a rollup on its base ledger and serves the replayed state.
#[derive(Parser)]
#[command(version = rollup_synchronizer::version(), propagate_version = true)]
pub(crate) struct Cli {
    /// The base ledger node RPC URL.
    #[arg(short = 'u', long, env = "ROLLUP_SYNC_RPC_URL", value_hint = ValueHint::Url)]
    pub(crate) rpc_url: Url,
    /// Address of the rollup contract.
    #[arg(long, env = "ROLLUP_SYNC_ROLLUP_ADDRESS")]
    pub(crate) rollup_address: Address,
    /// Address of the staking contract.
    #[arg(long, env = "ROLLUP_SYNC_STAKING_ADDRESS")]
    pub(crate) staking_address: Address,
    /// Directory holding the checkpoint. Defaults to the platform data
    /// directory.
    #[arg(short = 'd', long, env = "ROLLUP_SYNC_DATA_DIR", value_hint = ValueHint::DirPath)]
    pub(crate) data_dir: Option<PathBuf>,
    /// Keep the state in memory only. Every start replays from the creation
    /// block.
    #[arg(long, env = "ROLLUP_SYNC_EPHEMERAL", conflicts_with = "data_dir")]
    pub(crate) ephemeral: bool,
    /// Port of the HTTP query server.
    #[arg(short = 'p', long, env = "ROLLUP_SYNC_HTTP_PORT", default_value_t = 8080)]
    pub(crate) http_port: u16,
    /// Backoff in milliseconds for retry requests
    #[arg(long, env = "ROLLUP_SYNC_RPC_BACKOFF", default_value_t = 500)]
    pub(crate) rpc_backoff: u64,
    /// The maximum number of retries
    #[arg(long, env = "ROLLUP_SYNC_RPC_MAX_RETRIES", default_value_t = 5)]
    pub(crate) rpc_max_retries: u32,

    #[clap(flatten)]
    pub(crate) sync: CliSyncConfig,
}

impl Cli {
    pub(crate) fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        Ok(match ProjectDirs::from("", "", DATA_DIR_NAME) {
            Some(dirs) => dirs.data_dir().to_path_buf(),
            None => std::env::current_dir()?.join(DATA_DIR_NAME),
        })
    }
}

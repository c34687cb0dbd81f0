use std::time::Duration;

use clap::{Args, ValueEnum};
use rollup_common::{EraClock, DEFAULT_BLOCKS_PER_SLOT, DEFAULT_SLOTS_PER_ERA};
use serde::{Deserialize, Serialize};

const HELP_HEADING: &str = "Synchronizer options";

/// Retention policy for exit trees.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Keep every exit tree for exit-proof queries.
    #[default]
    Archive,
    /// Drop an exit tree once all of its leaves are withdrawn on-chain.
    Pruning,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Archive => f.write_str("archive"),
            SyncMode::Pruning => f.write_str("pruning"),
        }
    }
}

/// Runtime configuration of the synchronizer loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    pub mode: SyncMode,
    /// First block scanned when there is no checkpoint.
    pub creation_block: u64,
    /// Sleep between polls once caught up.
    pub poll_interval: Duration,
    /// Sleep after a failed poll.
    pub error_backoff: Duration,
    /// Upper bound for a single ledger request.
    pub fetch_timeout: Duration,
    /// Largest block range requested in one poll.
    pub max_block_range: u64,
    pub clock: EraClock,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Archive,
            creation_block: 0,
            poll_interval: Duration::from_secs(10),
            error_backoff: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(30),
            max_block_range: 1_000,
            clock: EraClock::default(),
        }
    }
}

/// Command line form of [`SyncConfig`].
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct CliSyncConfig {
    /// Exit tree retention policy.
    #[arg(long, env = "ROLLUP_SYNC_MODE", help_heading = HELP_HEADING, value_enum, default_value_t = SyncMode::Archive)]
    pub mode: SyncMode,
    /// Block the rollup contracts were deployed in. Scanning starts there.
    #[arg(long, env = "ROLLUP_SYNC_CREATION_BLOCK", help_heading = HELP_HEADING, default_value_t = 0)]
    pub creation_block: u64,
    /// Milliseconds between polls once caught up with the chain head.
    #[arg(long, env = "ROLLUP_SYNC_POLL_INTERVAL", help_heading = HELP_HEADING, default_value_t = 10_000)]
    pub poll_interval: u64,
    /// Milliseconds to wait after a failed poll.
    #[arg(long, env = "ROLLUP_SYNC_ERROR_BACKOFF", help_heading = HELP_HEADING, default_value_t = 5_000)]
    pub error_backoff: u64,
    /// Milliseconds before a ledger request is abandoned.
    #[arg(long, env = "ROLLUP_SYNC_FETCH_TIMEOUT", help_heading = HELP_HEADING, default_value_t = 30_000)]
    pub fetch_timeout: u64,
    /// Maximum number of blocks fetched per poll.
    #[arg(long, env = "ROLLUP_SYNC_MAX_BLOCK_RANGE", help_heading = HELP_HEADING, default_value_t = 1_000)]
    pub max_block_range: u64,
    /// Blocks per staking slot.
    #[arg(long, env = "ROLLUP_SYNC_BLOCKS_PER_SLOT", help_heading = HELP_HEADING, default_value_t = DEFAULT_BLOCKS_PER_SLOT)]
    pub blocks_per_slot: u64,
    /// Slots per staking era.
    #[arg(long, env = "ROLLUP_SYNC_SLOTS_PER_ERA", help_heading = HELP_HEADING, default_value_t = DEFAULT_SLOTS_PER_ERA)]
    pub slots_per_era: u64,
}

impl From<CliSyncConfig> for SyncConfig {
    fn from(cli: CliSyncConfig) -> Self {
        Self {
            mode: cli.mode,
            creation_block: cli.creation_block,
            poll_interval: Duration::from_millis(cli.poll_interval),
            error_backoff: Duration::from_millis(cli.error_backoff),
            fetch_timeout: Duration::from_millis(cli.fetch_timeout),
            max_block_range: cli.max_block_range.max(1),
            clock: EraClock::new(cli.creation_block, cli.blocks_per_slot, cli.slots_per_era),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[clap(flatten)]
        sync: CliSyncConfig,
    }

    #[test]
    fn cli_defaults_match_library_defaults() {
        let cli = TestCli::parse_from(["test"]);
        assert_eq!(SyncConfig::from(cli.sync), SyncConfig::default());
    }

    #[test]
    fn cli_overrides() {
        let cli = TestCli::parse_from([
            "test",
            "--mode",
            "pruning",
            "--creation-block",
            "500",
            "--poll-interval",
            "250",
            "--max-block-range",
            "0",
        ]);
        let config = SyncConfig::from(cli.sync);
        assert_eq!(config.mode, SyncMode::Pruning);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.clock.genesis_block, 500);
        assert_eq!(config.max_block_range, 1);
    }
}

//! Rebuilds and serves the rollup state from the base ledger.
//!
//! The [`sync::Synchronizer`] follows the rollup and staking contracts,
//! decodes every forged batch, replays it against the account tree and keeps
//! the result queryable through [`query::StateQuery`] while it runs.

pub mod config;
pub mod consolidate;
pub mod cursor;
pub mod decoder;
pub mod env;
pub mod error;
pub mod events;
pub mod exit_tree;
pub mod fees;
pub mod operators;
pub mod persist;
pub mod provider;
pub mod query;
pub mod retry;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod sync;
pub mod tracing;
pub mod types;

/// Common information for the `--version` CLI flags.
pub fn version() -> String {
    let pkg_name = env!("CARGO_PKG_NAME");
    let pkg_version = env!("CARGO_PKG_VERSION");
    format!("{pkg_name} ({pkg_version})")
}

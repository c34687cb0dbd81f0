//! `.env` handling for the binary.

use std::path::PathBuf;

use tracing::{debug, warn};

/// Prefix shared by every environment variable the binary reads.
pub const ENV_PREFIX: &str = "ROLLUP_SYNC_";

/// Outcome of looking for a `.env` file. Loading happens before the tracing
/// subscriber exists, so the outcome is logged separately.
#[derive(Debug)]
pub enum DotEnv {
    Loaded(PathBuf),
    Absent,
    Unreadable(dotenvy::Error),
}

impl DotEnv {
    pub fn log(&self) {
        match self {
            DotEnv::Loaded(path) => debug!(
                path = %path.display(),
                vars = ?configured_vars(),
                "loaded environment file"
            ),
            DotEnv::Absent => {}
            DotEnv::Unreadable(e) => warn!("found a `.env` file but could not parse it: {e}"),
        }
    }
}

/// Loads the `.env` file of the working directory or one of its parents and
/// sets the variables it defines. Variables already set are kept.
pub fn load_dotenvy_vars_if_present() -> DotEnv {
    match dotenvy::dotenv() {
        Ok(path) => DotEnv::Loaded(path),
        Err(e) if e.not_found() => DotEnv::Absent,
        Err(e) => DotEnv::Unreadable(e),
    }
}

/// Names of the `ROLLUP_SYNC_*` variables currently set.
pub fn configured_vars() -> Vec<String> {
    let mut vars: Vec<String> = std::env::vars_os()
        .filter_map(|(name, _)| name.into_string().ok())
        .filter(|name| name.starts_with(ENV_PREFIX))
        .collect();
    vars.sort();
    vars
}

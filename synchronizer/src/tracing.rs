use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{prelude::*, util::SubscriberInitExt, EnvFilter};

/// Filter for the directives in `spec`, logging `info` and above when it
/// names no level.
fn filter(spec: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(spec)
}

/// Installs the global subscriber, filtered by `RUST_LOG`.
pub fn init() {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_filter(filter(&directives)),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_unless_told_otherwise() {
        assert_eq!(filter("").max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(filter("debug").max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(
            filter("rollup_synchronizer=trace").max_level_hint(),
            Some(LevelFilter::TRACE)
        );
    }
}

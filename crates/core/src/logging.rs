use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

fn build_env_filter_from(packrat_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("info");

    if let Some(v) = packrat_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

/// Installs the global subscriber. `PACKRAT_LOG` wins over `RUST_LOG`;
/// both fall back to `info`. Safe to call more than once.
pub fn init_logging() {
    TRACING_INIT.get_or_init(|| {
        let env_filter = build_env_filter_from(
            std::env::var("PACKRAT_LOG").ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}

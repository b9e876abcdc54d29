use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static LOGGER_INIT: OnceLock<()> = OnceLock::new();

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter. Safe to call more than once.
pub fn init() {
    LOGGER_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .try_init();
    });
}

use std::sync::Once;

use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    /// JSON lines, one event per line
    Json,
    #[default]
    Pretty,
}

/// Installs the global subscriber. Later calls are no-ops.
///
/// `RUST_LOG` wins over the default level, which is `debug` when the
/// cluster config enables debug mode and `info` otherwise.
pub fn init_logging(format: LogFormat, debug: bool) {
    INIT.call_once(|| {
        let default_level = if debug { "debug" } else { "info" };
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .init();
            }
        }
    });
}

//! Logging setup built on `tracing`.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global tracing subscriber for the engine.
///
/// An explicit `RUST_LOG` in the environment wins over the configured level
/// filter. Call once at startup; installing a second global subscriber
/// panics.
pub fn init(config: &LoggingConfig) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(&config.level));

    let base = fmt::layer()
        .with_ansi(true)
        .with_thread_names(config.thread_names);

    let timestamps = config.timestamps;
    let output: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => {
            if timestamps {
                base.boxed()
            } else {
                base.without_time().boxed()
            }
        }
        LogFormat::Compact => {
            let compact = base.compact();
            if timestamps {
                compact.boxed()
            } else {
                compact.without_time().boxed()
            }
        }
        LogFormat::Json => {
            let json = base.json();
            if timestamps {
                json.boxed()
            } else {
                json.without_time().boxed()
            }
        }
    };

    tracing_subscriber::registry().with(output).with(filter).init();
}

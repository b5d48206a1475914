use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Default filter: info from the engine crates, warnings from dependencies.
pub const DEFAULT_FILTER: &str = "vcdcrm=info,warn";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable compact output.
    Human,
    /// Structured JSON output for log shippers.
    Json,
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("vcdcrm=debug,warn")
        } else {
            EnvFilter::new(DEFAULT_FILTER)
        }
    })
}

/// Initialize the global tracing subscriber.
///
/// Call once at process startup. `RUST_LOG` overrides the default filter;
/// `verbose` lowers the engine crates to `debug` when `RUST_LOG` is unset.
/// Fails if a global subscriber is already installed.
pub fn init(format: LogFormat, verbose: bool) -> Result<()> {
    let env_filter = env_filter(verbose);
    let res = match format {
        LogFormat::Human => {
            let subscriber = fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(subscriber)
                .try_init()
        }
        LogFormat::Json => {
            let subscriber = fmt::layer().json().with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(subscriber)
                .try_init()
        }
    };
    res.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

//! Logging initialization for infw-daemon.
//!
//! Configures `tracing-subscriber` from the `[general]` section of
//! `InfwConfig`: one formatting layer (JSON lines or pretty) behind an
//! `EnvFilter`.

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use infw_core::config::GeneralConfig;

/// Level filter: `RUST_LOG` wins over `general.log_level`.
fn env_filter(config: &GeneralConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Initialize the global tracing subscriber.
///
/// Must be called exactly once, before any tracing macros are used.
///
/// # Formats
///
/// * `"json"` - one JSON object per line, event fields flattened (production)
/// * `"pretty"` - multi-line human-readable output (development)
///
/// # Errors
///
/// Returns an error for an unknown format or if a global subscriber is
/// already installed.
pub fn init_tracing(config: &GeneralConfig) -> Result<()> {
    let layer = match config.log_format.as_str() {
        "json" => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .boxed(),
        "pretty" => fmt::layer().pretty().with_target(true).boxed(),
        other => {
            return Err(anyhow::anyhow!(
                "unknown log format '{}', expected 'json' or 'pretty'",
                other
            ));
        }
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter(config)))
        .try_init()
        .map_err(|e| {
            anyhow::anyhow!(
                "failed to initialize {} tracing subscriber: {}",
                config.log_format,
                e
            )
        })
}

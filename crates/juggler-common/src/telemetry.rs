//! Logging initialization
//!
//! Sets up a `tracing` subscriber with an `EnvFilter` and either JSON or
//! human-readable output. The engine itself only emits `tracing` events;
//! installing a subscriber is left to the binary embedding it.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "info,juggler=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed
    #[error("invalid log filter: {0}")]
    Filter(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for logging initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Filter directive; `None` falls back to `RUST_LOG`, then [`DEFAULT_FILTER`]
    pub filter: Option<String>,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: std::env::var("RUST_LOG").ok(),
            json: std::env::var("JUGGLER_LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(true),
        }
    }
}

/// Build the filter for a configuration
pub fn build_filter(config: &TelemetryConfig) -> Result<EnvFilter, TelemetryError> {
    let directive = config.filter.as_deref().unwrap_or(DEFAULT_FILTER);
    EnvFilter::try_new(directive).map_err(|e| TelemetryError::Filter(e.to_string()))
}

/// Install the global subscriber
///
/// Fails if a global subscriber is already set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = build_filter(&config)?;

    let (json_layer, text_layer) = if config.json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false);
        (Some(layer), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_target(true)))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    Ok(())
}

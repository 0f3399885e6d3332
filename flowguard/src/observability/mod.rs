//! Logging setup and span helpers.
//!
//! The library only emits `tracing` events. Binaries and tests that want
//! to see them install a subscriber with [`init_tracing`].

use crate::context::PipelineContext;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Span};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Plain,
    /// One JSON object per event.
    Json,
}

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// Installs a global fmt subscriber filtered by `RUST_LOG`.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(format: LogFormat) -> Result<(), TryInitError> {
    let filter = env_filter();
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Plain => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Span covering one node run, tagged with the run and pipeline.
pub(crate) fn node_span(ctx: &PipelineContext, node_id: &str, strategy: &'static str) -> Span {
    info_span!(
        "node_run",
        run_id = %ctx.run_id(),
        pipeline = %ctx.pipeline_name(),
        node_id = %node_id,
        strategy,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_serde() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
        assert_eq!(LogFormat::default(), LogFormat::Plain);
    }

    #[test]
    fn test_second_init_fails() {
        // Another test may have installed one already; either way the
        // second call cannot succeed.
        let _ = init_tracing(LogFormat::Plain);
        assert!(init_tracing(LogFormat::Json).is_err());
    }

    #[test]
    fn test_node_span_has_name() {
        let ctx = PipelineContext::new("spans");
        let span = node_span(&ctx, "parse", "sequential");
        // Disabled without a subscriber, but the metadata is still static.
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), "node_run");
        }
    }
}

//! Logging setup for relay binaries.
//!
//! `RUST_LOG` wins over the binary's default directives. A bad filter or a
//! second initialisation is reported as an error instead of panicking.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines without targets.
    #[default]
    Text,
    /// One JSON object per line, for log aggregation.
    Json,
}

impl LogFormat {
    pub const fn from_json_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Text }
    }
}

/// Install the global subscriber.
pub fn init_tracing(default_filter: &str, format: LogFormat) -> Result<()> {
    let filter = build_filter(std::env::var("RUST_LOG").ok(), default_filter)?;
    let json = format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_current_span(false)))
        .with((!json).then(|| fmt::layer().with_target(false)))
        .try_init()
        .map_err(|e| Error::Tracing(e.to_string()))
}

/// Filter from `from_env` when it is set and non-blank, else from `default_filter`.
fn build_filter(from_env: Option<String>, default_filter: &str) -> Result<EnvFilter> {
    let directives = from_env
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default_filter.to_owned());
    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Tracing(format!("invalid log filter {directives:?}: {e}")))
}

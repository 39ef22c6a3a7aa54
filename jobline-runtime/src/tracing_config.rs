//! Structured logging setup for processes embedding the Jobline runtime.
//!
//! # Configuration
//!
//! ```bash
//! # Output format: json (default) or pretty
//! export JOBLINE_LOG_FORMAT=pretty
//!
//! # Standard tracing filter directives
//! export RUST_LOG=jobline_runtime=debug,jobline_storage=info
//! ```

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "jobline_runtime=info,jobline_storage=info";

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Configuration for log output.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Output format
    pub format: LogFormat,
    /// Filter directives used when `RUST_LOG` is not set
    pub default_filter: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::from_environment()
    }
}

impl TracingConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `JOBLINE_LOG_FORMAT`: `json` or `pretty` (default: json; unknown values fall back to json)
    pub fn from_environment() -> Self {
        let format = match std::env::var("JOBLINE_LOG_FORMAT") {
            Ok(v) if v.trim().eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            Ok(v) if !v.trim().eq_ignore_ascii_case("json") => {
                eprintln!("Warning: JOBLINE_LOG_FORMAT={} is not recognised, using json", v);
                LogFormat::Json
            }
            _ => LogFormat::Json,
        };

        Self {
            format,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| config.default_filter.as_str().into());

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?,
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?,
    }

    tracing::info!(format = ?config.format, "Tracing initialized");
    Ok(())
}

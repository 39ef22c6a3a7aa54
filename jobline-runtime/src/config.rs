//! Runtime configuration
//!
//! Two layers:
//! - [`RuntimeConfig`]: process-wide defaults loaded from the environment once
//!   at startup
//! - [`JobOptions`]: per-execution settings resolved from job parameters and
//!   job properties (parameters win)

use anyhow::{anyhow, Context};
use jobline_core::property_key;
use jobline_core::Properties;
use std::env;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_ITEM_COUNT: usize = 10;
pub const DEFAULT_MAX_PARTITION_THREADS: usize = 64;
pub const DEFAULT_PAYLOAD_CODEC: &str = "json";

/// Process-wide runtime defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Items per checkpoint for chunk steps that do not set one
    pub default_item_count: usize,

    /// Upper bound on concurrent partitions of one step
    pub max_partition_threads: usize,

    /// Name of the serialization provider the checkpoint codec should use
    pub payload_codec: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_item_count: DEFAULT_ITEM_COUNT,
            max_partition_threads: DEFAULT_MAX_PARTITION_THREADS,
            payload_codec: DEFAULT_PAYLOAD_CODEC.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `JOBLINE_DEFAULT_ITEM_COUNT`: Items per checkpoint (default: 10)
    /// - `JOBLINE_MAX_PARTITION_THREADS`: Concurrent partitions cap (default: 64)
    /// - `JOBLINE_PAYLOAD_CODEC`: Serialization provider name (default: json)
    pub fn from_env() -> anyhow::Result<Self> {
        let default_item_count = match env::var("JOBLINE_DEFAULT_ITEM_COUNT") {
            Ok(v) => v
                .parse()
                .context("JOBLINE_DEFAULT_ITEM_COUNT must be a positive integer")?,
            Err(_) => DEFAULT_ITEM_COUNT,
        };

        let max_partition_threads = match env::var("JOBLINE_MAX_PARTITION_THREADS") {
            Ok(v) => v
                .parse()
                .context("JOBLINE_MAX_PARTITION_THREADS must be a positive integer")?,
            Err(_) => DEFAULT_MAX_PARTITION_THREADS,
        };

        let payload_codec =
            env::var("JOBLINE_PAYLOAD_CODEC").unwrap_or_else(|_| DEFAULT_PAYLOAD_CODEC.to_string());

        let config = Self {
            default_item_count,
            max_partition_threads,
            payload_codec,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_item_count == 0 {
            return Err(anyhow!("default_item_count must be positive"));
        }
        if self.max_partition_threads == 0 {
            return Err(anyhow!("max_partition_threads must be positive"));
        }
        if self.payload_codec.trim().is_empty() {
            return Err(anyhow!("payload_codec cannot be empty"));
        }
        Ok(())
    }
}

/// How a restart treats a prior execution that still looks in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartMode {
    /// Refuse to restart in-flight executions
    Strict,

    /// Mark the prior execution FAILED and restart it
    Force,

    /// Restart only if the prior execution is not running in this process
    #[default]
    Detect,
}

impl RestartMode {
    pub fn parse(value: &str) -> crate::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            property_key::RESTART_MODE_STRICT => Ok(RestartMode::Strict),
            property_key::RESTART_MODE_FORCE => Ok(RestartMode::Force),
            property_key::RESTART_MODE_DETECT => Ok(RestartMode::Detect),
            other => Err(crate::Error::Restart(format!(
                "unknown {} value: {}",
                property_key::RESTART_MODE,
                other
            ))),
        }
    }
}

/// Settings of one job execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub restart_mode: RestartMode,
    pub split_timeout: Option<Duration>,
    pub partition_timeout: Option<Duration>,

    /// Advisory, passed through for collaborators
    pub local_tx: bool,

    /// Advisory, passed through for collaborators
    pub analyzer_tx_disabled: bool,

    pub restart_position: Option<String>,
    pub loop_allowed: bool,
}

impl JobOptions {
    /// Resolve options; a job parameter wins over a job property of the same key
    pub fn resolve(parameters: &Properties, job_properties: &Properties) -> crate::Result<Self> {
        let lookup = |key: &str| {
            parameters
                .get(key)
                .or_else(|| job_properties.get(key))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let restart_mode = match lookup(property_key::RESTART_MODE) {
            Some(v) => RestartMode::parse(v)?,
            None => RestartMode::default(),
        };

        Ok(Self {
            restart_mode,
            split_timeout: parse_timeout(property_key::SPLIT_TIMEOUT_SECONDS, lookup(property_key::SPLIT_TIMEOUT_SECONDS))?,
            partition_timeout: parse_timeout(
                property_key::PARTITION_TIMEOUT_SECONDS,
                lookup(property_key::PARTITION_TIMEOUT_SECONDS),
            )?,
            local_tx: parse_flag(property_key::LOCAL_TX, lookup(property_key::LOCAL_TX)),
            analyzer_tx_disabled: parse_flag(
                property_key::ANALYZER_TX_DISABLED,
                lookup(property_key::ANALYZER_TX_DISABLED),
            ),
            restart_position: lookup(property_key::RESTART_POSITION).map(str::to_string),
            loop_allowed: parse_flag(property_key::LOOP_ALLOWED, lookup(property_key::LOOP_ALLOWED)),
        })
    }
}

fn parse_timeout(key: &str, value: Option<&str>) -> crate::Result<Option<Duration>> {
    let Some(value) = value else {
        return Ok(None);
    };
    match value.parse::<u64>() {
        Ok(seconds) if seconds > 0 => Ok(Some(Duration::from_secs(seconds))),
        _ => Err(crate::Error::Execution(format!(
            "{} must be a positive integer, got {}",
            key, value
        ))),
    }
}

fn parse_flag(key: &str, value: Option<&str>) -> bool {
    match value {
        None => false,
        Some(v) if v.eq_ignore_ascii_case("true") => true,
        Some(v) if v.eq_ignore_ascii_case("false") => false,
        Some(v) => {
            warn!(key = %key, value = %v, "Ignoring non-boolean flag value");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let options = JobOptions::resolve(&Properties::new(), &Properties::new()).unwrap();
        assert_eq!(options.restart_mode, RestartMode::Detect);
        assert_eq!(options.split_timeout, None);
        assert!(!options.loop_allowed);
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parameter_wins_over_job_property() {
        let parameters = props(&[(property_key::SPLIT_TIMEOUT_SECONDS, "5")]);
        let job_properties = props(&[
            (property_key::SPLIT_TIMEOUT_SECONDS, "60"),
            (property_key::PARTITION_TIMEOUT_SECONDS, "30"),
        ]);

        let options = JobOptions::resolve(&parameters, &job_properties).unwrap();
        assert_eq!(options.split_timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.partition_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_timeout_must_be_positive() {
        for bad in ["0", "-3", "soon"] {
            let parameters = props(&[(property_key::SPLIT_TIMEOUT_SECONDS, bad)]);
            assert!(JobOptions::resolve(&parameters, &Properties::new()).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_restart_mode_parsing() {
        assert_eq!(RestartMode::parse("STRICT").unwrap(), RestartMode::Strict);
        assert_eq!(RestartMode::parse("force").unwrap(), RestartMode::Force);
        assert!(matches!(RestartMode::parse("sometimes"), Err(crate::Error::Restart(_))));
    }

    #[test]
    fn test_flags_and_position() {
        let parameters = props(&[
            (property_key::LOOP_ALLOWED, "TRUE"),
            (property_key::LOCAL_TX, "true"),
            (property_key::ANALYZER_TX_DISABLED, "maybe"),
            (property_key::RESTART_POSITION, "step2"),
        ]);
        let options = JobOptions::resolve(&parameters, &Properties::new()).unwrap();
        assert!(options.loop_allowed);
        assert!(options.local_tx);
        assert!(!options.analyzer_tx_disabled);
        assert_eq!(options.restart_position.as_deref(), Some("step2"));
    }

    #[test]
    fn test_config_validation() {
        let config = RuntimeConfig {
            default_item_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

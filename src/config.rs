//! Process-level configuration (§10.4).
//!
//! Task descriptors (`src/descriptor.rs`) are the per-task surface and are
//! never environment-driven. `EngineConfig` covers everything that is scoped
//! to the process instead: the ambient metrics server, default timeout
//! bounds, the percentile reservoir, and the memory guard — kept in the
//! env-var-loader idiom the teacher's `Config::from_env` used, just over a
//! much smaller surface now that scenario/load-model/TLS-identity fields
//! have moved into the per-task descriptor.

use std::env;

use thiserror::Error;
use tokio::time::Duration;

use crate::memory_guard::MemoryGuardConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
    #[error("{var} must be > 0")]
    MustBePositive { var: &'static str },
}

/// Process-wide settings, loaded once at startup and shared read-only by
/// every task the process runs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bind address for the ambient Prometheus metrics endpoint (§10.3).
    pub metrics_bind_addr: String,
    pub metrics_port: u16,
    pub metrics_namespace: String,
    /// Used when a descriptor doesn't set `timeouts.connect_timeout_s`.
    pub default_connect_timeout: Duration,
    /// Hard ceiling applied to a descriptor's resolved read timeout.
    pub max_read_timeout: Duration,
    /// Per-stage percentile histogram cap before rotation is considered
    /// "approaching capacity" (mirrors the per-path LRU warning threshold).
    pub percentile_reservoir_cap: usize,
    pub percentile_rotation_interval: Duration,
    pub memory_guard: MemoryGuardConfig,
}

fn env_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::InvalidValue {
        var: name.to_string(),
        message: "not set".to_string(),
    })
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .to_lowercase()
        == "true"
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            metrics_bind_addr: "0.0.0.0".to_string(),
            metrics_port: 9090,
            metrics_namespace: "promptload".to_string(),
            default_connect_timeout: Duration::from_secs(10),
            max_read_timeout: Duration::from_secs(600),
            percentile_reservoir_cap: 100_000,
            percentile_rotation_interval: Duration::from_secs(3600),
            memory_guard: MemoryGuardConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads process configuration from the environment, falling back to
    /// defaults for anything not set. Unlike a `TaskDescriptor`, nothing
    /// here is required — an operator running with no env vars set at all
    /// gets sane behavior.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let metrics_bind_addr =
            env::var("METRICS_BIND_ADDR").unwrap_or(defaults.metrics_bind_addr);
        let metrics_port: u16 = env_parse_or("METRICS_PORT", defaults.metrics_port)?;
        let metrics_namespace =
            env::var("METRIC_NAMESPACE").unwrap_or(defaults.metrics_namespace);

        let default_connect_timeout_s: u64 = env_parse_or(
            "DEFAULT_CONNECT_TIMEOUT_S",
            defaults.default_connect_timeout.as_secs(),
        )?;
        let max_read_timeout_s: u64 =
            env_parse_or("MAX_READ_TIMEOUT_S", defaults.max_read_timeout.as_secs())?;
        let percentile_reservoir_cap: usize = env_parse_or(
            "PERCENTILE_RESERVOIR_CAP",
            defaults.percentile_reservoir_cap,
        )?;
        let percentile_rotation_interval_s: u64 = env_parse_or(
            "PERCENTILE_ROTATION_INTERVAL_S",
            defaults.percentile_rotation_interval.as_secs(),
        )?;

        let memory_guard = MemoryGuardConfig {
            warning_threshold_percent: env_parse_or(
                "MEMORY_WARNING_THRESHOLD_PERCENT",
                defaults.memory_guard.warning_threshold_percent,
            )?,
            critical_threshold_percent: env_parse_or(
                "MEMORY_CRITICAL_THRESHOLD_PERCENT",
                defaults.memory_guard.critical_threshold_percent,
            )?,
            auto_disable_on_warning: env_bool(
                "MEMORY_AUTO_DISABLE_ON_WARNING",
                defaults.memory_guard.auto_disable_on_warning,
            ),
            check_interval: Duration::from_secs(env_parse_or(
                "MEMORY_CHECK_INTERVAL_S",
                defaults.memory_guard.check_interval.as_secs(),
            )?),
        };

        let config = Self {
            metrics_bind_addr,
            metrics_port,
            metrics_namespace,
            default_connect_timeout: Duration::from_secs(default_connect_timeout_s),
            max_read_timeout: Duration::from_secs(max_read_timeout_s),
            percentile_reservoir_cap,
            percentile_rotation_interval: Duration::from_secs(percentile_rotation_interval_s),
            memory_guard,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics_port == 0 {
            return Err(ConfigError::MustBePositive { var: "METRICS_PORT" });
        }
        if self.default_connect_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                var: "DEFAULT_CONNECT_TIMEOUT_S",
            });
        }
        if self.max_read_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                var: "MAX_READ_TIMEOUT_S",
            });
        }
        if self.percentile_reservoir_cap == 0 {
            return Err(ConfigError::MustBePositive {
                var: "PERCENTILE_RESERVOIR_CAP",
            });
        }
        if self.memory_guard.warning_threshold_percent >= self.memory_guard.critical_threshold_percent {
            return Err(ConfigError::InvalidValue {
                var: "MEMORY_WARNING_THRESHOLD_PERCENT".to_string(),
                message: "must be less than the critical threshold".to_string(),
            });
        }
        Ok(())
    }

    /// Bypasses the environment entirely; used by unit/integration tests
    /// that need a config but shouldn't depend on ambient env vars.
    pub fn for_testing() -> Self {
        Self {
            metrics_port: 0,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_metrics_port_is_rejected() {
        let mut config = EngineConfig::default();
        config.metrics_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn warning_threshold_must_be_below_critical() {
        let mut config = EngineConfig::default();
        config.memory_guard.warning_threshold_percent = 95.0;
        config.memory_guard.critical_threshold_percent = 90.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn for_testing_bypasses_env_and_validates_separately() {
        let config = EngineConfig::for_testing();
        assert_eq!(config.metrics_port, 0);
    }
}

//! Looper configuration.
//!
//! [`LooperConfig`] holds the knobs that drive iteration pacing and
//! overload detection. In most cases you should go through
//! [`LooperBuilder`](crate::looper::LooperBuilder) rather than creating a
//! config directly.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `warn_on_overload` | `true` |
//! | `overload_threshold_ms` | 100 |
//! | `overload_warning_interval_ms` | 15 000 |
//! | `overload_yield_interval_ms` | 1 000 |
//! | `iteration_floor_ms` | 50 |
//! | `thread_name_prefix` | `"runloop"` |
//!
//! # Environment Variables
//!
//! Settings may also come from `RUNLOOP_*` environment variables via
//! [`apply_env_overrides`]; a set-but-unparseable variable is an error
//! rather than a silent fallback.
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `RUNLOOP_WARN_ON_OVERLOAD` | `bool` | `warn_on_overload` |
//! | `RUNLOOP_OVERLOAD_THRESHOLD_MS` | `u64` | `overload_threshold_ms` |
//! | `RUNLOOP_ITERATION_FLOOR_MS` | `u64` | `iteration_floor_ms` |
//! | `RUNLOOP_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |

use thiserror::Error;

/// Environment variable name for the overload warning toggle.
pub const ENV_WARN_ON_OVERLOAD: &str = "RUNLOOP_WARN_ON_OVERLOAD";
/// Environment variable name for the overload threshold.
pub const ENV_OVERLOAD_THRESHOLD_MS: &str = "RUNLOOP_OVERLOAD_THRESHOLD_MS";
/// Environment variable name for the iteration floor.
pub const ENV_ITERATION_FLOOR_MS: &str = "RUNLOOP_ITERATION_FLOOR_MS";
/// Environment variable name for the async thread-name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "RUNLOOP_THREAD_NAME_PREFIX";

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable was set to a value that does not parse.
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        /// The variable name.
        var: &'static str,
        /// The raw value found in the environment.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Configuration for a [`Looper`](crate::looper::Looper).
#[derive(Debug, Clone)]
pub struct LooperConfig {
    /// Emit a "can't keep up" warning while overloaded.
    pub warn_on_overload: bool,
    /// Smoothed iteration time above which the looper counts as overloaded.
    pub overload_threshold_ms: u64,
    /// Minimum interval between overload warnings.
    pub overload_warning_interval_ms: u64,
    /// Minimum interval between forced overload yields.
    pub overload_yield_interval_ms: u64,
    /// Iterations shorter than this sleep the remainder to yield CPU.
    pub iteration_floor_ms: u64,
    /// Name prefix for executor threads spawned on this looper's behalf.
    pub thread_name_prefix: String,
}

impl LooperConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.overload_threshold_ms == 0 {
            self.overload_threshold_ms = 100;
        }
        if self.overload_warning_interval_ms == 0 {
            self.overload_warning_interval_ms = 15_000;
        }
        if self.overload_yield_interval_ms == 0 {
            self.overload_yield_interval_ms = 1_000;
        }
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = "runloop".to_string();
        }
    }
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            warn_on_overload: true,
            overload_threshold_ms: 100,
            overload_warning_interval_ms: 15_000,
            overload_yield_interval_ms: 1_000,
            iteration_floor_ms: 50,
            thread_name_prefix: "runloop".to_string(),
        }
    }
}

/// Apply `RUNLOOP_*` environment overrides to a [`LooperConfig`].
///
/// Only variables that are set are applied. Returns an error if a
/// variable is set but unparseable.
pub fn apply_env_overrides(config: &mut LooperConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_WARN_ON_OVERLOAD) {
        config.warn_on_overload = parse_bool(ENV_WARN_ON_OVERLOAD, &val)?;
    }
    if let Some(val) = read_env(ENV_OVERLOAD_THRESHOLD_MS) {
        config.overload_threshold_ms = parse_u64(ENV_OVERLOAD_THRESHOLD_MS, &val)?;
    }
    if let Some(val) = read_env(ENV_ITERATION_FLOOR_MS) {
        config.iteration_floor_ms = parse_u64(ENV_ITERATION_FLOOR_MS, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.thread_name_prefix = val;
    }
    Ok(())
}

fn read_env(var: &'static str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn parse_u64(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|e| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason: format!("{e}"),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        let config = LooperConfig::default();
        assert!(config.warn_on_overload);
        assert_eq!(config.overload_threshold_ms, 100);
        assert_eq!(config.overload_warning_interval_ms, 15_000);
        assert_eq!(config.overload_yield_interval_ms, 1_000);
        assert_eq!(config.iteration_floor_ms, 50);
        assert_eq!(config.thread_name_prefix, "runloop");
    }

    #[test]
    fn normalize_restores_zeroed_fields() {
        let mut config = LooperConfig {
            overload_threshold_ms: 0,
            overload_warning_interval_ms: 0,
            overload_yield_interval_ms: 0,
            thread_name_prefix: String::new(),
            ..LooperConfig::default()
        };
        config.normalize();
        assert_eq!(config.overload_threshold_ms, 100);
        assert_eq!(config.overload_warning_interval_ms, 15_000);
        assert_eq!(config.overload_yield_interval_ms, 1_000);
        assert_eq!(config.thread_name_prefix, "runloop");
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool(ENV_WARN_ON_OVERLOAD, "TRUE").unwrap());
        assert!(!parse_bool(ENV_WARN_ON_OVERLOAD, "off").unwrap());
        assert!(parse_bool(ENV_WARN_ON_OVERLOAD, "maybe").is_err());
    }

    #[test]
    fn u64_parsing_rejects_garbage() {
        assert_eq!(parse_u64(ENV_OVERLOAD_THRESHOLD_MS, "250").unwrap(), 250);
        assert!(parse_u64(ENV_OVERLOAD_THRESHOLD_MS, "fast").is_err());
    }
}

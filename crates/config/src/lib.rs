//! Configuration management for the experimentation engine

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Upper bound for scheduler interval and tick budget (30 days)
pub const MAX_SCHEDULER_SECS: u64 = 30 * 24 * 60 * 60;

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Background sweep settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Defaults applied to experiments created without explicit settings
    #[serde(default)]
    pub defaults: ExperimentDefaults,

    /// Significance evaluation settings
    #[serde(default)]
    pub significance: SignificanceConfig,

    /// Observability settings
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl EngineConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        // Override with environment variables (prefixed with EXPERIMENT_)
        figment = figment.merge(Env::prefixed("EXPERIMENT_").split("__"));

        let config: EngineConfig = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_SCHEDULER_SECS).contains(&self.scheduler.interval_secs) {
            return Err(ConfigError::ValidationError(format!(
                "Scheduler interval must be within 1-{} seconds, got {}",
                MAX_SCHEDULER_SECS, self.scheduler.interval_secs
            )));
        }

        if !(1..=MAX_SCHEDULER_SECS).contains(&self.scheduler.tick_budget_secs) {
            return Err(ConfigError::ValidationError(format!(
                "Scheduler tick budget must be within 1-{} seconds, got {}",
                MAX_SCHEDULER_SECS, self.scheduler.tick_budget_secs
            )));
        }

        if self.defaults.min_sample_size == 0 {
            return Err(ConfigError::ValidationError(
                "Default min_sample_size must be at least 1".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.defaults.min_confidence) {
            return Err(ConfigError::ValidationError(format!(
                "Default min_confidence must be within 0-100, got {}",
                self.defaults.min_confidence
            )));
        }

        if self.defaults.max_duration_days == 0 {
            return Err(ConfigError::ValidationError(
                "Default max_duration_days must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Background scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Whether the periodic sweep runs at all
    pub enabled: bool,

    /// Seconds between sweeps
    pub interval_secs: u64,

    /// Seconds a single sweep may run before remaining experiments are deferred
    pub tick_budget_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600, // hourly
            tick_budget_secs: 300,
        }
    }
}

/// Defaults for new experiments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentDefaults {
    pub min_sample_size: u64,
    pub min_confidence: f64,
    pub max_duration_days: u32,
}

impl Default for ExperimentDefaults {
    fn default() -> Self {
        Self {
            min_sample_size: 100,
            min_confidence: 95.0,
            max_duration_days: 30,
        }
    }
}

/// How a winner is picked when several variations clear the confidence bar
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WinnerPolicy {
    /// First significant variation in declared order
    #[default]
    FirstSignificant,
    /// Most significant variation; ties go to declared order
    HighestConfidence,
}

/// Significance evaluation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignificanceConfig {
    pub winner_policy: WinnerPolicy,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,

    /// Enable structured JSON logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.scheduler.interval_secs, 3600);
        assert_eq!(config.defaults.min_sample_size, 100);
        assert_eq!(config.significance.winner_policy, WinnerPolicy::FirstSignificant);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.scheduler.interval_secs = 0;
        assert!(config.validate().is_err());

        config.scheduler.interval_secs = 60;
        config.defaults.min_sample_size = 0;
        assert!(config.validate().is_err());

        config.defaults.min_sample_size = 100;
        config.defaults.min_confidence = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "engine.yaml",
                r#"
scheduler:
  enabled: true
  interval_secs: 60
  tick_budget_secs: 30
significance:
  winner_policy: highest_confidence
"#,
            )?;
            jail.set_env("EXPERIMENT_OBSERVABILITY__LOG_LEVEL", "debug");

            let config = EngineConfig::load(Some(PathBuf::from("engine.yaml")))
                .expect("config should load");

            assert_eq!(config.scheduler.interval_secs, 60);
            assert_eq!(config.scheduler.tick_budget_secs, 30);
            assert_eq!(config.significance.winner_policy, WinnerPolicy::HighestConfidence);
            assert_eq!(config.observability.log_level, "debug");
            // Untouched sections keep their defaults
            assert_eq!(config.defaults.min_confidence, 95.0);
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        Jail::expect_with(|jail| {
            jail.set_env("EXPERIMENT_SCHEDULER__INTERVAL_SECS", "0");
            assert!(EngineConfig::load(None).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_oversized_scheduler_durations() {
        Jail::expect_with(|jail| {
            jail.set_env(
                "EXPERIMENT_SCHEDULER__TICK_BUDGET_SECS",
                "18446744073709551615",
            );
            let err = EngineConfig::load(None).unwrap_err();
            assert!(matches!(err, ConfigError::ValidationError(_)));

            jail.set_env("EXPERIMENT_SCHEDULER__TICK_BUDGET_SECS", "300");
            jail.set_env(
                "EXPERIMENT_SCHEDULER__INTERVAL_SECS",
                (MAX_SCHEDULER_SECS + 1).to_string(),
            );
            assert!(EngineConfig::load(None).is_err());

            jail.set_env(
                "EXPERIMENT_SCHEDULER__INTERVAL_SECS",
                MAX_SCHEDULER_SECS.to_string(),
            );
            assert!(EngineConfig::load(None).is_ok());
            Ok(())
        });
    }
}

//! Runtime configuration.
//!
//! One [`Config`] is constructed at process start (from defaults or the
//! `CRAWLQ_*` environment) and passed into every component constructor.
//! There is deliberately no cached global: tests get a fresh value per case
//! instead of mutating shared state.

use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Tunables for the queue, scheduler, maintenance loop, and fetch engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum fetch attempts per logical outbound call.
    pub max_attempts: u32,
    /// Base delay of the linear between-attempt backoff, in milliseconds.
    pub base_delay_ms: u64,
    /// Per-call HTTP timeout, in seconds.
    pub timeout_secs: u64,
    /// Age at which a previously successful crawl is considered stale and
    /// requeued, in days.
    pub stale_days: i64,
    /// Age at which an in-flight crawl with no progress is presumed orphaned
    /// and reset, in minutes.
    pub reset_after_minutes: i64,
    /// Scheduler tick, in seconds.
    pub tick_secs: u64,
    /// Interval between maintenance sweeps, in seconds.
    pub maintenance_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 300,
            timeout_secs: 15,
            stale_days: 30,
            reset_after_minutes: 15,
            tick_secs: 60,
            maintenance_secs: 300,
        }
    }
}

impl Config {
    /// Builds a config from defaults overridden by any `CRAWLQ_*` variables
    /// present in the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        read_env("CRAWLQ_MAX_ATTEMPTS", &mut config.max_attempts)?;
        read_env("CRAWLQ_BASE_DELAY_MS", &mut config.base_delay_ms)?;
        read_env("CRAWLQ_TIMEOUT_SECS", &mut config.timeout_secs)?;
        read_env("CRAWLQ_STALE_DAYS", &mut config.stale_days)?;
        read_env("CRAWLQ_RESET_AFTER_MINUTES", &mut config.reset_after_minutes)?;
        read_env("CRAWLQ_TICK_SECS", &mut config.tick_secs)?;
        read_env("CRAWLQ_MAINTENANCE_SECS", &mut config.maintenance_secs)?;
        Ok(config)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stale_after(&self) -> TimeDelta {
        TimeDelta::days(self.stale_days)
    }

    pub fn reset_after(&self) -> TimeDelta {
        TimeDelta::minutes(self.reset_after_minutes)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_secs)
    }
}

fn read_env<T: std::str::FromStr>(key: &'static str, slot: &mut T) -> Result<(), ConfigError> {
    match std::env::var(key) {
        Ok(raw) => {
            *slot = raw
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value: raw })?;
            Ok(())
        }
        Err(std::env::VarError::NotPresent) => Ok(()),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::Invalid {
            key,
            value: "<non-unicode>".to_owned(),
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Mutex;

    // The environment is process-global and the test binary is concurrent:
    // every test that touches CRAWLQ_* variables must hold this lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay(), Duration::from_millis(300));
        assert_eq!(config.timeout(), Duration::from_secs(15));
        assert_eq!(config.stale_after(), TimeDelta::days(30));
        assert_eq!(config.reset_after(), TimeDelta::minutes(15));
        assert_eq!(config.tick(), Duration::from_secs(60));
    }

    #[test]
    fn env_overrides_apply() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
        std::env::set_var("CRAWLQ_MAX_ATTEMPTS", "5");
        let config = Config::from_env().unwrap();
        std::env::remove_var("CRAWLQ_MAX_ATTEMPTS");
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 300, "untouched settings keep defaults");
    }

    #[test]
    fn malformed_env_values_are_rejected() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
        std::env::set_var("CRAWLQ_STALE_DAYS", "a month");
        let result = Config::from_env();
        std::env::remove_var("CRAWLQ_STALE_DAYS");
        assert_matches!(result, Err(ConfigError::Invalid { key, .. }) if key == "CRAWLQ_STALE_DAYS");
    }
}

//! Configuration structures.
//!
//! Configuration is loaded from a JSON file and selected environment variables.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{self, Error};

/// Environment override for the sweep interval (humantime, e.g. `30s`).
pub const ENV_SWEEP_INTERVAL: &str = "RESTRAINT_SWEEP_INTERVAL";
/// Environment override for the sweep shard (`index/count`, e.g. `1/4`).
pub const ENV_SWEEP_SHARD: &str = "RESTRAINT_SWEEP_SHARD";

/// Global restraint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
pub struct Config {
    /// Coordinator behaviour.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Reconciliation sweep.
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Record retention.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Constraints registered at start-up.
    #[serde(default)]
    pub constraints: Vec<ConstraintDefinition>,
}

impl Config {
    /// Load configuration from a JSON file and apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> errors::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = serde_json::from_str(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RESTRAINT_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> errors::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> errors::Result<()> {
        if let Some(raw) = lookup(ENV_SWEEP_INTERVAL) {
            self.sweeper.interval = humantime_serde::re::humantime::parse_duration(&raw)
                .map_err(|e| Error::validation(format!("{ENV_SWEEP_INTERVAL}={raw}: {e}")))?;
        }
        if let Some(raw) = lookup(ENV_SWEEP_SHARD) {
            self.sweeper.shard = ShardConfig::parse(&raw)?;
        }
        Ok(())
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> errors::Result<()> {
        if self.sweeper.interval.is_zero() {
            return Err(Error::validation("sweeper.interval must be non-zero"));
        }
        if self.sweeper.batch_size == 0 {
            return Err(Error::validation("sweeper.batch_size must be non-zero"));
        }
        if self.sweeper.liveness_timeout.is_zero() {
            return Err(Error::validation(
                "sweeper.liveness_timeout must be non-zero",
            ));
        }
        if self.sweeper.shard.count == 0 || self.sweeper.shard.index >= self.sweeper.shard.count {
            return Err(Error::validation(format!(
                "sweeper.shard {}/{} is out of range",
                self.sweeper.shard.index, self.sweeper.shard.count
            )));
        }
        if self.coordinator.retry.max_attempts == 0 {
            return Err(Error::validation(
                "coordinator.retry.max_attempts must be at least 1",
            ));
        }
        for def in &self.constraints {
            if def.capacity == 0 {
                return Err(Error::validation(format!(
                    "constraint {} must have capacity >= 1",
                    def.id
                )));
            }
        }
        Ok(())
    }

    /// JSON schema of the configuration file, for admin tooling.
    pub fn json_schema() -> serde_json::Value {
        let schema = schemars::schema_for!(Config);
        serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
pub struct CoordinatorConfig {
    /// Optimistic-concurrency retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Bounded exponential backoff for version conflicts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryConfig {
    /// Attempts before a conflict surfaces to the caller.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub base_backoff: Duration,

    /// Upper bound for a single delay.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

/// Reconciliation sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SweeperConfig {
    /// Time between passes. A swept instance becomes due again half an
    /// interval later, so the next tick always picks it up.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub interval: Duration,

    /// Maximum instances claimed per pass.
    pub batch_size: usize,

    /// Passes running longer than this are abandoned and logged.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub max_pass_duration: Duration,

    /// Limit on one holding-scope liveness query. A query that runs over
    /// counts as a failure for that instance.
    #[serde(with = "humantime_serde", default = "default_liveness_timeout")]
    #[schemars(with = "String")]
    pub liveness_timeout: Duration,

    /// Which slice of the groups this process sweeps.
    #[serde(default)]
    pub shard: ShardConfig,

    /// Re-publish wake-ups for ACTIVE instances whose holder is live, so a
    /// lost notification cannot strand a suspended node. Engines must treat
    /// wake-ups as at-least-once.
    #[serde(default = "default_true")]
    pub republish_active_wakeups: bool,
}

fn default_true() -> bool {
    true
}

fn default_liveness_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 500,
            max_pass_duration: Duration::from_secs(30),
            liveness_timeout: default_liveness_timeout(),
            shard: ShardConfig::default(),
            republish_active_wakeups: true,
        }
    }
}

/// Shard selection: groups whose key hashes to `index` modulo `count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ShardConfig {
    pub index: u32,
    pub count: u32,
}

impl ShardConfig {
    /// Parse `index/count`.
    pub fn parse(raw: &str) -> errors::Result<Self> {
        let invalid = || Error::validation(format!("invalid shard '{raw}', expected index/count"));
        let (index, count) = raw.split_once('/').ok_or_else(invalid)?;
        let index = index.trim().parse().map_err(|_| invalid())?;
        let count = count.trim().parse().map_err(|_| invalid())?;
        Ok(Self { index, count })
    }
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self { index: 0, count: 1 }
    }
}

/// Retention of instance records.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetentionConfig {
    /// How long FINISHED/REJECTED instances are kept for audit.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub terminal_retention: Duration,

    /// Safety expiry stamped on every instance (`valid_until`).
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub instance_ttl: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            terminal_retention: Duration::from_secs(3600),
            instance_ttl: Duration::from_secs(180 * 24 * 3600),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Constraint seeded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConstraintDefinition {
    pub id: String,
    pub name: String,
    pub capacity: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sweeper.interval, Duration::from_secs(30));
        assert_eq!(config.sweeper.shard, ShardConfig { index: 0, count: 1 });
        assert_eq!(config.coordinator.retry.max_attempts, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "sweeper": {{ "interval": "5s", "batch_size": 10, "max_pass_duration": "2s" }},
                "constraints": [{{ "id": "env-A", "name": "Env A", "capacity": 2 }}]
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.sweeper.interval, Duration::from_secs(5));
        assert_eq!(config.sweeper.batch_size, 10);
        assert_eq!(config.sweeper.liveness_timeout, Duration::from_secs(5));
        assert_eq!(config.constraints.len(), 1);
        assert_eq!(config.constraints[0].capacity, 2);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> =
            HashMap::from([(ENV_SWEEP_INTERVAL, "1m"), (ENV_SWEEP_SHARD, "2/3")]);
        let mut config = Config::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.sweeper.interval, Duration::from_secs(60));
        assert_eq!(config.sweeper.shard, ShardConfig { index: 2, count: 3 });
    }

    #[test]
    fn test_validate_rejects_bad_shard() {
        let mut config = Config::default();
        config.sweeper.shard = ShardConfig { index: 3, count: 3 };
        assert!(config.validate().is_err());
        assert!(ShardConfig::parse("nope").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_liveness_timeout() {
        let mut config = Config::default();
        config.sweeper.liveness_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.constraints.push(ConstraintDefinition {
            id: "c".into(),
            name: "c".into(),
            capacity: 0,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_schema_lists_sections() {
        let schema = Config::json_schema();
        let props = &schema["properties"];
        assert!(props.get("sweeper").is_some());
        assert!(props.get("constraints").is_some());
    }
}

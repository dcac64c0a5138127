//! File-loadable configuration.
//!
//! `OrchestratorConfig` mirrors the runtime types (`PoolConfig`,
//! `TimeoutPolicy`, `SessionPolicy`) with plain millisecond fields so it can
//! be written by hand as JSON. Missing fields take their defaults.

use crate::core::{Result, SheetError};
use crate::executor::{CategoryTimeout, OperationCategory, TimeoutPolicy};
use crate::pool::PoolConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How long sessions may sit idle before the reaper closes them.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Sessions untouched for this long are reaped; `None` disables reaping
    pub idle_timeout: Option<Duration>,

    /// How often the reaper runs
    pub reap_interval: Duration,

    /// Save dirty sessions before reaping them instead of discarding their edits
    pub save_on_reap: bool,
}

impl SessionPolicy {
    pub fn new() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(30 * 60)),
            reap_interval: Duration::from_secs(30),
            save_on_reap: false,
        }
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn no_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn save_on_reap(mut self, save: bool) -> Self {
        self.save_on_reap = save;
        self
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Timeout pair for one operation category, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryTimeoutConfig {
    pub default_ms: u64,
    pub max_ms: u64,
}

impl From<CategoryTimeout> for CategoryTimeoutConfig {
    fn from(limits: CategoryTimeout) -> Self {
        Self {
            default_ms: limits.default.as_millis() as u64,
            max_ms: limits.max.as_millis() as u64,
        }
    }
}

impl From<CategoryTimeoutConfig> for CategoryTimeout {
    fn from(config: CategoryTimeoutConfig) -> Self {
        CategoryTimeout::new(
            Duration::from_millis(config.default_ms),
            Duration::from_millis(config.max_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_size: usize,
    pub min_handles: usize,
    pub acquire_timeout_ms: u64,
    pub spawn_timeout_ms: u64,
    pub open_timeout_ms: u64,
    /// `null` keeps idle handles forever.
    pub idle_timeout_ms: Option<u64>,
    pub max_uses: Option<u64>,
    pub shutdown_grace_ms: u64,
    pub terminate_faulted: bool,
}

impl Default for PoolSection {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            max_size: pool.max_size,
            min_handles: pool.min_handles,
            acquire_timeout_ms: pool.acquire_timeout.as_millis() as u64,
            spawn_timeout_ms: pool.spawn_timeout.as_millis() as u64,
            open_timeout_ms: pool.open_timeout.as_millis() as u64,
            idle_timeout_ms: pool.idle_timeout.map(|d| d.as_millis() as u64),
            max_uses: pool.max_uses,
            shutdown_grace_ms: pool.shutdown_grace.as_millis() as u64,
            terminate_faulted: pool.terminate_faulted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub metadata: CategoryTimeoutConfig,
    pub read: CategoryTimeoutConfig,
    pub write: CategoryTimeoutConfig,
    pub refresh: CategoryTimeoutConfig,
    pub save_timeout_ms: u64,
    pub terminate_on_timeout: bool,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        let policy = TimeoutPolicy::default();
        Self {
            metadata: policy.metadata.into(),
            read: policy.read.into(),
            write: policy.write.into(),
            refresh: policy.refresh.into(),
            save_timeout_ms: policy.save_timeout.as_millis() as u64,
            terminate_on_timeout: policy.terminate_on_timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// `null` disables session reaping.
    pub idle_timeout_ms: Option<u64>,
    pub reap_interval_ms: u64,
    pub save_on_reap: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        let policy = SessionPolicy::default();
        Self {
            idle_timeout_ms: policy.idle_timeout.map(|d| d.as_millis() as u64),
            reap_interval_ms: policy.reap_interval.as_millis() as u64,
            save_on_reap: policy.save_on_reap,
        }
    }
}

/// Whole-orchestrator configuration as read from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub pool: PoolSection,
    pub timeouts: TimeoutSection,
    pub sessions: SessionSection,
}

impl OrchestratorConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| SheetError::Config(format!("invalid configuration: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            SheetError::Config(format!("cannot read '{}': {}", path.display(), err))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool_config().validate().map_err(SheetError::Config)?;
        self.timeout_policy()
            .validate()
            .map_err(SheetError::Config)?;
        if self.sessions.reap_interval_ms == 0 {
            return Err(SheetError::Config("reap_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        let section = &self.pool;
        let mut config = PoolConfig::new()
            .max_size(section.max_size)
            .min_handles(section.min_handles)
            .acquire_timeout(Duration::from_millis(section.acquire_timeout_ms))
            .spawn_timeout(Duration::from_millis(section.spawn_timeout_ms))
            .open_timeout(Duration::from_millis(section.open_timeout_ms))
            .shutdown_grace(Duration::from_millis(section.shutdown_grace_ms))
            .terminate_faulted(section.terminate_faulted);
        config = match section.idle_timeout_ms {
            Some(ms) => config.idle_timeout(Duration::from_millis(ms)),
            None => config.no_idle_timeout(),
        };
        config.max_uses = section.max_uses;
        config
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        let section = &self.timeouts;
        TimeoutPolicy::new()
            .category(OperationCategory::Metadata, section.metadata.into())
            .category(OperationCategory::Read, section.read.into())
            .category(OperationCategory::Write, section.write.into())
            .category(OperationCategory::Refresh, section.refresh.into())
            .save_timeout(Duration::from_millis(section.save_timeout_ms))
            .terminate_on_timeout(section.terminate_on_timeout)
    }

    pub fn session_policy(&self) -> SessionPolicy {
        let section = &self.sessions;
        let policy = SessionPolicy::new()
            .reap_interval(Duration::from_millis(section.reap_interval_ms))
            .save_on_reap(section.save_on_reap);
        match section.idle_timeout_ms {
            Some(ms) => policy.idle_timeout(Duration::from_millis(ms)),
            None => policy.no_idle_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_runtime_types() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());

        let pool = config.pool_config();
        assert_eq!(pool.max_size, 4);
        assert_eq!(pool.acquire_timeout, Duration::from_secs(30));
        assert_eq!(pool.idle_timeout, Some(Duration::from_secs(600)));

        let policy = config.timeout_policy();
        assert_eq!(policy.refresh.max, Duration::from_secs(1800));
        assert_eq!(policy.save_timeout, Duration::from_secs(120));

        let sessions = config.session_policy();
        assert_eq!(sessions.idle_timeout, Some(Duration::from_secs(1800)));
        assert!(!sessions.save_on_reap);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = OrchestratorConfig::from_json_str(
            r#"{
                "pool": { "max_size": 2, "idle_timeout_ms": null },
                "timeouts": { "read": { "default_ms": 500, "max_ms": 1000 } },
                "sessions": { "save_on_reap": true }
            }"#,
        )
        .unwrap();

        let pool = config.pool_config();
        assert_eq!(pool.max_size, 2);
        assert_eq!(pool.idle_timeout, None);
        assert_eq!(pool.spawn_timeout, Duration::from_secs(60));

        let policy = config.timeout_policy();
        assert_eq!(policy.read.default, Duration::from_millis(500));
        assert_eq!(policy.write.default, Duration::from_secs(120));
        assert!(config.session_policy().save_on_reap);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = OrchestratorConfig::from_json_str(r#"{ "pool": { "max_size": 0 } }"#);
        assert!(matches!(result, Err(SheetError::Config(_))));

        let result = OrchestratorConfig::from_json_str(
            r#"{ "timeouts": { "write": { "default_ms": 9000, "max_ms": 10 } } }"#,
        );
        assert!(matches!(result, Err(SheetError::Config(_))));
    }
}

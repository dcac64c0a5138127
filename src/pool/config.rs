use std::time::Duration;

/// Engine pool configuration
///
/// Builder-style, in the spirit of a database connection-pool config.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live engine handles (idle + checked out)
    pub max_size: usize,

    /// Generic handles spawned up front by `InstancePool::initialize`
    pub min_handles: usize,

    /// How long `acquire` waits for a handle before reporting `PoolExhausted`
    pub acquire_timeout: Duration,

    /// How long spawning one engine instance may take
    pub spawn_timeout: Duration,

    /// How long opening (or closing) a file in an engine may take
    pub open_timeout: Duration,

    /// Idle handles unused for this long are shut down by the reaper
    pub idle_timeout: Option<Duration>,

    /// Recycle a handle after this many checkouts
    pub max_uses: Option<u64>,

    /// How long `dispose` waits for checked-out handles and exiting workers
    pub shutdown_grace: Duration,

    /// Fire the engine kill switch when evicting a faulted handle
    pub terminate_faulted: bool,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self {
            max_size: 4,
            min_handles: 0,
            acquire_timeout: Duration::from_secs(30),
            spawn_timeout: Duration::from_secs(60),
            open_timeout: Duration::from_secs(120),
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
            max_uses: None,
            shutdown_grace: Duration::from_secs(10),
            terminate_faulted: true,
        }
    }

    /// Set maximum pool size
    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }

    /// Set number of pre-spawned handles
    pub fn min_handles(mut self, min: usize) -> Self {
        self.min_handles = min;
        self
    }

    /// Set acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set engine spawn timeout
    pub fn spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Set file open timeout
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Keep idle handles forever
    pub fn no_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    /// Set maximum uses per handle
    pub fn max_uses(mut self, uses: u64) -> Self {
        self.max_uses = Some(uses);
        self
    }

    /// Set shutdown grace period
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn terminate_faulted(mut self, terminate: bool) -> Self {
        self.terminate_faulted = terminate;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == 0 {
            return Err("max_size must be > 0".to_string());
        }

        if self.min_handles > self.max_size {
            return Err("min_handles cannot exceed max_size".to_string());
        }

        if self.acquire_timeout.is_zero() {
            return Err("acquire_timeout must be > 0".to_string());
        }

        if self.max_uses == Some(0) {
            return Err("max_uses must be > 0 when set".to_string());
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_size, 4);
        assert_eq!(config.min_handles, 0);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(600)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = PoolConfig::new()
            .max_size(8)
            .min_handles(2)
            .acquire_timeout(Duration::from_millis(250))
            .max_uses(50)
            .no_idle_timeout();

        assert_eq!(config.max_size, 8);
        assert_eq!(config.min_handles, 2);
        assert_eq!(config.acquire_timeout, Duration::from_millis(250));
        assert_eq!(config.max_uses, Some(50));
        assert_eq!(config.idle_timeout, None);
    }

    #[test]
    fn test_validate() {
        assert!(PoolConfig::new().max_size(0).validate().is_err());
        assert!(PoolConfig::new().max_size(2).min_handles(3).validate().is_err());
        assert!(
            PoolConfig::new()
                .acquire_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(PoolConfig::new().max_uses(0).validate().is_err());
    }
}

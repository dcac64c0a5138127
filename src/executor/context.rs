use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coarse class of an operation; decides its default and maximum timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    /// Cheap lookups: sheet lists, properties
    Metadata,
    /// Reading cell contents
    Read,
    /// Writing cell contents or structure
    Write,
    /// Recalculation and external data refresh
    Refresh,
}

impl OperationCategory {
    /// Whether operations of this category change the file by default.
    pub fn mutates(&self) -> bool {
        matches!(self, OperationCategory::Write | OperationCategory::Refresh)
    }
}

impl std::fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationCategory::Metadata => write!(f, "metadata"),
            OperationCategory::Read => write!(f, "read"),
            OperationCategory::Write => write!(f, "write"),
            OperationCategory::Refresh => write!(f, "refresh"),
        }
    }
}

/// Default and ceiling timeout for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryTimeout {
    pub default: Duration,
    pub max: Duration,
}

impl CategoryTimeout {
    pub const fn new(default: Duration, max: Duration) -> Self {
        Self { default, max }
    }
}

/// Per-category timeouts used by the executor.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    pub metadata: CategoryTimeout,
    pub read: CategoryTimeout,
    pub write: CategoryTimeout,
    pub refresh: CategoryTimeout,

    /// Limit for the save performed by a commit
    pub save_timeout: Duration,

    /// Fire the engine kill switch as soon as an operation times out
    pub terminate_on_timeout: bool,
}

impl TimeoutPolicy {
    pub fn new() -> Self {
        Self {
            metadata: CategoryTimeout::new(Duration::from_secs(30), Duration::from_secs(60)),
            read: CategoryTimeout::new(Duration::from_secs(60), Duration::from_secs(300)),
            write: CategoryTimeout::new(Duration::from_secs(120), Duration::from_secs(300)),
            refresh: CategoryTimeout::new(Duration::from_secs(300), Duration::from_secs(1800)),
            save_timeout: Duration::from_secs(120),
            terminate_on_timeout: false,
        }
    }

    pub fn limits(&self, category: OperationCategory) -> CategoryTimeout {
        match category {
            OperationCategory::Metadata => self.metadata,
            OperationCategory::Read => self.read,
            OperationCategory::Write => self.write,
            OperationCategory::Refresh => self.refresh,
        }
    }

    pub fn save_timeout(mut self, timeout: Duration) -> Self {
        self.save_timeout = timeout;
        self
    }

    pub fn terminate_on_timeout(mut self, terminate: bool) -> Self {
        self.terminate_on_timeout = terminate;
        self
    }

    /// Override the limits of one category.
    pub fn category(mut self, category: OperationCategory, limits: CategoryTimeout) -> Self {
        match category {
            OperationCategory::Metadata => self.metadata = limits,
            OperationCategory::Read => self.read = limits,
            OperationCategory::Write => self.write = limits,
            OperationCategory::Refresh => self.refresh = limits,
        }
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        for category in [
            OperationCategory::Metadata,
            OperationCategory::Read,
            OperationCategory::Write,
            OperationCategory::Refresh,
        ] {
            let limits = self.limits(category);
            if limits.default.is_zero() {
                return Err(format!("{} timeout must be > 0", category));
            }
            if limits.default > limits.max {
                return Err(format!(
                    "{} default timeout cannot exceed its maximum",
                    category
                ));
            }
        }
        if self.save_timeout.is_zero() {
            return Err("save_timeout must be > 0".to_string());
        }
        Ok(())
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Describes one operation to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub operation: String,
    pub category: OperationCategory,
    /// Requested timeout; the category default when `None`
    pub timeout: Option<Duration>,
    pub mutates: bool,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>, category: OperationCategory) -> Self {
        Self {
            operation: operation.into(),
            category,
            timeout: None,
            mutates: category.mutates(),
        }
    }

    pub fn metadata(operation: impl Into<String>) -> Self {
        Self::new(operation, OperationCategory::Metadata)
    }

    pub fn read(operation: impl Into<String>) -> Self {
        Self::new(operation, OperationCategory::Read)
    }

    pub fn write(operation: impl Into<String>) -> Self {
        Self::new(operation, OperationCategory::Write)
    }

    pub fn refresh(operation: impl Into<String>) -> Self {
        Self::new(operation, OperationCategory::Refresh)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn mutating(mut self, mutates: bool) -> Self {
        self.mutates = mutates;
        self
    }

    /// Requested timeout, defaulted and capped by the category limits.
    pub fn effective_timeout(&self, policy: &TimeoutPolicy) -> Duration {
        let limits = policy.limits(self.category);
        self.timeout.unwrap_or(limits.default).min(limits.max)
    }
}

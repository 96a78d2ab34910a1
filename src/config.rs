//! Configuration for the entity replicator.
//!
//! Configuration is passed to [`ReplicationEngine::open()`](crate::ReplicationEngine::open)
//! and can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use entity_replicator::config::ReplicationConfig;
//!
//! let config = ReplicationConfig::for_testing("/tmp/pending.json");
//! assert!(config.worker.max_transient_retries.is_none());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── snapshot: SnapshotConfig      # Where pending operations survive a stop
//! ├── worker: WorkerConfig          # Transient-failure retry policy
//! └── types: TypeMappingConfig      # Which units are master/slave, explicit pairs
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "snapshot": { "path": "/var/lib/app/pending_operations.json" },
//!   "worker": {
//!     "retry_initial_delay": "250ms",
//!     "retry_max_delay": "1m",
//!     "retry_backoff_factor": 2.0,
//!     "max_transient_retries": null
//!   },
//!   "types": {
//!     "master_units": ["primary"],
//!     "slave_units": ["replica"],
//!     "explicit": [{ "master": "primary.Person", "slave": "replica.Contact" }]
//!   }
//! }
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicationEngine::open()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::open()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Durable snapshot of the pending list.
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Queue worker tuning.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Master/slave type selection.
    #[serde(default)]
    pub types: TypeMappingConfig,

    /// Accept lifecycle hooks but replicate nothing.
    #[serde(default)]
    pub disabled: bool,
}

impl ReplicationConfig {
    /// Create a minimal config for testing: fast retries, snapshot at `path`.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot: SnapshotConfig { path: path.into() },
            worker: WorkerConfig::for_testing(),
            types: TypeMappingConfig::default(),
            disabled: false,
        }
    }

    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ReplicationError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would otherwise be silently replaced by defaults.
    pub fn validate(&self) -> Result<()> {
        self.worker.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SnapshotConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Location of the pending-operation snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// File written on stop and read on construction.
    #[serde(default = "default_snapshot_path")]
    pub path: PathBuf,
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("pending_operations.json")
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: default_snapshot_path(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WorkerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Queue worker retry policy for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Delay before the first retry (humantime, e.g. "100ms").
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: String,

    /// Ceiling for the backoff delay (humantime, e.g. "30s").
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,

    /// Backoff multiplier.
    #[serde(default = "default_retry_backoff_factor")]
    pub retry_backoff_factor: f64,

    /// Retries before a transiently failing operation is dropped.
    /// `None` retries forever.
    #[serde(default)]
    pub max_transient_retries: Option<usize>,
}

fn default_retry_initial_delay() -> String {
    "100ms".to_string()
}

fn default_retry_max_delay() -> String {
    "30s".to_string()
}

fn default_retry_backoff_factor() -> f64 {
    2.0
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry_initial_delay: default_retry_initial_delay(),
            retry_max_delay: default_retry_max_delay(),
            retry_backoff_factor: default_retry_backoff_factor(),
            max_transient_retries: None,
        }
    }
}

impl WorkerConfig {
    /// Millisecond-scale retries for tests.
    pub fn for_testing() -> Self {
        Self {
            retry_initial_delay: "5ms".to_string(),
            retry_max_delay: "50ms".to_string(),
            ..Self::default()
        }
    }

    /// Parse the initial delay, falling back to 100ms.
    pub fn retry_initial_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.retry_initial_delay).unwrap_or(Duration::from_millis(100))
    }

    /// Parse the max delay, falling back to 30s.
    pub fn retry_max_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.retry_max_delay).unwrap_or(Duration::from_secs(30))
    }

    /// Backoff settings for the queue worker.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_transient_retries.unwrap_or(usize::MAX),
            initial_delay: self.retry_initial_delay_duration(),
            max_delay: self.retry_max_delay_duration(),
            backoff_factor: self.retry_backoff_factor,
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("retry_initial_delay", &self.retry_initial_delay),
            ("retry_max_delay", &self.retry_max_delay),
        ] {
            humantime::parse_duration(value).map_err(|e| {
                ReplicationError::Config(format!("worker.{} = {:?}: {}", name, value, e))
            })?;
        }
        if !self.retry_backoff_factor.is_finite() || self.retry_backoff_factor < 1.0 {
            return Err(ReplicationError::Config(format!(
                "worker.retry_backoff_factor must be >= 1.0, got {}",
                self.retry_backoff_factor
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TypeMappingConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Which persistence units hold master and slave types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeMappingConfig {
    /// Master-side unit names. Empty accepts every unit of the master catalog.
    #[serde(default)]
    pub master_units: Vec<String>,

    /// Slave-side unit names. Empty accepts every unit of the slave catalog.
    #[serde(default)]
    pub slave_units: Vec<String>,

    /// Pairs that bypass name matching.
    #[serde(default)]
    pub explicit: Vec<TypeMapping>,
}

impl TypeMappingConfig {
    pub fn accepts_master_unit(&self, unit: &str) -> bool {
        self.master_units.is_empty() || self.master_units.iter().any(|u| u == unit)
    }

    pub fn accepts_slave_unit(&self, unit: &str) -> bool {
        self.slave_units.is_empty() || self.slave_units.iter().any(|u| u == unit)
    }
}

/// One explicit master → slave type pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMapping {
    pub master: String,
    pub slave: String,
}

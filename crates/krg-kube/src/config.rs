//! Controller configuration
//!
//! Loaded from a YAML file (`krg controller --config`), every field optional:
//!
//! ```yaml
//! workersPerType: 4
//! baseDelay: 500ms
//! maxDelay: 2m
//! resyncPeriod: 10m
//! allowCrdDeletion: true
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ControllerError, Result};

/// Field manager used for server-side apply
pub const DEFAULT_FIELD_MANAGER: &str = "krg-controller";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Workers pulling instance keys, per registered type
    pub workers_per_type: usize,

    /// Workers reconciling ResourceGraphDefinitions
    pub definition_workers: usize,

    /// First retry delay after a transient failure
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound of the retry delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Delay before looking again at an instance waiting on a dependency
    #[serde(with = "humantime_serde")]
    pub pending_requeue: Duration,

    /// Interval of the full relist of every watched type
    #[serde(with = "humantime_serde")]
    pub resync_period: Duration,

    /// Delete the generated CRD when its RGD goes away (unless the RGD says otherwise)
    pub allow_crd_deletion: bool,

    pub field_manager: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers_per_type: 2,
            definition_workers: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            pending_requeue: Duration::from_secs(3),
            resync_period: Duration::from_secs(600),
            allow_crd_deletion: false,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.workers_per_type == 0 || self.definition_workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "worker counts must be at least 1".to_string(),
            ));
        }
        if self.base_delay.is_zero() || self.base_delay > self.max_delay {
            return Err(ControllerError::InvalidConfig(format!(
                "baseDelay ({:?}) must be positive and not exceed maxDelay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        if self.resync_period.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "resyncPeriod must be positive".to_string(),
            ));
        }
        if self.field_manager.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "fieldManager must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

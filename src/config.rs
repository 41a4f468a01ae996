//! Engine configuration
//!
//! Loaded from TOML. Every field has a default so an empty document is a
//! valid configuration.
//!
//! ```toml
//! database_path = "/var/lib/site-allocator/alloc.db"
//! busy_timeout_ms = 5000
//! request_timeout_ms = 30000
//!
//! [notifier]
//! site_task_queue = "site"
//! create_failure = "enqueue"
//! teardown_failure = "abort"
//! ```

use crate::error::{AllocError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do when the orchestration notifier fails mid-transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Record the call in the workflow outbox and commit
    #[default]
    Enqueue,
    /// Roll the transaction back
    Abort,
}

/// Notifier behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifierConfig {
    /// Task queue name recorded in workflow payloads
    pub site_task_queue: String,
    /// Policy for the first-allocation tenant creation call
    pub create_failure: FailurePolicy,
    /// Policy for the last-allocation tenant teardown call
    pub teardown_failure: FailurePolicy,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        NotifierConfig {
            site_task_queue: "site".to_string(),
            create_failure: FailurePolicy::Enqueue,
            teardown_failure: FailurePolicy::Enqueue,
        }
    }
}

/// Allocation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file
    pub database_path: PathBuf,
    /// How long a connection waits for another writer before failing
    pub busy_timeout_ms: u64,
    /// Deadline applied to transactions when the caller supplies none
    pub request_timeout_ms: u64,
    pub notifier: NotifierConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database_path: PathBuf::from("site-allocator.db"),
            busy_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            notifier: NotifierConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Config pointing at a specific database file, defaults elsewhere
    pub fn with_database(path: impl Into<PathBuf>) -> Self {
        EngineConfig {
            database_path: path.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AllocError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(AllocError::Config("database_path cannot be empty".into()));
        }
        if self.busy_timeout_ms == 0 {
            return Err(AllocError::Config("busy_timeout_ms must be positive".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(AllocError::Config(
                "request_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

//! Configuration for the whole bridge.
//!
//! Loaded from an optional TOML file, then overridden by CLI flags:
//!
//! ```toml
//! [queue]
//! url = "http://localhost:9324/000000000000/namespaces"
//! poll_interval = 1000        # ms
//! wait_time = 20              # s
//! ack_policy = "retain"
//!
//! [controller]
//! workers = 2
//!
//! [reconciler]
//! resync_period = 600         # s
//!
//! [reconciler.role]
//! name = "namespace-reader"
//! ```

use std::path::Path;

use anyhow::Result;
use ebb_queue::QueueConfig;
use ebb_reconciler::{ControllerConfig, ReconcilerConfig};
use serde::{Deserialize, Serialize};

/// Configuration of the queue poller, the controller and the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

impl BridgeConfig {
    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` or `TomlParseFailed` naming the path.
    pub fn load(path: &Path) -> ebb_core::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ebb_core::Error::file_read_failed(path, e.to_string()))?;
        toml::from_str(&raw).map_err(|e| ebb_core::Error::toml_parse_failed(path, e.to_string()))
    }

    /// Validate everything, the queue URL included.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error found.
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        self.validate_runtime()
    }

    /// Validate everything but the queue URL, which in-memory queues lack.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error found.
    pub fn validate_runtime(&self) -> Result<()> {
        self.queue.validate_polling()?;
        self.controller.validate()?;
        self.reconciler.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use ebb_queue::AckPolicy;

    use super::*;

    #[test]
    fn test_defaults_need_a_queue_url() {
        let config = BridgeConfig::default();
        assert!(config.validate_runtime().is_ok());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r#"
[queue]
url = "http://localhost:9324/000000000000/namespaces"
poll_interval = 250
ack_policy = "delete-after-dispatch"

[controller]
workers = 3

[reconciler]
resync_period = 600

[reconciler.role]
name = "team-viewer"
"#
        )?;

        let config = BridgeConfig::load(file.path())?;

        assert_eq!(config.queue.poll_interval, Duration::from_millis(250));
        assert_eq!(config.queue.ack_policy, AckPolicy::DeleteAfterDispatch);
        assert_eq!(config.controller.workers, 3);
        assert_eq!(config.controller.name, "sqs");
        assert_eq!(config.reconciler.resync_period, Some(Duration::from_secs(600)));
        assert_eq!(config.reconciler.role.name, "team-viewer");
        config.validate()?;
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let result = BridgeConfig::load(Path::new("/nonexistent/ebb.toml"));
        assert!(matches!(result, Err(ebb_core::Error::FileReadFailed { .. })));
    }

    #[test]
    fn test_malformed_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "[controller]\nworkers = \"many\"")?;

        let result = BridgeConfig::load(file.path());
        assert!(matches!(result, Err(ebb_core::Error::TomlParseFailed { .. })));
        Ok(())
    }
}

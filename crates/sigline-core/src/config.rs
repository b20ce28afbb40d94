use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffCounter;
use crate::errors::SignalError;
use crate::locus;

/// Tunables of the signaling transport.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TransportConfig {
    #[serde(default = "default_batching_interval_ms")]
    pub batching_interval_ms: u64,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_backoff_minimum_ms")]
    pub backoff_minimum_ms: u64,
    #[serde(default = "default_backoff_maximum_ms")]
    pub backoff_maximum_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Events whose `data.eventType` starts with this are routed to calls.
    #[serde(default = "default_call_event_prefix")]
    pub call_event_prefix: String,
}

fn default_batching_interval_ms() -> u64 {
    500
}

fn default_connection_timeout_secs() -> u64 {
    60
}

fn default_backoff_minimum_ms() -> u64 {
    500
}

fn default_backoff_maximum_ms() -> u64 {
    32_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_call_event_prefix() -> String {
    locus::EVENT_PREFIX.to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            batching_interval_ms: default_batching_interval_ms(),
            connection_timeout_secs: default_connection_timeout_secs(),
            backoff_minimum_ms: default_backoff_minimum_ms(),
            backoff_maximum_ms: default_backoff_maximum_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            call_event_prefix: default_call_event_prefix(),
        }
    }
}

impl TransportConfig {
    pub fn batching_interval(&self) -> Duration {
        Duration::from_millis(self.batching_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn backoff(&self) -> Result<BackoffCounter, SignalError> {
        BackoffCounter::new(
            Duration::from_millis(self.backoff_minimum_ms),
            Duration::from_millis(self.backoff_maximum_ms),
            self.backoff_multiplier,
        )
    }

    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> Result<(), SignalError> {
        if self.batching_interval_ms == 0 {
            return Err(SignalError::Config("batching interval must be positive".into()));
        }
        if self.connection_timeout_secs == 0 {
            return Err(SignalError::Config("connection timeout must be positive".into()));
        }
        self.backoff()?;
        Ok(())
    }
}

/// Persists a [`TransportConfig`] as `transport.json` in a data directory.
pub struct ConfigStore {
    config: Mutex<TransportConfig>,
    file_path: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("transport.json");
        let config = Self::load(&file_path);
        Self {
            config: Mutex::new(config),
            file_path,
        }
    }

    pub fn get(&self) -> TransportConfig {
        self.config.lock().clone()
    }

    pub fn update(&self, config: TransportConfig) -> Result<(), SignalError> {
        config.validate()?;
        *self.config.lock() = config;
        self.save()
    }

    fn save(&self) -> Result<(), SignalError> {
        let config = self.config.lock().clone();
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SignalError::Config(e.to_string()))?;
        }
        let json =
            serde_json::to_string_pretty(&config).map_err(|e| SignalError::Config(e.to_string()))?;
        std::fs::write(&self.file_path, json).map_err(|e| SignalError::Config(e.to_string()))
    }

    fn load(path: &Path) -> TransportConfig {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(_) => return TransportConfig::default(),
        };
        match serde_json::from_str::<TransportConfig>(&contents) {
            Ok(config) if config.validate().is_ok() => config,
            Ok(_) => {
                tracing::warn!("ignoring invalid transport config at {}", path.display());
                TransportConfig::default()
            }
            Err(e) => {
                tracing::warn!("unreadable transport config at {}: {e}", path.display());
                TransportConfig::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_default_config() {
        let c = TransportConfig::default();
        assert_eq!(c.batching_interval(), Duration::from_millis(500));
        assert_eq!(c.connection_timeout(), Duration::from_secs(60));
        assert_eq!(c.call_event_prefix, "locus");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_new_creates_defaults_when_no_file() {
        let dir = temp_dir();
        let store = ConfigStore::new(dir.path());
        assert_eq!(store.get(), TransportConfig::default());
    }

    #[test]
    fn test_update_persists() {
        let dir = temp_dir();
        {
            let store = ConfigStore::new(dir.path());
            let mut c = store.get();
            c.batching_interval_ms = 250;
            c.backoff_maximum_ms = 8_000;
            store.update(c).unwrap();
        }
        let store = ConfigStore::new(dir.path());
        assert_eq!(store.get().batching_interval_ms, 250);
        assert_eq!(store.get().backoff_maximum_ms, 8_000);
    }

    #[test]
    fn test_update_rejects_invalid_backoff() {
        let dir = temp_dir();
        let store = ConfigStore::new(dir.path());
        let mut c = store.get();
        c.backoff_multiplier = 0.5;
        assert!(store.update(c).is_err());
        assert_eq!(store.get(), TransportConfig::default());
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = temp_dir();
        fs::write(dir.path().join("transport.json"), "not json!!!").unwrap();
        let store = ConfigStore::new(dir.path());
        assert_eq!(store.get(), TransportConfig::default());
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let dir = temp_dir();
        fs::write(
            dir.path().join("transport.json"),
            r#"{"backoff_minimum_ms":0}"#,
        )
        .unwrap();
        let store = ConfigStore::new(dir.path());
        assert_eq!(store.get(), TransportConfig::default());
    }

    #[test]
    fn test_partial_json_uses_serde_defaults() {
        let dir = temp_dir();
        fs::write(
            dir.path().join("transport.json"),
            r#"{"call_event_prefix":"conversation"}"#,
        )
        .unwrap();
        let store = ConfigStore::new(dir.path());
        let c = store.get();
        assert_eq!(c.call_event_prefix, "conversation");
        assert_eq!(c.batching_interval_ms, 500);
        assert_eq!(c.backoff_multiplier, 2.0);
    }
}

// src/store.rs
//
// Persistent configuration store.
// One JSON file, validated before every commit, replaced atomically via a
// sibling `*.tmp` so a crash mid-write never corrupts the active config.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::info;

use crate::config::{validate, AppConfig, ConfigError};

pub struct ConfigStore {
    path: PathBuf,
    config: Mutex<AppConfig>,
}

impl ConfigStore {
    /// Load the config file, creating it from defaults when missing.
    /// A file that exists but fails validation is an error: the caller
    /// decides whether that aborts startup.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = Self::load_or_create(&path)?;
        Ok(Self {
            path,
            config: Mutex::new(config),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> AppConfig {
        self.config.lock().expect("config lock poisoned").clone()
    }

    /// Parse an admin payload, validate it, and commit it to disk.
    /// In-memory state is only touched after validation and the disk write
    /// both succeed.
    pub fn update_from_value(&self, data: serde_json::Value) -> Result<AppConfig, ConfigError> {
        let mut config: AppConfig =
            serde_json::from_value(data).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.normalize();
        self.save(config.clone())?;
        Ok(config)
    }

    /// Validate and atomically persist a configuration.
    pub fn save(&self, config: AppConfig) -> Result<(), ConfigError> {
        validate(&config)?;
        atomic_write(&self.path, &config)?;
        *self.config.lock().expect("config lock poisoned") = config;
        Ok(())
    }

    fn load_or_create(path: &Path) -> Result<AppConfig, ConfigError> {
        if !path.exists() {
            info!(path = %path.display(), "config file missing, creating defaults");
            let config = AppConfig::default();
            atomic_write(path, &config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
        let mut config: AppConfig =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.normalize();
        validate(&config)?;
        Ok(config)
    }
}

/// Write a sibling `*.tmp` and rename it over the target.
fn atomic_write(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Write(e.to_string()))?;
        }
    }
    let serialized =
        serde_json::to_string_pretty(config).map_err(|e| ConfigError::Write(e.to_string()))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, serialized).map_err(|e| ConfigError::Write(e.to_string()))?;
    fs::rename(&tmp_path, path).map_err(|e| ConfigError::Write(e.to_string()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, DeviceKind};

    fn temp_config_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("config").join("config.json")
    }

    #[test]
    fn test_open_creates_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_config_path(&dir);

        let store = ConfigStore::open(&path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(store.config(), AppConfig::default());
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_config_path(&dir);
        let store = ConfigStore::open(&path).unwrap();

        let mut config = AppConfig::default();
        config.polling.interval_sec = 10;
        config.boards.push(DeviceConfig {
            id: "b1".to_string(),
            name: "Sala".to_string(),
            kind: DeviceKind::Lights,
            address: 7,
            channel_start: 1,
            channel_end: 4,
            topic: String::new(),
            enabled: true,
            publish_enabled: true,
        });
        store.save(config.clone()).unwrap();
        assert!(!path.with_extension("tmp").exists());

        // A fresh store sees the committed state
        let reloaded = ConfigStore::open(&path).unwrap();
        assert_eq!(reloaded.config(), config);
    }

    #[test]
    fn test_save_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_config_path(&dir);
        let store = ConfigStore::open(&path).unwrap();

        let mut config = AppConfig::default();
        config.polling.interval_sec = 0;
        assert!(store.save(config).is_err());

        // Active config untouched
        assert_eq!(store.config().polling.interval_sec, 30);
    }

    #[test]
    fn test_update_from_value_accepts_legacy_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(temp_config_path(&dir)).unwrap();

        let updated = store
            .update_from_value(serde_json::json!({
                "mqtt": { "base_topic": "/casa/" },
                "boards": [
                    { "name": "Luci Sala", "type": "luci", "address": 3, "channel": 2 }
                ]
            }))
            .unwrap();

        assert_eq!(updated.mqtt.base_topic, "casa");
        assert_eq!(updated.boards[0].kind, DeviceKind::Lights);
        assert_eq!(updated.boards[0].channel_start, 2);
    }

    #[test]
    fn test_update_from_value_rejects_bad_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(temp_config_path(&dir)).unwrap();

        let err = store
            .update_from_value(serde_json::json!({
                "boards": [
                    { "name": "", "type": "luci", "address": 3 }
                ]
            }))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyDeviceName));
    }
}

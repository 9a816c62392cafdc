use std::{
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use log::{debug, error, info, warn};
use serde_json::Value;
use thiserror::Error;

use crate::{config::DeviceConfig, identity::DeviceIdentity};

/// Persisted records larger than this are rejected rather than parsed.
pub const RECORD_CEILING_BYTES: usize = 2048;

pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no configuration record")]
    NotFound,
    #[error("configuration record is {0} bytes, ceiling is {RECORD_CEILING_BYTES}")]
    TooLarge(usize),
    #[error("configuration record is not a JSON object: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Byte-level home of the configuration record.
///
/// `write` must replace the record atomically: a reader sees either the
/// previous bytes or the new bytes, never a mix.
pub trait RecordStorage: Send {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError>;
}

/// Stores the record as a file, replacing it through a temp file and rename.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl RecordStorage for FileStorage {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp = self.temp_path();
        {
            let mut file = File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

/// Result of a successful load: the config plus the keys that were defaulted.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub config: DeviceConfig,
    pub defaulted: Vec<&'static str>,
}

pub struct ConfigStore {
    storage: Box<dyn RecordStorage>,
}

impl ConfigStore {
    pub fn new(storage: Box<dyn RecordStorage>) -> Self {
        Self { storage }
    }

    pub fn load(&mut self) -> Result<Loaded, LoadError> {
        let raw = self.storage.read()?.ok_or(LoadError::NotFound)?;
        if raw.len() > RECORD_CEILING_BYTES {
            return Err(LoadError::TooLarge(raw.len()));
        }
        let value: Value =
            serde_json::from_slice(&raw).map_err(|err| LoadError::Corrupt(err.to_string()))?;
        let Value::Object(record) = value else {
            return Err(LoadError::Corrupt("top level is not an object".to_string()));
        };

        let (config, defaulted) = DeviceConfig::from_record(&record);
        if !defaulted.is_empty() {
            debug!("config keys defaulted: {}", defaulted.join(", "));
        }
        Ok(Loaded { config, defaulted })
    }

    /// Loads the record, falling back to defaults (saved immediately) when
    /// it is missing or unusable. Never fails.
    pub fn load_or_recover(&mut self, identity: &DeviceIdentity) -> DeviceConfig {
        match self.load() {
            Ok(loaded) => {
                info!(
                    "config loaded, topic {}",
                    loaded.config.topic(identity)
                );
                loaded.config
            }
            Err(err) => {
                match &err {
                    LoadError::NotFound => info!("no stored config, writing defaults"),
                    other => warn!("stored config unusable ({other}), writing defaults"),
                }
                let config = DeviceConfig::default();
                if let Err(err) = self.save(&config) {
                    error!("failed to persist default config: {err}");
                }
                config
            }
        }
    }

    pub fn save(&mut self, config: &DeviceConfig) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(config)?;
        if bytes.len() > RECORD_CEILING_BYTES {
            return Err(StoreError::Backend(format!(
                "record of {} bytes exceeds ceiling",
                bytes.len()
            )));
        }
        self.storage.write(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::MemoryStorage;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::from_mac([0x5c, 0xcf, 0x7f, 0x0a, 0x1b, 0x2c])
    }

    #[test]
    fn save_twice_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut store = ConfigStore::new(Box::new(FileStorage::new(&path)));
        let mut config = DeviceConfig::default();
        config.ssid = "home".to_string();
        config.mqtt_topic = Some("porch".to_string());

        store.save(&config).unwrap();
        let first = fs::read(&path).unwrap();
        let reloaded = store.load().unwrap().config;
        store.save(&reloaded).unwrap();
        let second = fs::read(&path).unwrap();

        assert_eq!(reloaded, config);
        assert_eq!(first, second);
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[test]
    fn missing_record_recovers_with_saved_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::new(Box::new(FileStorage::in_dir(dir.path())));

        let config = store.load_or_recover(&identity());

        assert_eq!(config, DeviceConfig::default());
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert_eq!(store.load().unwrap().config, config);
    }

    #[test]
    fn corrupt_record_is_reported_then_recovered() {
        let storage = MemoryStorage::with_bytes(b"{ not json".to_vec());
        let mut store = ConfigStore::new(Box::new(storage.clone()));

        assert!(matches!(store.load(), Err(LoadError::Corrupt(_))));
        assert_eq!(store.load_or_recover(&identity()), DeviceConfig::default());
        assert!(storage.bytes().is_some_and(|b| b.starts_with(b"{")));
    }

    #[test]
    fn oversized_record_is_rejected() {
        let mut big = b"{\"friendlyName\":\"".to_vec();
        big.extend(std::iter::repeat(b'x').take(RECORD_CEILING_BYTES));
        big.extend(b"\"}");
        let mut store = ConfigStore::new(Box::new(MemoryStorage::with_bytes(big)));

        assert!(matches!(store.load(), Err(LoadError::TooLarge(_))));
    }

    #[test]
    fn non_object_record_is_corrupt() {
        let mut store = ConfigStore::new(Box::new(MemoryStorage::with_bytes(b"[1,2]".to_vec())));

        assert!(matches!(store.load(), Err(LoadError::Corrupt(_))));
    }

    #[test]
    fn failed_write_surfaces_error() {
        let storage = MemoryStorage::default();
        storage.fail_writes(true);
        let mut store = ConfigStore::new(Box::new(storage));

        assert!(store.save(&DeviceConfig::default()).is_err());
    }
}

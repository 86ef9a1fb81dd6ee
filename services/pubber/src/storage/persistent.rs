//! Durable device record (`persistent_data.json`).
//!
//! The file is rewritten wholesale on every change: the document goes to a
//! sibling temp file, is fsynced, then renamed over the target, so a crash
//! leaves either the old or the new record.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use udmi_schema::DevicePersistent;

use crate::config::PubberConfig;

pub const PERSISTENT_FILE: &str = "persistent_data.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("reading persistent store {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("writing persistent store {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("corrupt persistent store {path}: {source}")]
    Corrupt {
        path: String,
        source: serde_json::Error,
    },
    #[error("encoding persistent record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct PersistentStore {
    path: PathBuf,
}

impl PersistentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store location for a device: explicit `persist_dir`, then the site
    /// model's `out/devices/{id}`, then the system temp directory.
    pub fn resolve(config: &PubberConfig) -> Self {
        let path = if let Some(dir) = &config.persist_dir {
            dir.join(PERSISTENT_FILE)
        } else if let Some(site) = &config.site_path {
            site.join("out")
                .join("devices")
                .join(&config.device_id)
                .join(PERSISTENT_FILE)
        } else {
            std::env::temp_dir().join(format!(
                "pubber_{}_{}",
                config.device_id, PERSISTENT_FILE
            ))
        };
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record; a missing file is an empty record.
    pub fn load(&self) -> Result<DevicePersistent, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DevicePersistent::default());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.display().to_string(),
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, data: &DevicePersistent) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec_pretty(data)?;
        let write_err = |source| StoreError::Write {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(write_err)?;
        file.write_all(&encoded).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(write_err)?;
        tracing::debug!(path = %self.path.display(), "persistent store written");
        Ok(())
    }
}

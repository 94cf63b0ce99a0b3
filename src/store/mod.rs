//! Per-user device store
//!
//! Each user owns one store file under the data directory holding the
//! persisted device identity for their linked account. The supervisor
//! guarantees at most one open store per user process-wide, so the handle
//! itself only defends against use-after-close.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{debug, info, warn};

use crate::types::{PosternError, Result};

/// Extension used for store files
const STORE_EXT: &str = "json";

/// Persisted device identity for one linked account.
///
/// A freshly created store holds an unlinked device (`id` is `None`);
/// linking fills in the device id and registration timestamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Device {
    /// Upstream device identifier, present once linking has completed
    pub id: Option<String>,
    /// Display name pushed by the upstream account
    pub push_name: Option<String>,
    /// Platform string reported during linking
    pub platform: Option<String>,
    /// When the device completed linking
    pub registered_at: Option<DateTime<Utc>>,
}

impl Device {
    /// Whether this device has completed linking at least once
    pub fn is_linked(&self) -> bool {
        self.id.is_some()
    }
}

/// Open handle to one user's store file.
///
/// Closing is idempotent; every accessor fails once the handle is closed.
#[derive(Debug)]
pub struct DeviceStore {
    user: String,
    path: PathBuf,
    device: RwLock<Device>,
    closed: AtomicBool,
}

impl DeviceStore {
    /// Open the store at `path`, creating an empty unlinked device if the
    /// file does not exist yet.
    pub fn open(user: &str, path: PathBuf) -> Result<Self> {
        let device = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<Device>(&bytes).map_err(|e| {
                PosternError::Corrupt(format!("store for {} at {}: {}", user, path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Create the file eagerly so the startup scan sees this user
                debug!("No store file for {}, creating unlinked device", user);
                let device = Device::default();
                let bytes = serde_json::to_vec_pretty(&device).map_err(|e| {
                    PosternError::Store(format!("encode device for {}: {}", user, e))
                })?;
                std::fs::write(&path, bytes)
                    .map_err(|e| PosternError::Store(format!("create store for {}: {}", user, e)))?;
                device
            }
            Err(e) => {
                return Err(PosternError::Store(format!(
                    "open store for {}: {}",
                    user, e
                )))
            }
        };

        Ok(Self {
            user: user.to_string(),
            path,
            device: RwLock::new(device),
            closed: AtomicBool::new(false),
        })
    }

    /// The sole persisted device identity.
    pub fn first_device(&self) -> Result<Device> {
        self.check_open()?;
        Ok(self.device.read().expect("store lock poisoned").clone())
    }

    /// Persist the device identity (after linking or key changes).
    pub fn save(&self, device: Device) -> Result<()> {
        self.check_open()?;
        let bytes = serde_json::to_vec_pretty(&device)
            .map_err(|e| PosternError::Store(format!("encode device for {}: {}", self.user, e)))?;
        std::fs::write(&self.path, bytes)
            .map_err(|e| PosternError::Store(format!("write store for {}: {}", self.user, e)))?;
        *self.device.write().expect("store lock poisoned") = device;
        Ok(())
    }

    /// Close the store. Idempotent; later accessors fail with a store error.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closed store for {}", self.user);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PosternError::Store(format!(
                "store for {} is closed",
                self.user
            )));
        }
        Ok(())
    }
}

/// Owns the data directory: path derivation, open/delete, startup scan.
///
/// Callers hand in an already filesystem-safe user name; the supervisor
/// sanitizes raw identifiers before they reach this layer.
pub struct StoreManager {
    data_dir: PathBuf,
}

impl StoreManager {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Ensure the data directory exists
    pub fn ensure_data_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| PosternError::Store(format!("create data dir: {}", e)))
    }

    /// Deterministic store path for a user
    pub fn store_path(&self, user: &str) -> PathBuf {
        self.data_dir.join(format!("{}.{}", user, STORE_EXT))
    }

    /// Open (or create) the store for a user
    pub fn open(&self, user: &str) -> Result<DeviceStore> {
        self.ensure_data_dir()?;
        let store = DeviceStore::open(user, self.store_path(user))?;
        info!("Opened store for {} at {}", user, store.path().display());
        Ok(store)
    }

    /// Delete a user's store file. Missing files are not an error.
    pub fn delete(&self, user: &str) -> Result<()> {
        let path = self.store_path(user);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("Deleted store file for {}", user);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PosternError::Store(format!(
                "delete store for {}: {}",
                user, e
            ))),
        }
    }

    /// Enumerate users with a store file on disk. Each is a latent session
    /// at startup.
    pub fn scan(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read data dir {}: {}", self.data_dir.display(), e);
                return Vec::new();
            }
        };

        let mut users = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STORE_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.is_empty() {
                    users.push(stem.to_string());
                }
            }
        }
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, StoreManager) {
        let dir = TempDir::new().unwrap();
        let manager = StoreManager::new(dir.path().to_path_buf());
        (dir, manager)
    }

    #[test]
    fn test_open_creates_unlinked_device() {
        let (_dir, manager) = manager();
        let store = manager.open("alice").unwrap();
        let device = store.first_device().unwrap();
        assert!(!device.is_linked());
        assert!(device.id.is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let (_dir, manager) = manager();
        {
            let store = manager.open("alice").unwrap();
            store
                .save(Device {
                    id: Some("device-1".into()),
                    push_name: Some("Alice".into()),
                    platform: None,
                    registered_at: Some(Utc::now()),
                })
                .unwrap();
        }

        let store = manager.open("alice").unwrap();
        let device = store.first_device().unwrap();
        assert!(device.is_linked());
        assert_eq!(device.id.as_deref(), Some("device-1"));
        assert_eq!(device.push_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_access() {
        let (_dir, manager) = manager();
        let store = manager.open("alice").unwrap();
        store.close();
        store.close();
        assert!(store.is_closed());
        assert!(store.first_device().is_err());
        assert!(store.save(Device::default()).is_err());
    }

    #[test]
    fn test_corrupt_store_is_reported() {
        let (dir, manager) = manager();
        std::fs::write(dir.path().join("mallory.json"), b"{not json").unwrap();
        let err = manager.open("mallory").unwrap_err();
        assert!(matches!(err, PosternError::Corrupt(_)));
    }

    #[test]
    fn test_delete_missing_is_ok() {
        let (_dir, manager) = manager();
        assert!(manager.delete("ghost").is_ok());
    }

    #[test]
    fn test_scan_lists_store_files_only() {
        let (dir, manager) = manager();
        manager.open("alice").unwrap();
        manager.open("bob").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        assert_eq!(manager.scan(), vec!["alice".to_string(), "bob".to_string()]);
    }
}

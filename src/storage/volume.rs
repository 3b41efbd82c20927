//! Named volume management
//!
//! Volumes are directories under a base path. They are created on first
//! use, outlive every container that mounts them, and go away only through
//! an explicit [`VolumeManager::remove`].

use crate::error::{BerthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Named volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// Mount point on host
    pub mountpoint: PathBuf,
    /// Volume labels
    pub labels: HashMap<String, String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Number of containers currently mounting the volume
    pub ref_count: u32,
}

impl Volume {
    /// Create a new volume record
    pub fn new(name: &str, base_path: &Path) -> Self {
        Self {
            name: name.to_string(),
            mountpoint: base_path.join(name),
            labels: HashMap::new(),
            created_at: Utc::now(),
            ref_count: 0,
        }
    }

    /// Get size in bytes
    pub fn size(&self) -> u64 {
        if !self.mountpoint.exists() {
            return 0;
        }

        walkdir::WalkDir::new(&self.mountpoint)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }
}

/// Volume manager
pub struct VolumeManager {
    /// Volumes indexed by name
    volumes: Arc<RwLock<HashMap<String, Volume>>>,
    /// Base path for volume storage
    base_path: PathBuf,
}

impl VolumeManager {
    /// Create a volume manager, adopting volumes already on disk
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;

        let mut volumes = HashMap::new();
        for entry in std::fs::read_dir(&base_path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                volumes.insert(name.clone(), Volume::new(&name, &base_path));
            }
        }

        if !volumes.is_empty() {
            tracing::debug!("Adopted {} existing volume(s)", volumes.len());
        }

        Ok(Self {
            volumes: Arc::new(RwLock::new(volumes)),
            base_path,
        })
    }

    /// Return the named volume, creating it on first use. The flag is
    /// `true` when the volume was created by this call.
    pub fn ensure(&self, name: &str, labels: &HashMap<String, String>) -> Result<(Volume, bool)> {
        validate_name(name)?;

        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))?;

        if let Some(existing) = volumes.get(name) {
            return Ok((existing.clone(), false));
        }

        let mut volume = Volume::new(name, &self.base_path);
        volume.labels = labels.clone();
        std::fs::create_dir_all(&volume.mountpoint)?;
        volumes.insert(name.to_string(), volume.clone());

        tracing::info!("Created volume {}", name);
        Ok((volume, true))
    }

    /// Get a volume by name
    pub fn get(&self, name: &str) -> Result<Volume> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| BerthError::Lock("Failed to acquire read lock".to_string()))?;

        volumes
            .get(name)
            .cloned()
            .ok_or_else(|| BerthError::VolumeNotFound(name.to_string()))
    }

    /// List all volumes, sorted by name
    pub fn list(&self) -> Result<Vec<Volume>> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| BerthError::Lock("Failed to acquire read lock".to_string()))?;

        let mut list: Vec<Volume> = volumes.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// Remove a volume and its data
    pub fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get(name)
            .ok_or_else(|| BerthError::VolumeNotFound(name.to_string()))?;

        if volume.ref_count > 0 && !force {
            return Err(BerthError::Volume(format!(
                "Volume {} is in use by {} container(s)",
                name, volume.ref_count
            )));
        }

        if volume.mountpoint.exists() {
            std::fs::remove_dir_all(&volume.mountpoint)?;
        }

        volumes.remove(name);
        tracing::info!("Removed volume {}", name);

        Ok(())
    }

    /// Increment reference count for a volume
    pub fn add_reference(&self, name: &str) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| BerthError::VolumeNotFound(name.to_string()))?;
        volume.ref_count += 1;

        Ok(())
    }

    /// Decrement reference count for a volume
    pub fn remove_reference(&self, name: &str) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| BerthError::VolumeNotFound(name.to_string()))?;
        volume.ref_count = volume.ref_count.saturating_sub(1);

        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(BerthError::Volume(format!("Invalid volume name '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_creates_once() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();

        let (volume, created) = manager.ensure("postgres_data", &HashMap::new()).unwrap();
        assert!(created);
        assert!(volume.mountpoint.exists());

        let (_, created) = manager.ensure("postgres_data", &HashMap::new()).unwrap();
        assert!(!created);
    }

    #[test]
    fn test_data_survives_manager_restart() {
        let temp = tempdir().unwrap();
        {
            let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();
            let (volume, _) = manager.ensure("pgdata", &HashMap::new()).unwrap();
            std::fs::write(volume.mountpoint.join("PG_VERSION"), "16").unwrap();
        }

        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        let (volume, created) = manager.ensure("pgdata", &HashMap::new()).unwrap();
        assert!(!created);
        assert_eq!(volume.size(), 2);
    }

    #[test]
    fn test_remove_volume() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();

        manager.ensure("test-volume", &HashMap::new()).unwrap();
        manager.remove("test-volume", false).unwrap();

        assert!(manager.get("test-volume").is_err());
        assert!(manager.remove("test-volume", false).is_err());
    }

    #[test]
    fn test_in_use_volume_needs_force() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();

        manager.ensure("data", &HashMap::new()).unwrap();
        manager.add_reference("data").unwrap();
        manager.add_reference("data").unwrap();
        assert_eq!(manager.get("data").unwrap().ref_count, 2);

        assert!(manager.remove("data", false).is_err());
        manager.remove_reference("data").unwrap();
        manager.remove_reference("data").unwrap();
        manager.remove_reference("data").unwrap();
        assert_eq!(manager.get("data").unwrap().ref_count, 0);
        manager.remove("data", false).unwrap();
    }

    #[test]
    fn test_invalid_names_rejected() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        assert!(manager.ensure("../escape", &HashMap::new()).is_err());
        assert!(manager.ensure("", &HashMap::new()).is_err());
    }
}

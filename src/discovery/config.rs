//! Discovery Configuration
//!
//! Maps storage-class names to the host directory scanned for volumes of
//! that class. Delivered as a key-value config object whose values are small
//! JSON documents: `{"hostDir": "/mnt/disks"}`.

use crate::domain::ClusterApi;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default name of the discovery config map
pub const DEFAULT_CONFIG_MAP_NAME: &str = "local-volume-config";

/// Per-storage-class discovery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassConfig {
    /// Discovery root on the host
    pub host_dir: PathBuf,
}

/// Discovery roots keyed by storage class
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryConfig {
    classes: BTreeMap<String, ClassConfig>,
}

impl DiscoveryConfig {
    /// Parse config map data; each value is a JSON `ClassConfig`
    pub fn from_config_map_data(data: &BTreeMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        for (class, raw) in data {
            let class_config: ClassConfig = serde_json::from_str(raw).map_err(|e| {
                Error::Configuration(format!(
                    "malformed discovery config for storage class {}: {}",
                    class, e
                ))
            })?;
            config.insert(class, class_config.host_dir)?;
        }
        config.ensure_not_empty()?;
        Ok(config)
    }

    /// Parse a YAML (or JSON) document mapping storage class to `ClassConfig`
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let classes: BTreeMap<String, ClassConfig> = serde_yaml::from_str(raw)?;
        let mut config = Self::default();
        for (class, class_config) in classes {
            config.insert(&class, class_config.host_dir)?;
        }
        config.ensure_not_empty()?;
        Ok(config)
    }

    /// Load from a file on disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Fetch and parse the discovery config map from the cluster
    pub async fn load(cluster: &dyn ClusterApi, namespace: &str, name: &str) -> Result<Self> {
        let config_map = cluster.get_config_map(namespace, name).await?;
        let data = config_map.data.unwrap_or_default();
        Self::from_config_map_data(&data).map_err(|e| {
            Error::Configuration(format!("config map {}/{}: {}", namespace, name, e))
        })
    }

    /// Add a discovery root for a storage class
    pub fn insert(&mut self, storage_class: &str, host_dir: impl Into<PathBuf>) -> Result<()> {
        let host_dir = host_dir.into();

        if storage_class.trim().is_empty() {
            return Err(Error::Configuration("empty storage class name".into()));
        }
        if !host_dir.is_absolute() {
            return Err(Error::Configuration(format!(
                "hostDir for storage class {} must be absolute, got {}",
                storage_class,
                host_dir.display()
            )));
        }
        // A root inside another would list the inner root as a volume
        if let Some((other, c)) = self.classes.iter().find(|(name, c)| {
            name.as_str() != storage_class
                && (c.host_dir.starts_with(&host_dir) || host_dir.starts_with(&c.host_dir))
        }) {
            let reason = if c.host_dir == host_dir {
                "is shared by"
            } else {
                "overlaps the root of"
            };
            return Err(Error::Configuration(format!(
                "hostDir {} of storage class {} {} storage class {} ({})",
                host_dir.display(),
                storage_class,
                reason,
                other,
                c.host_dir.display()
            )));
        }

        self.classes
            .insert(storage_class.to_string(), ClassConfig { host_dir });
        Ok(())
    }

    fn ensure_not_empty(&self) -> Result<()> {
        if self.classes.is_empty() {
            return Err(Error::Configuration(
                "discovery config defines no storage classes".into(),
            ));
        }
        Ok(())
    }

    /// Discovery roots as (storage class, host dir)
    pub fn roots(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.classes
            .iter()
            .map(|(class, c)| (class.as_str(), c.host_dir.as_path()))
    }

    /// Whether a storage class is served by this node
    pub fn manages(&self, storage_class: &str) -> bool {
        self.classes.contains_key(storage_class)
    }

    pub fn storage_classes(&self) -> Vec<&str> {
        self.classes.keys().map(String::as_str).collect()
    }

    /// Render back into config map data
    pub fn to_config_map_data(&self) -> Result<BTreeMap<String, String>> {
        self.classes
            .iter()
            .map(|(class, c)| Ok::<_, Error>((class.clone(), serde_json::to_string(c)?)))
            .collect()
    }
}

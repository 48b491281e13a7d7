//! Directory Scanner
//!
//! Lists the subdirectories of every configured discovery root on the local
//! node and feeds the differences into the volume registry: new paths are
//! registered and measured, vanished paths are removed.

use super::DiscoveryConfig;
use crate::domain::{DiscoveredPath, HostFsRef, NodeName, VolumeKey, VolumePhase, VolumeRecord};
use crate::error::Error;
use crate::registry::VolumeRegistry;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Scan Report
// =============================================================================

/// Outcome of one scan pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    /// Paths registered for the first time in this generation
    pub discovered: usize,
    /// Records whose capacity was measured
    pub available: usize,
    /// Records removed because their directory vanished
    pub removed: usize,
    /// Records whose capacity check failed permanently
    pub failed: usize,
    /// Roots that could not be listed
    pub root_errors: usize,
}

// =============================================================================
// Directory Scanner
// =============================================================================

/// Scans discovery roots on one node
pub struct DirectoryScanner {
    node: NodeName,
    registry: Arc<VolumeRegistry>,
    host_fs: HostFsRef,
    config: RwLock<DiscoveryConfig>,
}

impl DirectoryScanner {
    pub fn new(
        node: NodeName,
        registry: Arc<VolumeRegistry>,
        host_fs: HostFsRef,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            node,
            registry,
            host_fs,
            config: RwLock::new(config),
        }
    }

    /// Replace the discovery configuration for subsequent passes
    pub fn update_config(&self, config: DiscoveryConfig) {
        info!(classes = ?config.storage_classes(), "Discovery configuration updated");
        *self.config.write() = config;
    }

    pub fn config(&self) -> DiscoveryConfig {
        self.config.read().clone()
    }

    /// Run one pass over every discovery root
    pub async fn scan_once(&self) -> ScanReport {
        let roots: Vec<(String, std::path::PathBuf)> = self
            .config
            .read()
            .roots()
            .map(|(class, dir)| (class.to_string(), dir.to_path_buf()))
            .collect();

        let mut report = ScanReport::default();
        for (storage_class, root) in roots {
            self.scan_root(&storage_class, &root, &mut report).await;
        }

        if report.discovered > 0 || report.removed > 0 || report.failed > 0 {
            info!(
                discovered = report.discovered,
                removed = report.removed,
                failed = report.failed,
                "Scan pass complete"
            );
        } else {
            debug!(?report, "Scan pass complete");
        }
        report
    }

    async fn scan_root(&self, storage_class: &str, root: &Path, report: &mut ScanReport) {
        let listed = match self.host_fs.list_subdirs(root).await {
            Ok(listed) => listed,
            Err(e) => {
                // Skip the removal diff: an unreadable root says nothing
                // about whether its volumes still exist
                warn!(root = %root.display(), error = %e, "Failed to list discovery root");
                report.root_errors += 1;
                return;
            }
        };

        let mut seen = HashSet::with_capacity(listed.len());
        for path in listed {
            let source = DiscoveredPath::new(self.node.clone(), &path, root, storage_class);
            seen.insert(source.key());

            let upserted = self.registry.upsert(source);
            if upserted.created {
                report.discovered += 1;
            }
            if upserted.record.phase == VolumePhase::Pending {
                self.measure(&upserted.record, report).await;
            }
        }

        for key in self.registry.paths_under(&self.node, root) {
            if !seen.contains(&key) {
                self.remove_vanished(&key, report);
            }
        }
    }

    /// Measure a Pending record and move it to Available or Failed
    async fn measure(&self, record: &VolumeRecord, report: &mut ScanReport) {
        match self.host_fs.capacity_bytes(record.path()).await {
            Ok(capacity) => match self.registry.mark_available(&record.id, capacity) {
                Ok(_) => report.available += 1,
                Err(e) => debug!(volume = %record.id, error = %e, "Record changed during capacity check"),
            },
            Err(e) if e.is_transient() => {
                warn!(
                    volume = %record.id,
                    path = %record.path().display(),
                    error = %e,
                    "Capacity check failed, will retry"
                );
            }
            Err(e) => match self.registry.mark_failed(&record.id, e.to_string()) {
                Ok(_) => report.failed += 1,
                Err(e) => debug!(volume = %record.id, error = %e, "Record changed during capacity check"),
            },
        }
    }

    fn remove_vanished(&self, key: &VolumeKey, report: &mut ScanReport) {
        match self.registry.remove(key) {
            Ok(Some(_)) => report.removed += 1,
            Ok(None) => {}
            // Bound and Released paths are left to the recreation cycle
            Err(Error::InvariantViolation { .. }) => {}
            Err(e) => warn!(path = %key, error = %e, "Failed to remove vanished volume"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClaimRecord, VolumeKey};
    use crate::registry::BindOutcome;
    use crate::testing::{discovery_root, host_fs, FakeDfExecutor, TEST_CLASS, TEST_NODE};

    const CAPACITY: u64 = 64 * 1024 * 1024;

    fn scanner(config: DiscoveryConfig, executor: Arc<FakeDfExecutor>) -> (DirectoryScanner, Arc<VolumeRegistry>) {
        let registry = VolumeRegistry::new();
        let scanner = DirectoryScanner::new(TEST_NODE.into(), registry.clone(), host_fs(executor), config);
        (scanner, registry)
    }

    fn root_of(config: &DiscoveryConfig) -> std::path::PathBuf {
        config.roots().next().map(|(_, p)| p.to_path_buf()).unwrap()
    }

    #[tokio::test]
    async fn test_scan_discovers_and_measures() {
        let (_dir, config) = discovery_root();
        let root = root_of(&config);
        std::fs::create_dir(root.join("vol-a")).unwrap();
        std::fs::create_dir(root.join("vol-b")).unwrap();
        std::fs::write(root.join("stray-file"), b"x").unwrap();

        let (scanner, registry) = scanner(config, FakeDfExecutor::with_capacity(CAPACITY));
        let report = scanner.scan_once().await;

        assert_eq!(report.discovered, 2);
        assert_eq!(report.available, 2);
        let record = registry
            .get_by_path(&VolumeKey::new(TEST_NODE, root.join("vol-a")))
            .unwrap();
        assert_eq!(record.phase, VolumePhase::Available);
        assert_eq!(record.capacity_bytes, CAPACITY);
        assert_eq!(record.storage_class(), TEST_CLASS);
    }

    #[tokio::test]
    async fn test_rescan_reports_each_path_once() {
        let (_dir, config) = discovery_root();
        std::fs::create_dir(root_of(&config).join("vol-a")).unwrap();

        let (scanner, registry) = scanner(config, FakeDfExecutor::with_capacity(CAPACITY));
        assert_eq!(scanner.scan_once().await.discovered, 1);
        assert_eq!(scanner.scan_once().await, ScanReport::default());
        assert_eq!(registry.stats().discoveries, 1);
    }

    #[tokio::test]
    async fn test_vanished_path_is_removed() {
        let (_dir, config) = discovery_root();
        let root = root_of(&config);
        std::fs::create_dir(root.join("vol-a")).unwrap();

        let (scanner, registry) = scanner(config, FakeDfExecutor::with_capacity(CAPACITY));
        scanner.scan_once().await;

        std::fs::remove_dir(root.join("vol-a")).unwrap();
        let report = scanner.scan_once().await;

        assert_eq!(report.removed, 1);
        assert_eq!(registry.stats().total_volumes, 0);
    }

    #[tokio::test]
    async fn test_bound_path_survives_disappearance() {
        let (_dir, config) = discovery_root();
        let root = root_of(&config);
        std::fs::create_dir(root.join("vol-a")).unwrap();

        let (scanner, registry) = scanner(config, FakeDfExecutor::with_capacity(CAPACITY));
        scanner.scan_once().await;
        let record = registry
            .get_by_path(&VolumeKey::new(TEST_NODE, root.join("vol-a")))
            .unwrap();
        registry.mark_published(&record.id).unwrap();
        registry.insert_claim(ClaimRecord::pending("ns/pvc".into(), TEST_CLASS, 1024));
        assert!(matches!(
            registry.bind(&record.id, &"ns/pvc".into()),
            Ok(BindOutcome::Bound(_))
        ));

        std::fs::remove_dir(root.join("vol-a")).unwrap();
        let report = scanner.scan_once().await;

        assert_eq!(report.removed, 0);
        assert_eq!(registry.get(&record.id).unwrap().phase, VolumePhase::Bound);
        assert_eq!(registry.stats().refused_removals, 1);
    }

    #[tokio::test]
    async fn test_capacity_failure_marks_failed() {
        let (_dir, config) = discovery_root();
        let root = root_of(&config);
        std::fs::create_dir(root.join("vol-bad")).unwrap();

        let executor = FakeDfExecutor::with_capacity(CAPACITY);
        executor.poison(&root.join("vol-bad"));
        let (scanner, registry) = scanner(config, executor);

        let report = scanner.scan_once().await;
        assert_eq!(report.failed, 1);

        let record = registry
            .get_by_path(&VolumeKey::new(TEST_NODE, root.join("vol-bad")))
            .unwrap();
        assert_eq!(record.phase, VolumePhase::Failed);
        assert!(record.failure.is_some());

        // Failed records are not measured again
        assert_eq!(scanner.scan_once().await.failed, 0);
    }

    #[tokio::test]
    async fn test_unreadable_root_does_not_stop_others() {
        let (dir, mut config) = discovery_root();
        let root = root_of(&config);
        std::fs::create_dir(root.join("vol-a")).unwrap();
        config.insert("missing-class", dir.path().join("missing")).unwrap();

        let (scanner, registry) = scanner(config, FakeDfExecutor::with_capacity(CAPACITY));
        let report = scanner.scan_once().await;

        assert_eq!(report.root_errors, 1);
        assert_eq!(report.discovered, 1);
        assert_eq!(registry.stats().available, 1);
    }

    #[tokio::test]
    async fn test_root_error_keeps_existing_records() {
        let (dir, config) = discovery_root();
        let root = root_of(&config);
        std::fs::create_dir(root.join("vol-a")).unwrap();

        let (scanner, registry) = scanner(config, FakeDfExecutor::with_capacity(CAPACITY));
        scanner.scan_once().await;

        std::fs::rename(&root, dir.path().join("moved")).unwrap();
        let report = scanner.scan_once().await;

        assert_eq!(report.root_errors, 1);
        assert_eq!(report.removed, 0);
        assert_eq!(registry.stats().total_volumes, 1);
    }
}

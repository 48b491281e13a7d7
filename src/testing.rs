//! Shared fixtures for unit tests

use crate::discovery::{DiscoveryConfig, LocalHostFs};
use crate::domain::{ExecOutput, HostFsRef, NodeExecutor};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub const TEST_NODE: &str = "node-1";
pub const TEST_CLASS: &str = "local-volume-test-storageclass";

/// Executor answering `df` with a fixed size; commands mentioning a
/// poisoned path exit non-zero
#[derive(Default)]
pub struct FakeDfExecutor {
    pub kib: u64,
    poisoned: Mutex<HashSet<String>>,
}

impl FakeDfExecutor {
    pub fn with_capacity(bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            kib: bytes / 1024,
            poisoned: Mutex::new(HashSet::new()),
        })
    }

    pub fn poison(&self, path: &Path) {
        self.poisoned.lock().insert(path.display().to_string());
    }
}

#[async_trait]
impl NodeExecutor for FakeDfExecutor {
    async fn exec(&self, _node: &str, command: &str) -> Result<ExecOutput> {
        if self.poisoned.lock().iter().any(|p| command.contains(p.as_str())) {
            return Ok(ExecOutput {
                stderr: "df: Permission denied".into(),
                code: 1,
                ..Default::default()
            });
        }
        Ok(ExecOutput {
            stdout: format!(
                "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                 tmpfs {} 0 {} 0% /tmp\n",
                self.kib, self.kib
            ),
            ..Default::default()
        })
    }
}

/// Host filesystem over a temp dir with faked `df` capacity
pub fn host_fs(executor: Arc<FakeDfExecutor>) -> HostFsRef {
    Arc::new(LocalHostFs::new(TEST_NODE.into(), executor))
}

/// Temp dir with a `disks` discovery root configured for the test class
pub fn discovery_root() -> (TempDir, DiscoveryConfig) {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path().join("disks");
    std::fs::create_dir_all(&root).expect("create discovery root");

    let mut config = DiscoveryConfig::default();
    config.insert(TEST_CLASS, root).expect("valid discovery root");
    (dir, config)
}

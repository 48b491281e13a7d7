//! Domain Ports - Core trait definitions for the volume manager
//!
//! These traits define the boundaries between the lifecycle logic and the
//! cluster API, the node execution interface and the host filesystem.
//! Adapters implement these traits to provide concrete functionality.

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, ObjectReference, PersistentVolume, PersistentVolumeClaim,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

// =============================================================================
// Cluster API Port
// =============================================================================

/// Port for cluster resource operations
///
/// Create and delete are idempotent: creating an existing volume and deleting
/// a missing one both succeed.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Get a node by name
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Get a config map by namespace and name
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap>;

    /// Create a persistent volume
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<()>;

    /// Delete a persistent volume
    async fn delete_volume(&self, name: &str) -> Result<()>;

    /// List persistent volumes matching a label selector
    async fn list_volumes(&self, label_selector: &str) -> Result<Vec<PersistentVolume>>;

    /// List claims across all namespaces
    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>>;

    /// Get a claim by namespace and name
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim>;

    /// Set or clear the claim reference of a volume
    async fn set_volume_claim_ref(
        &self,
        volume: &str,
        claim_ref: Option<ObjectReference>,
    ) -> Result<()>;

    /// Point a claim at a volume
    async fn set_claim_volume(&self, namespace: &str, claim: &str, volume: &str) -> Result<()>;

    /// Record a binding on both the volume and the claim.
    ///
    /// The volume side is written first. When the claim side then fails, the
    /// volume's claim reference is cleared again, so a failed bind leaves
    /// neither object pointing at the other.
    async fn bind_claim(&self, namespace: &str, claim: &str, volume: &str) -> Result<()> {
        let pvc = self.get_claim(namespace, claim).await?;
        let claim_ref = ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("PersistentVolumeClaim".to_string()),
            namespace: Some(namespace.to_string()),
            name: Some(claim.to_string()),
            uid: pvc.metadata.uid,
            ..Default::default()
        };
        self.set_volume_claim_ref(volume, Some(claim_ref)).await?;

        if let Err(e) = self.set_claim_volume(namespace, claim, volume).await {
            if let Err(undo) = self.set_volume_claim_ref(volume, None).await {
                warn!(
                    volume,
                    claim = %format!("{}/{}", namespace, claim),
                    error = %undo,
                    "Failed to clear claim reference after partial bind"
                );
            }
            return Err(e);
        }
        Ok(())
    }
}

// =============================================================================
// Node Execution Port
// =============================================================================

/// Output of a command run on a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Port for running shell commands on a named node
///
/// No retries happen behind this port.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn exec(&self, node: &str, command: &str) -> Result<ExecOutput>;
}

// =============================================================================
// Host Filesystem Port
// =============================================================================

/// Port for the host filesystem that backs discovered volumes
#[async_trait]
pub trait HostFs: Send + Sync {
    /// List immediate subdirectories of a discovery root
    async fn list_subdirs(&self, root: &Path) -> Result<Vec<PathBuf>>;

    /// Capacity of the filesystem holding `path`, in bytes
    async fn capacity_bytes(&self, path: &Path) -> Result<u64>;

    /// Remove everything under `path`, keeping the directory itself
    async fn clear(&self, path: &Path) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterApiRef = Arc<dyn ClusterApi>;
pub type NodeExecutorRef = Arc<dyn NodeExecutor>;
pub type HostFsRef = Arc<dyn HostFs>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput {
            stdout: "done".into(),
            ..Default::default()
        };
        assert!(ok.success());

        let failed = ExecOutput {
            code: 1,
            stderr: "No such file or directory".into(),
            ..Default::default()
        };
        assert!(!failed.success());
    }
}

//! Volume Object Manager
//!
//! Publishes registry records as cluster persistent volumes and keeps the
//! set of published volumes owned by this node in step with the registry.

use super::affinity::NodeAffinity;
use super::quantity::{format_capacity, parse_capacity};
use crate::cluster::{with_retry, RetryPolicy};
use crate::domain::{
    ClaimId, ClusterApiRef, DiscoveredPath, NodeName, VolumeId, VolumePhase, VolumeRecord,
};
use crate::error::{Error, Result};
use crate::registry::VolumeRegistry;
use chrono::Utc;
use k8s_openapi::api::core::v1::{LocalVolumeSource, PersistentVolume, PersistentVolumeSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Labels and Annotations
// =============================================================================

/// Label naming the node that owns a volume
pub const NODE_LABEL: &str = "local-volume.io/node";

/// Label carrying the discovery generation of a volume
pub const GENERATION_LABEL: &str = "local-volume.io/generation";

/// Annotation recording the discovery root a volume was found under
pub const DISCOVERY_ROOT_ANNOTATION: &str = "local-volume.io/discovery-root";

/// Standard provisioner annotation
pub const PROVISIONED_BY_ANNOTATION: &str = "pv.kubernetes.io/provisioned-by";

/// Provisioner name written into published volumes
pub const PROVISIONER_NAME: &str = "local-volume-manager";

// =============================================================================
// Publish Report
// =============================================================================

/// Outcome of one publication pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReport {
    pub published: usize,
    pub deleted: usize,
    /// Owned objects without a record kept because a claim still holds them
    pub retained: usize,
    pub errors: usize,
}

// =============================================================================
// Volume Object Manager
// =============================================================================

/// Creates and deletes the cluster volume object of each record
pub struct VolumeObjectManager {
    node: NodeName,
    affinity: NodeAffinity,
    cluster: ClusterApiRef,
    registry: Arc<VolumeRegistry>,
    retry: RetryPolicy,
    /// Owned objects that could not be adopted; never deleted
    quarantined: RwLock<HashSet<String>>,
}

impl VolumeObjectManager {
    /// Read the owning node's labels and build the manager.
    ///
    /// Fails with [`Error::MissingNodeLabel`] when the node lacks `label_key`.
    pub async fn new(
        node: NodeName,
        label_key: &str,
        cluster: ClusterApiRef,
        registry: Arc<VolumeRegistry>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let node_object = with_retry(&retry, "get node", || cluster.get_node(node.as_str())).await?;
        let affinity = NodeAffinity::from_node(&node_object, label_key)?;
        info!(node = %node, %affinity, "Volumes will be pinned to node");

        Ok(Self {
            node,
            affinity,
            cluster,
            registry,
            retry,
            quarantined: RwLock::new(HashSet::new()),
        })
    }

    pub fn affinity(&self) -> &NodeAffinity {
        &self.affinity
    }

    /// Label selector matching every volume owned by this node
    pub fn owned_selector(&self) -> String {
        format!("{}={}", NODE_LABEL, self.node)
    }

    /// Render the cluster object for a record
    pub fn build_volume(&self, record: &VolumeRecord) -> PersistentVolume {
        let labels = BTreeMap::from([
            (NODE_LABEL.to_string(), self.node.to_string()),
            (GENERATION_LABEL.to_string(), record.generation.to_string()),
        ]);
        let annotations = BTreeMap::from([
            (PROVISIONED_BY_ANNOTATION.to_string(), PROVISIONER_NAME.to_string()),
            (
                DISCOVERY_ROOT_ANNOTATION.to_string(),
                record.source.root.display().to_string(),
            ),
        ]);

        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(record.id.to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                capacity: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(format_capacity(record.capacity_bytes)),
                )])),
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                persistent_volume_reclaim_policy: Some("Delete".to_string()),
                storage_class_name: Some(record.storage_class().to_string()),
                volume_mode: Some("Filesystem".to_string()),
                local: Some(LocalVolumeSource {
                    path: record.path().display().to_string(),
                    fs_type: None,
                }),
                node_affinity: Some(self.affinity.to_volume_node_affinity()),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Publish unpublished records and delete owned volumes with no record
    pub async fn reconcile(&self) -> Result<PublishReport> {
        let mut report = PublishReport::default();

        for record in self.registry.records() {
            if record.published || !record.phase.is_live() {
                continue;
            }
            match self.publish(&record).await {
                Ok(()) => report.published += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(volume = %record.id, error = %e, "Failed to publish volume");
                    report.errors += 1;
                }
            }
        }

        let selector = self.owned_selector();
        let published = with_retry(&self.retry, "list volumes", || {
            self.cluster.list_volumes(&selector)
        })
        .await?;

        for pv in published {
            let Some(name) = pv.metadata.name.clone() else { continue };
            if self.registry.get(&VolumeId(name.clone())).is_some()
                || self.quarantined.read().contains(&name)
            {
                continue;
            }
            if bound_in_cluster(&pv) {
                warn!(volume = %name, "Keeping claimed volume object that has no record");
                report.retained += 1;
                continue;
            }
            match self.unpublish(&VolumeId(name.clone())).await {
                Ok(()) => {
                    info!(volume = %name, "Deleted orphaned volume object");
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!(volume = %name, error = %e, "Failed to delete orphaned volume object");
                    report.errors += 1;
                }
            }
        }

        if report != PublishReport::default() {
            debug!(?report, "Publication pass complete");
        }
        Ok(report)
    }

    async fn publish(&self, record: &VolumeRecord) -> Result<()> {
        let pv = self.build_volume(record);
        with_retry(&self.retry, "create volume", || self.cluster.create_volume(&pv)).await?;
        self.registry.mark_published(&record.id)?;
        info!(
            volume = %record.id,
            path = %record.path().display(),
            capacity = %format_capacity(record.capacity_bytes),
            "Published volume"
        );
        Ok(())
    }

    /// Delete the cluster object of a volume; deleting a missing one succeeds
    pub async fn unpublish(&self, id: &VolumeId) -> Result<()> {
        with_retry(&self.retry, "delete volume", || {
            self.cluster.delete_volume(id.as_str())
        })
        .await
    }

    /// Rebuild registry records from volumes this node published earlier.
    ///
    /// A volume that cannot be adopted (pinned to another node, a second
    /// volume for one path, unreadable spec) is quarantined: its object is
    /// never deleted and its path is held so it is not republished.
    pub async fn adopt_existing(&self) -> Result<usize> {
        let selector = self.owned_selector();
        let published = with_retry(&self.retry, "list volumes", || {
            self.cluster.list_volumes(&selector)
        })
        .await?;

        let mut adopted = 0;
        for pv in &published {
            let Some(name) = pv.metadata.name.as_deref() else { continue };
            match self
                .record_from_volume(pv)
                .and_then(|record| self.registry.adopt(record))
            {
                Ok(_) => adopted += 1,
                Err(e) => self.quarantine(pv, name, &e),
            }
        }

        info!(adopted, quarantined = self.quarantined.read().len(), "Adopted previously published volumes");
        Ok(adopted)
    }

    /// Names of owned objects held back from adoption and deletion
    pub fn quarantined(&self) -> Vec<String> {
        let mut names: Vec<String> = self.quarantined.read().iter().cloned().collect();
        names.sort();
        names
    }

    fn quarantine(&self, pv: &PersistentVolume, name: &str, cause: &Error) {
        warn!(volume = %name, error = %cause, "Volume cannot be adopted, quarantining it");
        self.quarantined.write().insert(name.to_string());

        let Some(record) = self.held_record(pv) else { return };
        if let Err(e) = self.registry.quarantine(record, cause.to_string()) {
            // Another volume already holds the path
            debug!(volume = %name, error = %e, "Path of quarantined volume already tracked");
        }
    }

    /// The parts of a published volume needed to hold its path
    fn held_record(&self, pv: &PersistentVolume) -> Option<VolumeRecord> {
        let spec = pv.spec.as_ref()?;
        let path = PathBuf::from(&spec.local.as_ref()?.path);
        let root = discovery_root(pv, &path)?;
        let storage_class = spec.storage_class_name.clone().unwrap_or_default();

        let mut record = VolumeRecord::pending(
            DiscoveredPath::new(self.node.clone(), path, root, storage_class),
            generation_of(pv),
        );
        record.id = VolumeId(pv.metadata.name.clone()?);
        record.claim = claim_of(pv);
        Some(record)
    }

    fn record_from_volume(&self, pv: &PersistentVolume) -> Result<VolumeRecord> {
        let name = pv.metadata.name.clone().unwrap_or_default();
        let invalid = |what: &str| Error::InvariantViolation {
            subject: name.clone(),
            reason: format!("published volume has no {}", what),
        };

        let spec = pv.spec.as_ref().ok_or_else(|| invalid("spec"))?;
        let affinity = spec
            .node_affinity
            .as_ref()
            .ok_or_else(|| Error::InvalidAffinity(format!("{} has no node affinity", name)))
            .and_then(NodeAffinity::from_volume_node_affinity)?;
        if affinity != self.affinity {
            return Err(Error::InvalidAffinity(format!(
                "{} is pinned to {}, not {}",
                name, affinity, self.affinity
            )));
        }

        let path = PathBuf::from(&spec.local.as_ref().ok_or_else(|| invalid("local path"))?.path);
        let storage_class = spec
            .storage_class_name
            .clone()
            .ok_or_else(|| invalid("storage class"))?;
        let capacity_bytes = spec
            .capacity
            .as_ref()
            .and_then(|c| c.get("storage"))
            .map(|q| parse_capacity(&q.0))
            .transpose()?
            .ok_or_else(|| invalid("capacity"))?;
        let root = discovery_root(pv, &path).ok_or_else(|| invalid("discovery root"))?;

        let claim = claim_of(pv);
        let released = pv
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            == Some("Released");
        let phase = match (&claim, released) {
            (Some(_), true) => VolumePhase::Released,
            (Some(_), false) => VolumePhase::Bound,
            (None, _) => VolumePhase::Available,
        };

        Ok(VolumeRecord {
            id: VolumeId(name),
            source: DiscoveredPath::new(self.node.clone(), path, root, storage_class),
            capacity_bytes,
            phase,
            claim,
            published: true,
            generation: generation_of(pv),
            discovered_at: pv
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .unwrap_or_else(Utc::now),
            failure: None,
        })
    }
}

impl std::fmt::Debug for VolumeObjectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeObjectManager")
            .field("node", &self.node)
            .field("affinity", &self.affinity)
            .finish_non_exhaustive()
    }
}

fn discovery_root(pv: &PersistentVolume, path: &Path) -> Option<PathBuf> {
    pv.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DISCOVERY_ROOT_ANNOTATION))
        .map(PathBuf::from)
        .or_else(|| path.parent().map(Path::to_path_buf))
}

fn generation_of(pv: &PersistentVolume) -> u64 {
    pv.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(GENERATION_LABEL))
        .and_then(|g| g.parse().ok())
        .unwrap_or(1)
}

fn claim_of(pv: &PersistentVolume) -> Option<ClaimId> {
    let claim_ref = pv.spec.as_ref()?.claim_ref.as_ref()?;
    Some(ClaimId::new(
        claim_ref.namespace.as_deref()?,
        claim_ref.name.as_deref()?,
    ))
}

/// Whether the cluster shows a claim holding the volume
fn bound_in_cluster(pv: &PersistentVolume) -> bool {
    let released = pv.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Released");
    claim_of(pv).is_some() && !released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use crate::domain::{ClaimRecord, ClusterApi};
    use crate::volumes::DEFAULT_NODE_LABEL_KEY;
    use assert_matches::assert_matches;

    async fn setup() -> (Arc<MemoryCluster>, Arc<VolumeRegistry>, VolumeObjectManager) {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_node("node-1", &[(DEFAULT_NODE_LABEL_KEY, "node-1")]);
        let registry = VolumeRegistry::new();
        let manager = VolumeObjectManager::new(
            "node-1".into(),
            DEFAULT_NODE_LABEL_KEY,
            cluster.clone(),
            registry.clone(),
            RetryPolicy::quick(),
        )
        .await
        .unwrap();
        (cluster, registry, manager)
    }

    fn available(registry: &VolumeRegistry, path: &str) -> VolumeRecord {
        let source = DiscoveredPath::new("node-1".into(), path, "/tmp/disks", "local-sc");
        let upserted = registry.upsert(source);
        registry.mark_available(&upserted.record.id, 1 << 30).unwrap()
    }

    #[tokio::test]
    async fn test_missing_node_label_is_fatal() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_node("node-1", &[("zone", "a")]);

        let result = VolumeObjectManager::new(
            "node-1".into(),
            DEFAULT_NODE_LABEL_KEY,
            cluster,
            VolumeRegistry::new(),
            RetryPolicy::quick(),
        )
        .await;

        assert_matches!(result, Err(Error::MissingNodeLabel { .. }));
    }

    #[tokio::test]
    async fn test_build_volume() {
        let (_, registry, manager) = setup().await;
        let record = available(&registry, "/tmp/disks/vol-a");

        let pv = manager.build_volume(&record);
        let spec = pv.spec.as_ref().unwrap();

        assert_eq!(pv.metadata.name.as_deref(), Some(record.id.as_str()));
        assert_eq!(spec.local.as_ref().unwrap().path, "/tmp/disks/vol-a");
        assert_eq!(spec.capacity.as_ref().unwrap()["storage"].0, "1Gi");
        assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some("Delete"));
        assert_eq!(spec.storage_class_name.as_deref(), Some("local-sc"));
        assert_eq!(pv.metadata.labels.as_ref().unwrap()[NODE_LABEL], "node-1");
        assert_eq!(pv.metadata.labels.as_ref().unwrap()[GENERATION_LABEL], "1");

        let affinity =
            NodeAffinity::from_volume_node_affinity(spec.node_affinity.as_ref().unwrap()).unwrap();
        assert_eq!(&affinity, manager.affinity());
    }

    #[tokio::test]
    async fn test_reconcile_publishes_and_marks() {
        let (cluster, registry, manager) = setup().await;
        let record = available(&registry, "/tmp/disks/vol-a");
        // Pending records are not published
        registry.upsert(DiscoveredPath::new("node-1".into(), "/tmp/disks/vol-b", "/tmp/disks", "local-sc"));

        let report = manager.reconcile().await.unwrap();

        assert_eq!(report.published, 1);
        assert!(registry.get(&record.id).unwrap().published);
        assert_eq!(cluster.volume_names(), vec![record.id.to_string()]);

        // Second pass is a no-op
        assert_eq!(manager.reconcile().await.unwrap(), PublishReport::default());
    }

    #[tokio::test]
    async fn test_reconcile_deletes_orphans() {
        let (cluster, registry, manager) = setup().await;
        let record = available(&registry, "/tmp/disks/vol-a");
        manager.reconcile().await.unwrap();

        registry.remove(&record.key()).unwrap();
        let report = manager.reconcile().await.unwrap();

        assert_eq!(report.deleted, 1);
        assert!(cluster.volume_names().is_empty());
    }

    #[tokio::test]
    async fn test_unpublish_is_idempotent() {
        let (_, _, manager) = setup().await;
        manager.unpublish(&"local-pv-missing".into()).await.unwrap();
    }

    #[tokio::test]
    async fn test_adopt_existing_restores_records() {
        let (cluster, registry, manager) = setup().await;
        let record = available(&registry, "/tmp/disks/vol-a");
        manager.reconcile().await.unwrap();

        // Bind it in the cluster, as a previous run would have
        registry.insert_claim(ClaimRecord::pending("ns/pvc".into(), "local-sc", 1024));
        registry.bind(&record.id, &"ns/pvc".into()).unwrap();
        cluster.create_claim("ns", "pvc", "local-sc", "10Mi");
        cluster.bind_claim("ns", "pvc", record.id.as_str()).await.unwrap();

        let fresh = VolumeRegistry::new();
        let restarted = VolumeObjectManager::new(
            "node-1".into(),
            DEFAULT_NODE_LABEL_KEY,
            cluster.clone(),
            fresh.clone(),
            RetryPolicy::quick(),
        )
        .await
        .unwrap();

        assert_eq!(restarted.adopt_existing().await.unwrap(), 1);
        let adopted = fresh.get(&record.id).unwrap();
        assert_eq!(adopted.phase, VolumePhase::Bound);
        assert_eq!(adopted.claim, Some("ns/pvc".into()));
        assert_eq!(adopted.capacity_bytes, 1 << 30);
        assert_eq!(adopted.source.root, PathBuf::from("/tmp/disks"));
        assert!(adopted.published);
    }

    #[tokio::test]
    async fn test_adopt_skips_foreign_affinity() {
        let (cluster, registry, manager) = setup().await;
        let record = available(&registry, "/tmp/disks/vol-a");

        let mut pv = manager.build_volume(&record);
        let foreign = NodeAffinity::for_node(
            "node-2",
            &BTreeMap::from([(DEFAULT_NODE_LABEL_KEY.to_string(), "node-2".to_string())]),
            DEFAULT_NODE_LABEL_KEY,
        )
        .unwrap();
        pv.spec.as_mut().unwrap().node_affinity = Some(foreign.to_volume_node_affinity());
        cluster.create_volume(&pv).await.unwrap();

        let fresh = VolumeRegistry::new();
        let restarted = VolumeObjectManager::new(
            "node-1".into(),
            DEFAULT_NODE_LABEL_KEY,
            cluster.clone(),
            fresh.clone(),
            RetryPolicy::quick(),
        )
        .await
        .unwrap();

        assert_eq!(restarted.adopt_existing().await.unwrap(), 0);
        assert_eq!(restarted.quarantined(), vec![record.id.to_string()]);
        let held = fresh.get(&record.id).unwrap();
        assert_eq!(held.phase, VolumePhase::Failed);
        assert!(fresh.is_quarantined(&record.key()));

        // The object is neither deleted nor republished
        let report = restarted.reconcile().await.unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(report.published, 0);
        assert_eq!(cluster.volume_names(), vec![record.id.to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_volume_for_path_quarantined() {
        let (cluster, registry, manager) = setup().await;
        let record = available(&registry, "/tmp/disks/vol-a");
        manager.reconcile().await.unwrap();

        let mut twin = manager.build_volume(&record);
        twin.metadata.name = Some("local-pv-twin".to_string());
        cluster.create_volume(&twin).await.unwrap();

        let fresh = VolumeRegistry::new();
        let restarted = VolumeObjectManager::new(
            "node-1".into(),
            DEFAULT_NODE_LABEL_KEY,
            cluster.clone(),
            fresh.clone(),
            RetryPolicy::quick(),
        )
        .await
        .unwrap();

        assert_eq!(restarted.adopt_existing().await.unwrap(), 1);
        assert_eq!(restarted.quarantined().len(), 1);
        assert_eq!(fresh.stats().total_volumes, 1);

        restarted.reconcile().await.unwrap();
        assert_eq!(cluster.volume_names().len(), 2);
    }

    #[tokio::test]
    async fn test_claimed_object_without_record_retained() {
        let (cluster, registry, manager) = setup().await;
        let record = available(&registry, "/tmp/disks/vol-a");
        manager.reconcile().await.unwrap();
        cluster.create_claim("ns", "pvc", "local-sc", "10Mi");
        cluster.bind_claim("ns", "pvc", record.id.as_str()).await.unwrap();

        registry.remove(&record.key()).unwrap();
        let report = manager.reconcile().await.unwrap();

        assert_eq!(report.retained, 1);
        assert_eq!(report.deleted, 0);
        assert!(cluster.volume(record.id.as_str()).is_some());
    }
}

//! In-Memory Cluster
//!
//! A [`ClusterApi`] holding nodes, config maps, volumes and claims in
//! process memory. Backs standalone mode and the test suites.

use crate::domain::{ClaimId, ClusterApi};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, PersistentVolumeStatus,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

type NamespacedKey = (String, String);

/// Cluster state kept in memory
#[derive(Default)]
pub struct MemoryCluster {
    nodes: RwLock<BTreeMap<String, Node>>,
    config_maps: RwLock<BTreeMap<NamespacedKey, ConfigMap>>,
    volumes: RwLock<BTreeMap<String, PersistentVolume>>,
    claims: RwLock<BTreeMap<NamespacedKey, PersistentVolumeClaim>>,
    reject_binds: AtomicBool,
    reject_claim_updates: AtomicBool,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node with labels
    pub fn add_node(&self, name: &str, labels: &[(&str, &str)]) {
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        self.nodes.write().insert(name.to_string(), node);
    }

    /// Create or replace a config map
    pub fn put_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        self.config_maps
            .write()
            .insert((namespace.to_string(), name.to_string()), config_map);
    }

    /// Create a Pending claim requesting `request` (e.g. `10Mi`)
    pub fn create_claim(
        &self,
        namespace: &str,
        name: &str,
        storage_class: &str,
        request: &str,
    ) -> ClaimId {
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some(uuid::Uuid::new_v4().to_string()),
                creation_timestamp: Some(Time(Utc::now())),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: Some(storage_class.to_string()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(request.to_string()),
                    )])),
                    limits: None,
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            }),
        };
        self.claims
            .write()
            .insert((namespace.to_string(), name.to_string()), claim);
        ClaimId::new(namespace, name)
    }

    /// Create a Pending claim that already names `volume`
    pub fn create_prebound_claim(
        &self,
        namespace: &str,
        name: &str,
        storage_class: &str,
        request: &str,
        volume: &str,
    ) -> ClaimId {
        let claim_id = self.create_claim(namespace, name, storage_class, request);
        if let Some(pvc) = self
            .claims
            .write()
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            pvc.spec.get_or_insert_with(Default::default).volume_name = Some(volume.to_string());
        }
        claim_id
    }

    /// Delete a claim; a volume bound to it becomes Released
    pub fn delete_claim(&self, namespace: &str, name: &str) -> bool {
        let removed = self
            .claims
            .write()
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some();

        if removed {
            for pv in self.volumes.write().values_mut() {
                let bound_here = pv
                    .spec
                    .as_ref()
                    .and_then(|s| s.claim_ref.as_ref())
                    .map(|r| {
                        r.namespace.as_deref() == Some(namespace) && r.name.as_deref() == Some(name)
                    })
                    .unwrap_or(false);
                if bound_here {
                    pv.status = Some(PersistentVolumeStatus {
                        phase: Some("Released".to_string()),
                        ..Default::default()
                    });
                }
            }
        }
        removed
    }

    /// Make every subsequent bind write fail until cleared
    pub fn reject_binds(&self, reject: bool) {
        self.reject_binds.store(reject, Ordering::SeqCst);
    }

    /// Make the claim side of every subsequent bind fail until cleared
    pub fn reject_claim_updates(&self, reject: bool) {
        self.reject_claim_updates.store(reject, Ordering::SeqCst);
    }

    /// Names of all volume objects
    pub fn volume_names(&self) -> Vec<String> {
        self.volumes.read().keys().cloned().collect()
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.volumes.read().get(name).cloned()
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.claims
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

/// Equality-only label selector match (`a=b,c=d`)
fn selector_matches(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => {
                labels.and_then(|l| l.get(key.trim())).map(String::as_str) == Some(value.trim())
            }
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Node".into(),
                name: name.into(),
            })
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        self.config_maps
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "ConfigMap".into(),
                name: format!("{}/{}", namespace, name),
            })
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<()> {
        let name = volume
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Internal("volume without a name".into()))?;

        let mut volumes = self.volumes.write();
        volumes.entry(name).or_insert_with(|| {
            let mut created = volume.clone();
            created.metadata.creation_timestamp = Some(Time(Utc::now()));
            created.status = Some(PersistentVolumeStatus {
                phase: Some("Available".to_string()),
                ..Default::default()
            });
            created
        });
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.volumes.write().remove(name);
        Ok(())
    }

    async fn list_volumes(&self, label_selector: &str) -> Result<Vec<PersistentVolume>> {
        Ok(self
            .volumes
            .read()
            .values()
            .filter(|pv| selector_matches(label_selector, pv.metadata.labels.as_ref()))
            .cloned()
            .collect())
    }

    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self.claims.read().values().cloned().collect())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        self.claim(namespace, name)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolumeClaim".into(),
                name: format!("{}/{}", namespace, name),
            })
    }

    async fn set_volume_claim_ref(
        &self,
        volume: &str,
        claim_ref: Option<ObjectReference>,
    ) -> Result<()> {
        if claim_ref.is_some() && self.reject_binds.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("bind of {} rejected", volume)));
        }

        let mut volumes = self.volumes.write();
        let pv = volumes
            .get_mut(volume)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolume".into(),
                name: volume.into(),
            })?;

        let phase = if claim_ref.is_some() { "Bound" } else { "Available" };
        pv.spec.get_or_insert_with(Default::default).claim_ref = claim_ref;
        pv.status = Some(PersistentVolumeStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        Ok(())
    }

    async fn set_claim_volume(&self, namespace: &str, claim: &str, volume: &str) -> Result<()> {
        if self.reject_claim_updates.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!(
                "update of {}/{} rejected",
                namespace, claim
            )));
        }

        let mut claims = self.claims.write();
        let pvc = claims
            .get_mut(&(namespace.to_string(), claim.to_string()))
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolumeClaim".into(),
                name: format!("{}/{}", namespace, claim),
            })?;

        pvc.spec.get_or_insert_with(Default::default).volume_name = Some(volume.into());
        pvc.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn volume(name: &str, node: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    "local-volume.io/node".to_string(),
                    node.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_selector_matches() {
        let labels = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        assert!(selector_matches("a=1", Some(&labels)));
        assert!(selector_matches("a=1,b=2", Some(&labels)));
        assert!(selector_matches("b", Some(&labels)));
        assert!(!selector_matches("a=2", Some(&labels)));
        assert!(!selector_matches("a=1", None));
        assert!(selector_matches("", None));
    }

    #[tokio::test]
    async fn test_volume_create_delete_idempotent() {
        let cluster = MemoryCluster::new();
        let pv = volume("local-pv-1", "node-1");

        cluster.create_volume(&pv).await.unwrap();
        cluster.create_volume(&pv).await.unwrap();
        assert_eq!(cluster.volume_names(), vec!["local-pv-1"]);

        cluster.delete_volume("local-pv-1").await.unwrap();
        cluster.delete_volume("local-pv-1").await.unwrap();
        assert!(cluster.volume_names().is_empty());
    }

    #[tokio::test]
    async fn test_list_volumes_by_node() {
        let cluster = MemoryCluster::new();
        cluster.create_volume(&volume("local-pv-1", "node-1")).await.unwrap();
        cluster.create_volume(&volume("local-pv-2", "node-2")).await.unwrap();

        let listed = cluster.list_volumes("local-volume.io/node=node-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metadata.name.as_deref(), Some("local-pv-1"));
    }

    #[tokio::test]
    async fn test_bind_and_delete_claim() {
        let cluster = MemoryCluster::new();
        cluster.create_volume(&volume("local-pv-1", "node-1")).await.unwrap();
        let claim_id = cluster.create_claim("ns", "pvc", "local-sc", "10Mi");
        assert_eq!(claim_id.as_str(), "ns/pvc");

        cluster.bind_claim("ns", "pvc", "local-pv-1").await.unwrap();

        let pvc = cluster.claim("ns", "pvc").unwrap();
        assert_eq!(pvc.spec.unwrap().volume_name.as_deref(), Some("local-pv-1"));
        let pv = cluster.volume("local-pv-1").unwrap();
        assert_eq!(
            pv.spec.unwrap().claim_ref.unwrap().name.as_deref(),
            Some("pvc")
        );

        assert!(cluster.delete_claim("ns", "pvc"));
        let pv = cluster.volume("local-pv-1").unwrap();
        assert_eq!(pv.status.unwrap().phase.as_deref(), Some("Released"));
    }

    #[tokio::test]
    async fn test_missing_objects() {
        let cluster = MemoryCluster::new();
        assert_matches!(
            cluster.get_node("node-1").await,
            Err(Error::ResourceNotFound { .. })
        );
        assert_matches!(
            cluster.bind_claim("ns", "pvc", "local-pv-1").await,
            Err(Error::ResourceNotFound { .. })
        );

        cluster.create_claim("ns", "pvc", "local-sc", "10Mi");
        cluster.create_volume(&volume("local-pv-1", "node-1")).await.unwrap();
        cluster.reject_binds(true);
        assert_matches!(
            cluster.bind_claim("ns", "pvc", "local-pv-1").await,
            Err(Error::Internal(_))
        );
    }

    #[tokio::test]
    async fn test_partial_bind_clears_claim_ref() {
        let cluster = MemoryCluster::new();
        cluster.create_volume(&volume("local-pv-1", "node-1")).await.unwrap();
        cluster.create_claim("ns", "pvc", "local-sc", "10Mi");
        cluster.reject_claim_updates(true);

        assert_matches!(
            cluster.bind_claim("ns", "pvc", "local-pv-1").await,
            Err(Error::Internal(_))
        );

        let pv = cluster.volume("local-pv-1").unwrap();
        assert!(pv.spec.unwrap().claim_ref.is_none());
        assert_eq!(pv.status.unwrap().phase.as_deref(), Some("Available"));
        let pvc = cluster.claim("ns", "pvc").unwrap();
        assert!(pvc.spec.unwrap().volume_name.is_none());
    }

    #[tokio::test]
    async fn test_prebound_claim_names_volume() {
        let cluster = MemoryCluster::new();
        cluster.create_prebound_claim("ns", "pvc", "local-sc", "10Mi", "local-pv-1");

        let pvc = cluster.get_claim("ns", "pvc").await.unwrap();
        assert_eq!(pvc.spec.unwrap().volume_name.as_deref(), Some("local-pv-1"));
    }
}

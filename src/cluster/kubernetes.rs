//! Kubernetes Cluster API
//!
//! [`ClusterApi`] over a kube-rs client.

use crate::domain::ClusterApi;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, ObjectReference, PersistentVolume, PersistentVolumeClaim,
};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

const HTTP_NOT_FOUND: u16 = 404;
const HTTP_CONFLICT: u16 = 409;

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

fn map_not_found(kind: &str, name: &str) -> impl FnOnce(kube::Error) -> Error {
    let kind = kind.to_string();
    let name = name.to_string();
    move |err| {
        if is_status(&err, HTTP_NOT_FOUND) {
            Error::ResourceNotFound { kind, name }
        } else {
            Error::Kube(err)
        }
    }
}

/// Cluster access through the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster or kubeconfig credentials
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_node(&self, name: &str) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes.get(name).await.map_err(map_not_found("Node", name))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        config_maps
            .get(name)
            .await
            .map_err(map_not_found("ConfigMap", &format!("{}/{}", namespace, name)))
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<()> {
        match self.volumes().create(&PostParams::default(), volume).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, HTTP_CONFLICT) => {
                debug!(volume = ?volume.metadata.name, "Volume already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        match self.volumes().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, HTTP_NOT_FOUND) => {
                debug!(volume = name, "Volume already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_volumes(&self, label_selector: &str) -> Result<Vec<PersistentVolume>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.volumes().list(&params).await?.items)
    }

    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>> {
        let claims: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        Ok(claims.list(&ListParams::default()).await?.items)
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        self.claims(namespace)
            .get(name)
            .await
            .map_err(map_not_found("PersistentVolumeClaim", &format!("{}/{}", namespace, name)))
    }

    async fn set_volume_claim_ref(
        &self,
        volume: &str,
        claim_ref: Option<ObjectReference>,
    ) -> Result<()> {
        // A null value removes the field under a merge patch
        let patch = json!({ "spec": { "claimRef": claim_ref } });
        self.volumes()
            .patch(volume, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_not_found("PersistentVolume", volume))?;
        Ok(())
    }

    async fn set_claim_volume(&self, namespace: &str, claim: &str, volume: &str) -> Result<()> {
        let patch = json!({ "spec": { "volumeName": volume } });
        self.claims(namespace)
            .patch(claim, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_not_found("PersistentVolumeClaim", &format!("{}/{}", namespace, claim)))?;
        Ok(())
    }
}

//! Claim Binder
//!
//! Mirrors claims for the storage classes served by this node into the
//! registry and binds each pending claim to exactly one available volume.

use crate::cluster::{with_retry, RetryPolicy};
use crate::domain::{
    ClaimId, ClaimRecord, ClusterApiRef, VolumeId, VolumePhase, VolumeRecord,
};
use crate::error::{Error, Result};
use crate::recreation::RecreationCoordinator;
use crate::registry::{BindOutcome, VolumeRegistry};
use crate::volumes::parse_capacity;
use chrono::Utc;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one claim sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub created: usize,
    pub adopted: usize,
    pub deleted: usize,
    /// Bound volumes whose claim vanished while nobody was watching
    pub orphans_released: usize,
    pub skipped: usize,
}

/// Outcome of one binding pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindReport {
    pub bound: usize,
    /// Candidates lost to a concurrent binder
    pub contended: usize,
    /// Claims left Pending for lack of a candidate
    pub unmatched: usize,
    pub rolled_back: usize,
}

// =============================================================================
// Claim Binder
// =============================================================================

/// Binds claims to local volumes
pub struct ClaimBinder {
    registry: Arc<VolumeRegistry>,
    cluster: ClusterApiRef,
    coordinator: Arc<RecreationCoordinator>,
    storage_classes: RwLock<BTreeSet<String>>,
    retry: RetryPolicy,
}

impl ClaimBinder {
    pub fn new(
        registry: Arc<VolumeRegistry>,
        cluster: ClusterApiRef,
        coordinator: Arc<RecreationCoordinator>,
        storage_classes: impl IntoIterator<Item = String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            cluster,
            coordinator,
            storage_classes: RwLock::new(storage_classes.into_iter().collect()),
            retry,
        }
    }

    /// Replace the set of storage classes served here
    pub fn set_storage_classes(&self, classes: impl IntoIterator<Item = String>) {
        *self.storage_classes.write() = classes.into_iter().collect();
    }

    fn manages(&self, storage_class: &str) -> bool {
        self.storage_classes.read().contains(storage_class)
    }

    // =========================================================================
    // Claim Sync
    // =========================================================================

    /// Bring the registry's claim table in line with the cluster
    pub async fn sync_claims(&self) -> Result<SyncReport> {
        let listed = with_retry(&self.retry, "list claims", || self.cluster.list_claims()).await?;
        let mut report = SyncReport::default();

        // Every claim that exists, managed or not, with its uid
        let mut present = HashMap::with_capacity(listed.len());

        for pvc in &listed {
            let (Some(namespace), Some(name)) =
                (pvc.metadata.namespace.as_deref(), pvc.metadata.name.as_deref())
            else {
                continue;
            };
            let claim_id = ClaimId::new(namespace, name);
            present.insert(claim_id.clone(), pvc.metadata.uid.clone());

            let spec = pvc.spec.as_ref();
            let storage_class = match spec.and_then(|s| s.storage_class_name.as_deref()) {
                Some(class) if self.manages(class) => class,
                _ => continue,
            };
            if self.registry.get_claim(&claim_id).is_some() {
                continue;
            }

            match self.register_claim(pvc, claim_id.clone(), storage_class) {
                Ok(Registered::Created) => report.created += 1,
                Ok(Registered::Adopted) => report.adopted += 1,
                Ok(Registered::Ignored) => {}
                Err(e) => {
                    warn!(claim = %claim_id, error = %e, "Skipping claim");
                    report.skipped += 1;
                }
            }
        }

        for claim in self.registry.claims() {
            // A claim recreated under the same name is a different claim
            match present.get(&claim.id) {
                Some(uid) if claim.uid.is_none() || *uid == claim.uid => continue,
                _ => {}
            }
            self.coordinator.on_claim_deleted(&claim.id)?;
            report.deleted += 1;
        }

        for record in self.registry.records_in_phase(VolumePhase::Bound) {
            let orphaned = match &record.claim {
                Some(claim_id) => {
                    !present.contains_key(claim_id) && self.registry.get_claim(claim_id).is_none()
                }
                None => true,
            };
            if !orphaned {
                continue;
            }
            match self.registry.release_volume(&record.id) {
                Ok(_) => report.orphans_released += 1,
                Err(e) => debug!(volume = %record.id, error = %e, "Volume changed during sync"),
            }
        }

        if report != SyncReport::default() {
            info!(
                created = report.created,
                adopted = report.adopted,
                deleted = report.deleted,
                "Claims synced"
            );
        }
        Ok(report)
    }

    fn register_claim(
        &self,
        pvc: &PersistentVolumeClaim,
        claim_id: ClaimId,
        storage_class: &str,
    ) -> Result<Registered> {
        let spec = pvc.spec.as_ref();
        let requested_bytes = spec
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .map(|q| parse_capacity(&q.0))
            .transpose()?
            .unwrap_or(0);

        let mut claim = ClaimRecord::pending(claim_id.clone(), storage_class, requested_bytes);
        claim.uid = pvc.metadata.uid.clone();
        claim.created_at = pvc
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(Utc::now);

        let Some(volume_name) = spec.and_then(|s| s.volume_name.as_deref()) else {
            self.registry.insert_claim(claim);
            return Ok(Registered::Created);
        };

        // Pre-bound claims are only ours if they name one of our volumes
        let volume_id = VolumeId(volume_name.to_string());
        let Some(record) = self.registry.get(&volume_id) else {
            return Ok(Registered::Ignored);
        };

        match &record.claim {
            Some(holder) if *holder == claim_id && record.phase == VolumePhase::Bound => {
                self.registry.adopt_bound_claim(claim, &volume_id)?;
                info!(claim = %claim_id, volume = %volume_id, "Adopted bound claim");
                Ok(Registered::Adopted)
            }
            // Held by a quarantined or recycling record; leave the claim alone
            Some(holder) if *holder == claim_id => {
                debug!(claim = %claim_id, volume = %volume_id, phase = %record.phase, "Claim names a volume that cannot be bound");
                Ok(Registered::Ignored)
            }
            Some(holder) => Err(Error::InvariantViolation {
                subject: claim_id.to_string(),
                reason: format!(
                    "names volume {} which is {} for {}",
                    volume_id, record.phase, holder
                ),
            }),
            None => {
                self.registry
                    .insert_claim(claim.with_requested_volume(volume_id.clone()));
                info!(claim = %claim_id, volume = %volume_id, "Registered pre-bound claim");
                Ok(Registered::Created)
            }
        }
    }

    // =========================================================================
    // Binding
    // =========================================================================

    /// Try to bind every pending claim, oldest first
    pub async fn bind_pending(&self) -> Result<BindReport> {
        let mut report = BindReport::default();

        for claim in self.registry.pending_claims() {
            match self.bind_claim(&claim, &mut report).await {
                Ok(true) => report.bound += 1,
                Ok(false) => {
                    debug!(claim = %claim.id, "No volume available for claim");
                    report.unmatched += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(claim = %claim.id, error = %e, "Binding failed"),
            }
        }

        Ok(report)
    }

    /// Candidates for a claim, earliest discovered first.
    ///
    /// A pre-bound claim only ever sees the volume it names, and volumes named
    /// by other pending claims are left out.
    pub fn candidates(&self, claim: &ClaimRecord) -> Vec<VolumeRecord> {
        self.registry
            .records_in_phase(VolumePhase::Available)
            .into_iter()
            .filter(|r| r.published && claim.is_satisfied_by(r))
            .filter(|r| {
                self.registry
                    .reserved_for(&r.id)
                    .map_or(true, |holder| holder == claim.id)
            })
            .collect()
    }

    async fn bind_claim(&self, claim: &ClaimRecord, report: &mut BindReport) -> Result<bool> {
        for candidate in self.candidates(claim) {
            let outcome = match self.registry.bind(&candidate.id, &claim.id) {
                Ok(outcome) => outcome,
                // Deleted while we were looking
                Err(Error::ClaimNotFound { .. }) => return Ok(false),
                Err(e) => return Err(e),
            };

            match outcome {
                BindOutcome::Bound(volume) => {
                    self.record_binding(claim, &volume, report).await?;
                    return Ok(true);
                }
                BindOutcome::Contended => {
                    report.contended += 1;
                    continue;
                }
                BindOutcome::Incompatible => continue,
                BindOutcome::ClaimNotPending => return Ok(false),
            }
        }
        Ok(false)
    }

    /// Write a registry binding to the cluster, undoing it on failure
    async fn record_binding(
        &self,
        claim: &ClaimRecord,
        volume: &VolumeRecord,
        report: &mut BindReport,
    ) -> Result<()> {
        let (namespace, name) = claim.id.parts();
        let written = with_retry(&self.retry, "bind claim", || {
            self.cluster.bind_claim(namespace, name, volume.id.as_str())
        })
        .await;

        if let Err(e) = written {
            report.rolled_back += 1;
            if let Err(rollback) = self.registry.rollback_binding(&volume.id, &claim.id) {
                warn!(
                    volume = %volume.id,
                    claim = %claim.id,
                    error = %rollback,
                    "Rollback skipped"
                );
            }
            return Err(e);
        }

        info!(
            claim = %claim.id,
            volume = %volume.id,
            path = %volume.path().display(),
            "Claim bound"
        );
        Ok(())
    }
}

enum Registered {
    Created,
    Adopted,
    Ignored,
}

//! Recreation Coordinator
//!
//! When a claim goes away its volume is Released. The coordinator wipes the
//! content, deletes the published object and finally drops the record, which
//! lets the scanner rediscover the same path under a fresh identity.
//!
//! The record stays Released until every step has succeeded, so the path
//! cannot be rediscovered while old content may still be on disk.

use crate::domain::{ClaimId, HostFsRef, VolumeId, VolumePhase, VolumeRecord};
use crate::error::Result;
use crate::registry::VolumeRegistry;
use crate::volumes::VolumeObjectManager;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one recreation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecreationReport {
    pub recreated: usize,
    pub failed: usize,
}

/// Drives Released volumes back to rediscoverable paths
pub struct RecreationCoordinator {
    registry: Arc<VolumeRegistry>,
    host_fs: HostFsRef,
    objects: Arc<VolumeObjectManager>,
}

impl RecreationCoordinator {
    pub fn new(
        registry: Arc<VolumeRegistry>,
        host_fs: HostFsRef,
        objects: Arc<VolumeObjectManager>,
    ) -> Self {
        Self {
            registry,
            host_fs,
            objects,
        }
    }

    /// Release the volume held by a deleted claim
    pub fn on_claim_deleted(&self, claim_id: &ClaimId) -> Result<Option<VolumeId>> {
        self.registry.release_claim(claim_id)
    }

    /// Recreate every Released volume
    pub async fn reconcile(&self) -> Result<RecreationReport> {
        let mut report = RecreationReport::default();

        for record in self.registry.records_in_phase(VolumePhase::Released) {
            match self.recreate(&record).await {
                Ok(()) => report.recreated += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        volume = %record.id,
                        path = %record.path().display(),
                        error = %e,
                        "Recreation incomplete, will retry"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn recreate(&self, record: &VolumeRecord) -> Result<()> {
        self.host_fs.clear(record.path()).await?;
        self.objects.unpublish(&record.id).await?;
        self.registry.finalize_recreation(&record.id)?;

        info!(
            volume = %record.id,
            path = %record.path().display(),
            generation = record.generation,
            "Recreated volume"
        );
        Ok(())
    }
}

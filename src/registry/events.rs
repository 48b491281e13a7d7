//! Registry Events
//!
//! Events emitted by the volume registry for the reconciliation loops and
//! external consumers to react to lifecycle changes.

use crate::domain::{ClaimId, VolumeId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Events emitted by the volume registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A path was discovered and a fresh record minted for it
    VolumeDiscovered {
        volume_id: VolumeId,
        path: PathBuf,
        generation: u64,
    },

    /// A record's capacity was measured and it can be published
    VolumeAvailable { volume_id: VolumeId, capacity_bytes: u64 },

    /// The cluster volume object for a record was created
    VolumePublished { volume_id: VolumeId },

    /// A record's capacity check failed; it will not be retried
    VolumeFailed { volume_id: VolumeId, reason: String },

    /// A claim and a volume were bound
    VolumeBound { volume_id: VolumeId, claim_id: ClaimId },

    /// A binding was undone before it reached the cluster
    BindingRolledBack { volume_id: VolumeId, claim_id: ClaimId },

    /// The claim holding a volume was deleted
    VolumeReleased { volume_id: VolumeId, claim_id: ClaimId },

    /// A record was removed, either recreated or its directory vanished
    VolumeRemoved {
        volume_id: VolumeId,
        path: PathBuf,
        recreated: bool,
    },

    /// A claim was registered
    ClaimCreated { claim_id: ClaimId },

    /// A claim was deleted
    ClaimDeleted { claim_id: ClaimId },
}

impl RegistryEvent {
    /// Whether this event can open a new binding opportunity
    pub fn wakes_binder(&self) -> bool {
        matches!(
            self,
            RegistryEvent::VolumePublished { .. }
                | RegistryEvent::BindingRolledBack { .. }
                | RegistryEvent::ClaimCreated { .. }
        )
    }

    /// Whether this event requires publication work
    pub fn wakes_publisher(&self) -> bool {
        matches!(
            self,
            RegistryEvent::VolumeAvailable { .. } | RegistryEvent::VolumeRemoved { .. }
        )
    }

    /// Whether a path was freed and should be rediscovered promptly
    pub fn wakes_scanner(&self) -> bool {
        matches!(self, RegistryEvent::VolumeRemoved { recreated: true, .. })
    }

    /// Whether this event requires recreation work
    pub fn wakes_recreation(&self) -> bool {
        matches!(self, RegistryEvent::VolumeReleased { .. })
    }
}

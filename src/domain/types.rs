//! Domain Types
//!
//! Identities, phases and records shared by every lifecycle component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// Identities
// =============================================================================

/// Name of a cluster node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeName(pub String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of a volume record, also used as the published volume name.
///
/// A fresh identity is minted every time a path is (re)discovered, so two
/// records for the same path never share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub String);

impl VolumeId {
    /// Prefix of every generated volume name
    pub const PREFIX: &'static str = "local-pv-";

    /// Mint a new identity
    pub fn generate() -> Self {
        Self(format!("{}{}", Self::PREFIX, uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a claim: `<namespace>/<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimId(pub String);

impl ClaimId {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self(format!("{}/{}", namespace, name))
    }

    /// Split back into namespace and name
    pub fn parts(&self) -> (&str, &str) {
        self.0.split_once('/').unwrap_or(("default", self.0.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClaimId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClaimId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Discovered Path
// =============================================================================

/// A subdirectory found under a discovery root
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPath {
    /// Node that physically owns the path
    pub node: NodeName,
    /// Absolute host path of the volume
    pub path: PathBuf,
    /// Discovery root the path was found under
    pub root: PathBuf,
    /// Storage class configured for the root
    pub storage_class: String,
}

impl DiscoveredPath {
    pub fn new(
        node: NodeName,
        path: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        storage_class: impl Into<String>,
    ) -> Self {
        Self {
            node,
            path: path.into(),
            root: root.into(),
            storage_class: storage_class.into(),
        }
    }

    /// Registry key for this path
    pub fn key(&self) -> VolumeKey {
        VolumeKey {
            node: self.node.clone(),
            path: self.path.clone(),
        }
    }
}

/// Key identifying a path on a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeKey {
    pub node: NodeName,
    pub path: PathBuf,
}

impl VolumeKey {
    pub fn new(node: impl Into<NodeName>, path: impl AsRef<Path>) -> Self {
        Self {
            node: node.into(),
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl std::fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.path.display())
    }
}

// =============================================================================
// Phases
// =============================================================================

/// Lifecycle phase of a volume record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumePhase {
    Pending,
    Available,
    Bound,
    Released,
    Failed,
}

impl VolumePhase {
    /// Whether a record in this phase counts as live for its path
    pub fn is_live(&self) -> bool {
        matches!(self, VolumePhase::Available | VolumePhase::Bound)
    }
}

impl std::fmt::Display for VolumePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumePhase::Pending => write!(f, "Pending"),
            VolumePhase::Available => write!(f, "Available"),
            VolumePhase::Bound => write!(f, "Bound"),
            VolumePhase::Released => write!(f, "Released"),
            VolumePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Lifecycle phase of a claim record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimPhase {
    Pending,
    Bound,
    Lost,
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimPhase::Pending => write!(f, "Pending"),
            ClaimPhase::Bound => write!(f, "Bound"),
            ClaimPhase::Lost => write!(f, "Lost"),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// A discovered local volume and its lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRecord {
    /// Identity, fresh on every discovery of the path
    pub id: VolumeId,
    /// Backing path
    pub source: DiscoveredPath,
    /// Capacity in bytes (0 until measured)
    pub capacity_bytes: u64,
    /// Current phase
    pub phase: VolumePhase,
    /// Claim holding the binding, if any
    pub claim: Option<ClaimId>,
    /// Whether the cluster volume object has been created
    pub published: bool,
    /// Per-path discovery generation, strictly increasing across recreations
    pub generation: u64,
    /// When the path was discovered for this identity
    pub discovered_at: DateTime<Utc>,
    /// Reason the record entered Failed
    pub failure: Option<String>,
}

impl VolumeRecord {
    /// Create a fresh Pending record for a path
    pub fn pending(source: DiscoveredPath, generation: u64) -> Self {
        Self {
            id: VolumeId::generate(),
            source,
            capacity_bytes: 0,
            phase: VolumePhase::Pending,
            claim: None,
            published: false,
            generation,
            discovered_at: Utc::now(),
            failure: None,
        }
    }

    pub fn storage_class(&self) -> &str {
        &self.source.storage_class
    }

    pub fn path(&self) -> &Path {
        &self.source.path
    }

    pub fn key(&self) -> VolumeKey {
        self.source.key()
    }
}

/// A consumer's request for storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRecord {
    pub id: ClaimId,
    /// Cluster UID of the claim object
    pub uid: Option<String>,
    /// Requested capacity in bytes
    pub requested_bytes: u64,
    pub storage_class: String,
    pub phase: ClaimPhase,
    /// Bound volume, set exactly once
    pub volume: Option<VolumeId>,
    /// Volume named by the claim itself; no other volume may satisfy it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_volume: Option<VolumeId>,
    pub created_at: DateTime<Utc>,
}

impl ClaimRecord {
    /// Create a Pending claim
    pub fn pending(id: ClaimId, storage_class: impl Into<String>, requested_bytes: u64) -> Self {
        Self {
            id,
            uid: None,
            requested_bytes,
            storage_class: storage_class.into(),
            phase: ClaimPhase::Pending,
            volume: None,
            requested_volume: None,
            created_at: Utc::now(),
        }
    }

    /// Pre-bind the claim to one specific volume
    pub fn with_requested_volume(mut self, volume: VolumeId) -> Self {
        self.requested_volume = Some(volume);
        self
    }

    /// Whether a volume record could satisfy this claim
    pub fn is_satisfied_by(&self, volume: &VolumeRecord) -> bool {
        volume.storage_class() == self.storage_class
            && volume.capacity_bytes >= self.requested_bytes
            && self
                .requested_volume
                .as_ref()
                .map_or(true, |requested| *requested == volume.id)
    }
}

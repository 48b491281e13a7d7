//! Local Volume Manager
//!
//! Turns plain directories on a node's filesystem into node-pinned
//! persistent volumes, binds claims to them one-to-one, and recycles a
//! volume under a fresh identity with wiped content once its claim is gone.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        Lifecycle Manager                          │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌────────┐ │
//! │  │  Directory   │  │    Volume    │  │    Claim     │  │ Recrea-│ │
//! │  │   Scanner    │  │   Objects    │  │    Binder    │  │  tion  │ │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘  └───┬────┘ │
//! │         └─────────────────┴────────┬────────┴──────────────┘      │
//! │                        ┌───────────┴───────────┐                  │
//! │                        │    Volume Registry    │                  │
//! │                        │   (sharded, CAS)      │                  │
//! │                        └───────────────────────┘                  │
//! ├───────────────────────────────────────────────────────────────────┤
//! │   Cluster API (kube / in-memory)   │   Host FS + node executor    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Lifecycle manager, metrics and REST API
//! - [`discovery`]: Discovery config and the directory scanner
//! - [`registry`]: Volume and claim records and their transitions
//! - [`volumes`]: Cluster volume objects and node affinity
//! - [`binding`]: Claim binder
//! - [`recreation`]: Recreation coordinator
//! - [`cluster`]: Cluster API adapters and retry policy
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod binding;
pub mod cluster;
pub mod controlplane;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod recreation;
pub mod registry;
pub mod volumes;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, LifecycleManager, ManagerConfig, ManagerMetrics, ManagerStatus,
    PassReport,
};

pub use cluster::{KubeClusterApi, MemoryCluster, RetryPolicy};

pub use discovery::{
    DirectoryScanner, DiscoveryConfig, LocalHostFs, LocalShellExecutor, ScanReport,
    DEFAULT_CONFIG_MAP_NAME,
};

pub use domain::{
    ClaimId, ClaimPhase, ClaimRecord, ClusterApi, ClusterApiRef, HostFs, HostFsRef, NodeExecutor,
    NodeExecutorRef, NodeName, VolumeId, VolumePhase, VolumeRecord,
};

pub use error::{Error, ErrorAction, Result};

pub use registry::{RegistryEvent, RegistryStatsSnapshot, VolumeRegistry};

pub use volumes::{NodeAffinity, VolumeObjectManager, DEFAULT_NODE_LABEL_KEY};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

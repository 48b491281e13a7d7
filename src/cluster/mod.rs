//! Cluster Adapters
//!
//! Implementations of the cluster API port plus the retry policy used at
//! every cluster call site.

pub mod kubernetes;
pub mod memory;
pub mod retry;

pub use kubernetes::KubeClusterApi;
pub use memory::MemoryCluster;
pub use retry::{with_retry, RetryPolicy};

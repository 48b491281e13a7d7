//! Lifecycle Manager
//!
//! Owns one node's registry and wires the components around it:
//! - Directory scanner feeding discovered paths into the registry
//! - Volume object manager publishing records as cluster volumes
//! - Claim binder pairing pending claims with available volumes
//! - Recreation coordinator recycling volumes whose claim went away
//!
//! Each component runs in its own loop, woken by its interval and by the
//! registry events it cares about.

use crate::binding::{BindReport, ClaimBinder, SyncReport};
use crate::cluster::RetryPolicy;
use crate::controlplane::metrics::ManagerMetrics;
use crate::discovery::{DirectoryScanner, DiscoveryConfig, ScanReport};
use crate::domain::{
    ClaimId, ClaimPhase, ClusterApiRef, HostFsRef, NodeName, VolumeId, VolumeKey, VolumePhase,
    VolumeRecord,
};
use crate::error::{Error, ErrorAction, Result};
use crate::recreation::{RecreationCoordinator, RecreationReport};
use crate::registry::{RegistryEvent, RegistryStatsSnapshot, VolumeRegistry};
use crate::volumes::{PublishReport, VolumeObjectManager, DEFAULT_NODE_LABEL_KEY};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Manager Configuration
// =============================================================================

/// Configuration for the lifecycle manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Node whose directories are managed
    pub node_name: NodeName,
    /// Node label whose value pins published volumes to the node
    pub node_label_key: String,
    /// Discovery roots by storage class
    pub discovery: DiscoveryConfig,
    /// Interval between directory scans
    pub scan_interval: Duration,
    /// Interval between publish, bind and recreation passes
    pub reconcile_interval: Duration,
    /// Poll interval of the wait helpers
    pub poll_interval: Duration,
    /// Default deadline of the wait helpers
    pub wait_timeout: Duration,
    /// Retry policy for cluster calls
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            node_name: NodeName::new("localhost"),
            node_label_key: DEFAULT_NODE_LABEL_KEY.to_string(),
            discovery: DiscoveryConfig::default(),
            scan_interval: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

// =============================================================================
// Reconcile Loops
// =============================================================================

/// The independent loops driven by [`LifecycleManager::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileLoop {
    Scanner,
    Publisher,
    Binder,
    Recreation,
}

impl ReconcileLoop {
    pub const ALL: [ReconcileLoop; 4] = [
        ReconcileLoop::Scanner,
        ReconcileLoop::Publisher,
        ReconcileLoop::Binder,
        ReconcileLoop::Recreation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ReconcileLoop::Scanner => "scanner",
            ReconcileLoop::Publisher => "publisher",
            ReconcileLoop::Binder => "binder",
            ReconcileLoop::Recreation => "recreation",
        }
    }

    fn wakes(&self, event: &RegistryEvent) -> bool {
        match self {
            ReconcileLoop::Scanner => event.wakes_scanner(),
            ReconcileLoop::Publisher => event.wakes_publisher(),
            ReconcileLoop::Binder => event.wakes_binder(),
            ReconcileLoop::Recreation => event.wakes_recreation(),
        }
    }
}

/// Reports of one full reconcile pass
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub scan: ScanReport,
    pub publish: PublishReport,
    pub sync: SyncReport,
    pub bind: BindReport,
    pub recreation: RecreationReport,
}

// =============================================================================
// Lifecycle Manager
// =============================================================================

/// Node-local volume lifecycle manager
pub struct LifecycleManager {
    config: ManagerConfig,
    registry: Arc<VolumeRegistry>,
    scanner: DirectoryScanner,
    objects: Arc<VolumeObjectManager>,
    binder: ClaimBinder,
    coordinator: Arc<RecreationCoordinator>,
    metrics: Arc<ManagerMetrics>,
    ready: AtomicBool,
    started_at: DateTime<Utc>,
}

impl LifecycleManager {
    /// Build every component and adopt volumes published by a previous run.
    ///
    /// Fails when the node cannot be pinned, which is fatal.
    pub async fn initialize(
        config: ManagerConfig,
        cluster: ClusterApiRef,
        host_fs: HostFsRef,
    ) -> Result<Arc<Self>> {
        info!(node = %config.node_name, "Initializing lifecycle manager");

        let registry = VolumeRegistry::new();
        let objects = Arc::new(
            VolumeObjectManager::new(
                config.node_name.clone(),
                &config.node_label_key,
                cluster.clone(),
                registry.clone(),
                config.retry,
            )
            .await?,
        );

        // Must precede the first publish pass, which deletes unknown volumes
        let adopted = objects.adopt_existing().await?;
        if adopted > 0 {
            info!(adopted, "Adopted previously published volumes");
        }

        let coordinator = Arc::new(RecreationCoordinator::new(
            registry.clone(),
            host_fs.clone(),
            objects.clone(),
        ));
        let binder = ClaimBinder::new(
            registry.clone(),
            cluster,
            coordinator.clone(),
            storage_class_names(&config.discovery),
            config.retry,
        );
        let scanner = DirectoryScanner::new(
            config.node_name.clone(),
            registry.clone(),
            host_fs,
            config.discovery.clone(),
        );
        let metrics = Arc::new(ManagerMetrics::new()?);
        metrics.observe_registry(&registry.stats());

        info!(
            classes = ?config.discovery.storage_classes(),
            affinity = %objects.affinity(),
            "Lifecycle manager initialized"
        );

        Ok(Arc::new(Self {
            config,
            registry,
            scanner,
            objects,
            binder,
            coordinator,
            metrics,
            ready: AtomicBool::new(false),
            started_at: Utc::now(),
        }))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<VolumeRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ManagerMetrics> {
        &self.metrics
    }

    /// Whether the manager has completed a reconcile pass or is running
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Swap the discovery roots and the set of served storage classes
    pub fn update_discovery_config(&self, discovery: DiscoveryConfig) {
        self.binder
            .set_storage_classes(storage_class_names(&discovery));
        self.scanner.update_config(discovery);
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Run every component once, in dependency order
    pub async fn reconcile_once(&self) -> Result<PassReport> {
        let scan = self.scan().await?;
        let publish = self.publish().await?;
        let (sync, bind) = self.bind().await?;
        let recreation = self.recreate().await?;

        self.ready.store(true, Ordering::Release);
        Ok(PassReport {
            scan,
            publish,
            sync,
            bind,
            recreation,
        })
    }

    /// Drive all loops until `cancel` fires or a loop hits a fatal error.
    ///
    /// A fatal error cancels the remaining loops and is returned.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!(node = %self.config.node_name, "Starting reconcile loops");

        let mut loops = JoinSet::new();
        for kind in ReconcileLoop::ALL {
            loops.spawn(self.clone().drive(kind, cancel.clone()));
        }
        self.ready.store(true, Ordering::Release);

        let mut outcome = Ok(());
        while let Some(joined) = loops.join_next().await {
            let result = joined
                .map_err(|e| Error::Internal(format!("reconcile loop panicked: {}", e)))
                .and_then(|r| r);
            if let Err(e) = result {
                cancel.cancel();
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        self.ready.store(false, Ordering::Release);
        info!("Reconcile loops stopped");
        outcome
    }

    async fn drive(self: Arc<Self>, kind: ReconcileLoop, cancel: CancellationToken) -> Result<()> {
        let mut events = self.registry.subscribe();
        let mut ticker = tokio::time::interval(self.period(kind));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = self.config.retry.backoff();
        let mut requeued = false;

        loop {
            let due = requeued || tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task = kind.name(), "Reconcile loop cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => true,
                received = events.recv() => match received {
                    Ok(event) => kind.wakes(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(task = kind.name(), skipped, "Event stream lagged");
                        true
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            };
            if !due {
                continue;
            }

            requeued = false;

            let e = match self.run_pass(kind).await {
                Ok(()) => {
                    backoff.reset();
                    continue;
                }
                Err(e) => e,
            };
            if e.is_fatal() {
                error!(task = kind.name(), error = %e, "Fatal error, stopping");
                return Err(e);
            }

            let Some(delay) = requeue_delay(&e, &mut backoff) else {
                warn!(task = kind.name(), error = %e, "Reconcile pass failed");
                continue;
            };
            warn!(
                task = kind.name(),
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Reconcile pass failed, requeueing"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task = kind.name(), "Reconcile loop cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => requeued = true,
            }
        }
    }

    fn period(&self, kind: ReconcileLoop) -> Duration {
        match kind {
            ReconcileLoop::Scanner => self.config.scan_interval,
            _ => self.config.reconcile_interval,
        }
    }

    async fn run_pass(&self, kind: ReconcileLoop) -> Result<()> {
        match kind {
            ReconcileLoop::Scanner => self.scan().await.map(drop),
            ReconcileLoop::Publisher => self.publish().await.map(drop),
            ReconcileLoop::Binder => self.bind().await.map(drop),
            ReconcileLoop::Recreation => self.recreate().await.map(drop),
        }
    }

    async fn scan(&self) -> Result<ScanReport> {
        self.observed(ReconcileLoop::Scanner, async {
            let report = self.scanner.scan_once().await;
            self.metrics.observe_scan(&report);
            Ok(report)
        })
        .await
    }

    async fn publish(&self) -> Result<PublishReport> {
        self.observed(ReconcileLoop::Publisher, self.objects.reconcile())
            .await
    }

    async fn bind(&self) -> Result<(SyncReport, BindReport)> {
        self.observed(ReconcileLoop::Binder, async {
            let sync = self.binder.sync_claims().await?;
            let bind = self.binder.bind_pending().await?;
            Ok((sync, bind))
        })
        .await
    }

    async fn recreate(&self) -> Result<RecreationReport> {
        self.observed(ReconcileLoop::Recreation, self.coordinator.reconcile())
            .await
    }

    async fn observed<T: std::fmt::Debug>(
        &self,
        kind: ReconcileLoop,
        pass: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        let result = pass.await;

        self.metrics.observe_pass(
            kind.name(),
            started.elapsed().as_secs_f64(),
            result.is_err(),
        );
        self.metrics.observe_registry(&self.registry.stats());
        if let Ok(report) = &result {
            debug!(task = kind.name(), ?report, "Pass complete");
        }
        result
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// Wait until the directory at `path` is published as an Available volume
    pub async fn wait_for_available(
        &self,
        path: impl AsRef<Path>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<VolumeRecord> {
        let key = VolumeKey::new(self.config.node_name.clone(), path);
        self.wait_until(format!("volume at {}", key), timeout, cancel, || {
            self.registry
                .get_by_path(&key)
                .filter(|r| r.phase == VolumePhase::Available && r.published)
        })
        .await
    }

    /// Wait until `path` is published again under an identity other than
    /// `previous`
    pub async fn wait_for_recreation(
        &self,
        path: impl AsRef<Path>,
        previous: &VolumeId,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<VolumeRecord> {
        let key = VolumeKey::new(self.config.node_name.clone(), path);
        self.wait_until(
            format!("recreation of {} at {}", previous, key),
            timeout,
            cancel,
            || {
                self.registry
                    .get_by_path(&key)
                    .filter(|r| &r.id != previous && r.phase.is_live() && r.published)
            },
        )
        .await
    }

    /// Wait until a claim is bound, returning the volume it holds
    pub async fn wait_for_claim_bound(
        &self,
        claim_id: &ClaimId,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<VolumeRecord> {
        self.wait_until(format!("claim {}", claim_id), timeout, cancel, || {
            let claim = self.registry.get_claim(claim_id)?;
            if claim.phase != ClaimPhase::Bound {
                return None;
            }
            self.registry.get(claim.volume.as_ref()?)
        })
        .await
    }

    async fn wait_until<T>(
        &self,
        what: String,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        mut check: impl FnMut() -> Option<T>,
    ) -> Result<T> {
        let timeout = timeout.unwrap_or(self.config.wait_timeout);
        let deadline = Instant::now() + timeout;
        let mut events = self.registry.subscribe();

        loop {
            if let Some(found) = check() {
                return Ok(found);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    what,
                    after: timeout,
                });
            }
            let nap = self.config.poll_interval.min(deadline - now);

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled { what }),
                _ = tokio::time::sleep(nap) => {}
                _ = events.recv() => {}
            }
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Get overall manager status
    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            node: self.config.node_name.to_string(),
            affinity: self.objects.affinity().to_string(),
            ready: self.is_ready(),
            storage_classes: storage_class_names(&self.scanner.config()),
            volumes: self.registry.stats(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("node", &self.config.node_name)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

/// Delay before a failed pass runs again; `None` waits for the next tick or event
fn requeue_delay(error: &Error, backoff: &mut ExponentialBackoff) -> Option<Duration> {
    match error.action() {
        ErrorAction::RequeueWithBackoff => backoff.next_backoff(),
        ErrorAction::RequeueAfter(delay) => Some(delay),
        ErrorAction::NoRequeue => None,
    }
}

fn storage_class_names(discovery: &DiscoveryConfig) -> Vec<String> {
    discovery
        .storage_classes()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Manager status summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub node: String,
    pub affinity: String,
    pub ready: bool,
    pub storage_classes: Vec<String>,
    pub volumes: RegistryStatsSnapshot,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

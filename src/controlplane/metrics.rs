//! Manager Metrics
//!
//! Prometheus collectors fed from registry snapshots and pass reports. Each
//! manager owns its own collector registry so several managers can coexist
//! in one process.

use crate::discovery::ScanReport;
use crate::error::Result;
use crate::registry::RegistryStatsSnapshot;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::atomic::{AtomicU64, Ordering};

const NAMESPACE: &str = "local_volume";

/// Collectors exported on `/metrics`
pub struct ManagerMetrics {
    registry: Registry,
    volumes: IntGaugeVec,
    claims: IntGauge,
    pending_claims: IntGauge,
    quarantined: IntGauge,
    lifecycle: IntCounterVec,
    pass_errors: IntCounterVec,
    pass_duration: HistogramVec,
    scan_root_errors: IntCounter,
    /// Last registry counter values, used to turn snapshots into increments
    seen: [AtomicU64; LIFECYCLE_EVENTS.len()],
}

/// Lifecycle counters mirrored from the registry
const LIFECYCLE_EVENTS: [&str; 5] = ["discovered", "bound", "recreated", "removed", "failed"];

impl ManagerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let volumes = IntGaugeVec::new(
            Opts::new("volumes", "Tracked volume records by phase").namespace(NAMESPACE),
            &["phase"],
        )?;
        let claims =
            IntGauge::with_opts(Opts::new("claims", "Tracked claims").namespace(NAMESPACE))?;
        let pending_claims = IntGauge::with_opts(
            Opts::new("claims_pending", "Claims waiting for a volume").namespace(NAMESPACE),
        )?;
        let quarantined = IntGauge::with_opts(
            Opts::new("volumes_quarantined", "Published volumes held back from adoption")
                .namespace(NAMESPACE),
        )?;
        let lifecycle = IntCounterVec::new(
            Opts::new("lifecycle_events_total", "Volume lifecycle transitions")
                .namespace(NAMESPACE),
            &["event"],
        )?;
        let pass_errors = IntCounterVec::new(
            Opts::new("pass_errors_total", "Reconcile passes that failed").namespace(NAMESPACE),
            &["loop"],
        )?;
        let pass_duration = HistogramVec::new(
            HistogramOpts::new("pass_duration_seconds", "Reconcile pass duration")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.005, 0.025, 0.1, 0.5, 2.5, 10.0]),
            &["loop"],
        )?;
        let scan_root_errors = IntCounter::with_opts(
            Opts::new("scan_root_errors_total", "Discovery roots that could not be listed")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(volumes.clone()))?;
        registry.register(Box::new(claims.clone()))?;
        registry.register(Box::new(pending_claims.clone()))?;
        registry.register(Box::new(quarantined.clone()))?;
        registry.register(Box::new(lifecycle.clone()))?;
        registry.register(Box::new(pass_errors.clone()))?;
        registry.register(Box::new(pass_duration.clone()))?;
        registry.register(Box::new(scan_root_errors.clone()))?;

        Ok(Self {
            registry,
            volumes,
            claims,
            pending_claims,
            quarantined,
            lifecycle,
            pass_errors,
            pass_duration,
            scan_root_errors,
            seen: Default::default(),
        })
    }

    /// Refresh gauges and counters from a registry snapshot
    pub fn observe_registry(&self, stats: &RegistryStatsSnapshot) {
        for (phase, count) in [
            ("pending", stats.pending),
            ("available", stats.available),
            ("bound", stats.bound),
            ("released", stats.released),
            ("failed", stats.failed),
        ] {
            self.volumes.with_label_values(&[phase]).set(count as i64);
        }
        self.claims.set(stats.total_claims as i64);
        self.pending_claims.set(stats.pending_claims as i64);
        self.quarantined.set(stats.quarantined as i64);

        let totals = [
            stats.discoveries,
            stats.bindings,
            stats.recreations,
            stats.removals,
            stats.failures,
        ];
        for ((event, seen), total) in LIFECYCLE_EVENTS.iter().zip(&self.seen).zip(totals) {
            let previous = seen.swap(total, Ordering::Relaxed);
            if total > previous {
                self.lifecycle
                    .with_label_values(&[*event])
                    .inc_by(total - previous);
            }
        }
    }

    /// Record one reconcile pass of a loop
    pub fn observe_pass(&self, loop_name: &str, seconds: f64, failed: bool) {
        self.pass_duration
            .with_label_values(&[loop_name])
            .observe(seconds);
        if failed {
            self.pass_errors.with_label_values(&[loop_name]).inc();
        }
    }

    pub fn observe_scan(&self, report: &ScanReport) {
        self.scan_root_errors.inc_by(report.root_errors as u64);
    }

    /// Render in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for ManagerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerMetrics").finish_non_exhaustive()
    }
}

//! Sharded Volume Registry
//!
//! Tracks every discovered local volume and every claim this node manages.
//! Records are never mutated directly: each lifecycle step is an atomic
//! compare-and-swap on the record's phase, taken under the owning shard's
//! lock, which makes transitions linearizable per record.
//!
//! Lock order is always claim table first, then a volume shard.

use super::RegistryEvent;
use crate::domain::{
    ClaimId, ClaimPhase, ClaimRecord, DiscoveredPath, NodeName, VolumeId, VolumeKey,
    VolumePhase, VolumeRecord,
};
use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Number of shards for volume records
pub const REGISTRY_SHARD_COUNT: usize = 16;

/// Capacity of the event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Outcomes
// =============================================================================

/// Result of an upsert
#[derive(Debug, Clone)]
pub struct Upserted {
    /// The live record for the path
    pub record: VolumeRecord,
    /// Whether the record was minted by this call
    pub created: bool,
}

/// Result of a bind attempt
#[derive(Debug, Clone)]
pub enum BindOutcome {
    /// Both records are now Bound to each other
    Bound(VolumeRecord),
    /// The volume is no longer Available (another claim won, or it is gone)
    Contended,
    /// The claim is already bound or lost
    ClaimNotPending,
    /// Storage class or capacity does not match
    Incompatible,
}

// =============================================================================
// Registry Shard
// =============================================================================

#[derive(Debug, Default)]
struct ShardState {
    /// Live records by path
    volumes: HashMap<VolumeKey, VolumeRecord>,
    /// Last generation minted per path; survives record removal
    generations: HashMap<VolumeKey, u64>,
    /// Paths held by a published volume that could not be adopted
    quarantined: HashSet<VolumeKey>,
}

/// A single shard of the registry
struct RegistryShard {
    state: RwLock<ShardState>,
}

impl RegistryShard {
    fn new() -> Self {
        Self {
            state: RwLock::new(ShardState::default()),
        }
    }
}

/// Get the shard index for a key
#[inline]
fn shard_index(key: &VolumeKey) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % REGISTRY_SHARD_COUNT
}

/// Oldest pending claim that names `volume_id`
fn reservation_holder<'a>(
    claims: &'a BTreeMap<ClaimId, ClaimRecord>,
    volume_id: &VolumeId,
) -> Option<&'a ClaimId> {
    claims
        .values()
        .filter(|c| c.phase == ClaimPhase::Pending && c.requested_volume.as_ref() == Some(volume_id))
        .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
        .map(|c| &c.id)
}

// =============================================================================
// Statistics
// =============================================================================

/// Lifetime counters
#[derive(Debug, Default)]
struct RegistryCounters {
    discoveries: AtomicU64,
    bindings: AtomicU64,
    recreations: AtomicU64,
    removals: AtomicU64,
    failures: AtomicU64,
    refused_removals: AtomicU64,
    quarantines: AtomicU64,
}

/// Snapshot of registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatsSnapshot {
    pub total_volumes: u64,
    pub pending: u64,
    pub available: u64,
    pub bound: u64,
    pub released: u64,
    pub failed: u64,
    pub total_claims: u64,
    pub pending_claims: u64,
    pub discoveries: u64,
    pub bindings: u64,
    pub recreations: u64,
    pub removals: u64,
    pub failures: u64,
    pub refused_removals: u64,
    pub quarantined: u64,
}

// =============================================================================
// Volume Registry
// =============================================================================

/// Registry of volume and claim records
pub struct VolumeRegistry {
    /// Volume records sharded by path
    shards: Vec<RegistryShard>,
    /// Volume id to path
    index: DashMap<VolumeId, VolumeKey>,
    /// Claim records
    claims: Mutex<BTreeMap<ClaimId, ClaimRecord>>,
    counters: RegistryCounters,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl VolumeRegistry {
    /// Create a new volume registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build())
    }

    fn build() -> Self {
        let shards = (0..REGISTRY_SHARD_COUNT)
            .map(|_| RegistryShard::new())
            .collect();
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            shards,
            index: DashMap::new(),
            claims: Mutex::new(BTreeMap::new()),
            counters: RegistryCounters::default(),
            event_sender,
        }
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.event_sender.send(event);
    }

    fn shard(&self, key: &VolumeKey) -> &RegistryShard {
        &self.shards[shard_index(key)]
    }

    // =========================================================================
    // Volume Records
    // =========================================================================

    /// Register a discovered path.
    ///
    /// A no-op while the path has a record. Once the previous record has been
    /// removed, a new record with a fresh id and the next generation is minted.
    pub fn upsert(&self, source: DiscoveredPath) -> Upserted {
        let key = source.key();
        let mut state = self.shard(&key).state.write();

        if let Some(existing) = state.volumes.get(&key) {
            return Upserted {
                record: existing.clone(),
                created: false,
            };
        }

        let generation = {
            let counter = state.generations.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let record = VolumeRecord::pending(source, generation);
        state.volumes.insert(key.clone(), record.clone());
        self.index.insert(record.id.clone(), key);
        drop(state);

        self.counters.discoveries.fetch_add(1, Ordering::Relaxed);
        info!(
            volume = %record.id,
            path = %record.path().display(),
            generation,
            "Discovered local volume"
        );
        self.emit(RegistryEvent::VolumeDiscovered {
            volume_id: record.id.clone(),
            path: record.path().to_path_buf(),
            generation,
        });

        Upserted {
            record,
            created: true,
        }
    }

    /// Insert a record rebuilt from an already-published volume.
    ///
    /// Refused when the path already has a record.
    pub fn adopt(&self, mut record: VolumeRecord) -> Result<VolumeRecord> {
        let key = record.key();
        let mut state = self.shard(&key).state.write();

        if let Some(existing) = state.volumes.get(&key) {
            return Err(Error::InvariantViolation {
                subject: record.id.to_string(),
                reason: format!("path {} already tracked as {}", key, existing.id),
            });
        }

        let counter = state.generations.entry(key.clone()).or_insert(0);
        *counter = (*counter).max(record.generation);
        record.generation = *counter;
        record.published = true;

        state.volumes.insert(key.clone(), record.clone());
        self.index.insert(record.id.clone(), key);
        drop(state);

        info!(volume = %record.id, phase = %record.phase, "Adopted existing volume");
        Ok(record)
    }

    /// Hold a path for a published volume that could not be adopted.
    ///
    /// The record is kept Failed under the volume's own id. The path is never
    /// rediscovered or removed while the process runs, so content left by the
    /// volume's claim cannot resurface under a fresh identity.
    pub fn quarantine(&self, mut record: VolumeRecord, reason: impl Into<String>) -> Result<VolumeRecord> {
        let key = record.key();
        let reason = reason.into();
        let mut state = self.shard(&key).state.write();

        if let Some(existing) = state.volumes.get(&key) {
            return Err(Error::InvariantViolation {
                subject: record.id.to_string(),
                reason: format!("path {} already tracked as {}", key, existing.id),
            });
        }

        let counter = state.generations.entry(key.clone()).or_insert(0);
        *counter = (*counter).max(record.generation);
        record.generation = *counter;
        record.phase = VolumePhase::Failed;
        record.published = true;
        record.failure = Some(reason.clone());

        state.volumes.insert(key.clone(), record.clone());
        state.quarantined.insert(key.clone());
        self.index.insert(record.id.clone(), key.clone());
        drop(state);

        self.counters.quarantines.fetch_add(1, Ordering::Relaxed);
        warn!(volume = %record.id, path = %key, %reason, "Quarantined published volume");
        self.emit(RegistryEvent::VolumeFailed {
            volume_id: record.id.clone(),
            reason,
        });
        Ok(record)
    }

    /// Whether a path is held by a quarantined volume
    pub fn is_quarantined(&self, key: &VolumeKey) -> bool {
        self.shard(key).state.read().quarantined.contains(key)
    }

    /// Remove the record for a path whose directory disappeared.
    ///
    /// Bound and Released records are refused: those are owned by the
    /// recreation cycle. Quarantined paths are refused as well.
    pub fn remove(&self, key: &VolumeKey) -> Result<Option<VolumeRecord>> {
        let mut state = self.shard(key).state.write();

        let phase = match state.volumes.get(key) {
            Some(record) => record.phase,
            None => return Ok(None),
        };

        if matches!(phase, VolumePhase::Bound | VolumePhase::Released)
            || state.quarantined.contains(key)
        {
            drop(state);
            self.counters.refused_removals.fetch_add(1, Ordering::Relaxed);
            warn!(path = %key, %phase, "Refusing to remove volume outside recreation");
            return Err(Error::InvariantViolation {
                subject: key.to_string(),
                reason: format!("cannot remove a {} volume", phase),
            });
        }

        let removed = state.volumes.remove(key);
        drop(state);

        if let Some(record) = &removed {
            self.index.remove(&record.id);
            self.counters.removals.fetch_add(1, Ordering::Relaxed);
            info!(volume = %record.id, path = %key, "Removed volume record");
            self.emit(RegistryEvent::VolumeRemoved {
                volume_id: record.id.clone(),
                path: record.path().to_path_buf(),
                recreated: false,
            });
        }

        Ok(removed)
    }

    /// Apply `apply` to a record if its phase is one of `expected`
    fn transition<F>(&self, id: &VolumeId, expected: &[VolumePhase], apply: F) -> Result<VolumeRecord>
    where
        F: FnOnce(&mut VolumeRecord),
    {
        let key = self.key_of(id)?;
        let mut state = self.shard(&key).state.write();

        let record = state
            .volumes
            .get_mut(&key)
            .filter(|r| r.id == *id)
            .ok_or_else(|| Error::VolumeNotFound {
                volume_id: id.to_string(),
            })?;

        if !expected.contains(&record.phase) {
            return Err(Error::InvariantViolation {
                subject: id.to_string(),
                reason: format!("unexpected phase {} (expected one of {:?})", record.phase, expected),
            });
        }

        apply(record);
        Ok(record.clone())
    }

    fn key_of(&self, id: &VolumeId) -> Result<VolumeKey> {
        self.index
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::VolumeNotFound {
                volume_id: id.to_string(),
            })
    }

    /// Pending -> Available once the path's capacity is known
    pub fn mark_available(&self, id: &VolumeId, capacity_bytes: u64) -> Result<VolumeRecord> {
        let record = self.transition(id, &[VolumePhase::Pending], |r| {
            r.capacity_bytes = capacity_bytes;
            r.phase = VolumePhase::Available;
        })?;

        debug!(volume = %id, capacity_bytes, "Volume available");
        self.emit(RegistryEvent::VolumeAvailable {
            volume_id: id.clone(),
            capacity_bytes,
        });
        Ok(record)
    }

    /// Pending -> Failed; failed records are left for an operator
    pub fn mark_failed(&self, id: &VolumeId, reason: impl Into<String>) -> Result<VolumeRecord> {
        let reason = reason.into();
        let record = self.transition(id, &[VolumePhase::Pending], |r| {
            r.phase = VolumePhase::Failed;
            r.failure = Some(reason.clone());
        })?;

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        warn!(volume = %id, %reason, "Volume failed");
        self.emit(RegistryEvent::VolumeFailed {
            volume_id: id.clone(),
            reason,
        });
        Ok(record)
    }

    /// Record that the cluster object for a volume exists
    pub fn mark_published(&self, id: &VolumeId) -> Result<VolumeRecord> {
        let record = self.transition(
            id,
            &[VolumePhase::Available, VolumePhase::Bound],
            |r| r.published = true,
        )?;

        self.emit(RegistryEvent::VolumePublished {
            volume_id: id.clone(),
        });
        Ok(record)
    }

    /// Bind a claim to a volume.
    ///
    /// Both records flip to Bound together or neither does. Losing the race
    /// for the volume is reported as [`BindOutcome::Contended`], not an error.
    /// A volume named by a pending claim is reserved for the oldest such claim.
    pub fn bind(&self, volume_id: &VolumeId, claim_id: &ClaimId) -> Result<BindOutcome> {
        let mut claims = self.claims.lock();
        let claim = claims.get(claim_id).ok_or_else(|| Error::ClaimNotFound {
            claim_id: claim_id.to_string(),
        })?;

        if claim.phase != ClaimPhase::Pending {
            return Ok(BindOutcome::ClaimNotPending);
        }
        if claim
            .requested_volume
            .as_ref()
            .is_some_and(|requested| requested != volume_id)
        {
            return Ok(BindOutcome::Incompatible);
        }
        if reservation_holder(&claims, volume_id).is_some_and(|holder| holder != claim_id) {
            return Ok(BindOutcome::Contended);
        }

        let key = match self.index.get(volume_id) {
            Some(entry) => entry.value().clone(),
            None => return Ok(BindOutcome::Contended),
        };

        let mut state = self.shard(&key).state.write();
        let record = match state.volumes.get_mut(&key).filter(|r| r.id == *volume_id) {
            Some(record) => record,
            None => return Ok(BindOutcome::Contended),
        };

        if record.phase != VolumePhase::Available || !record.published {
            return Ok(BindOutcome::Contended);
        }
        if !claim.is_satisfied_by(record) {
            return Ok(BindOutcome::Incompatible);
        }

        record.phase = VolumePhase::Bound;
        record.claim = Some(claim_id.clone());
        let bound = record.clone();
        drop(state);

        if let Some(claim) = claims.get_mut(claim_id) {
            claim.phase = ClaimPhase::Bound;
            claim.volume = Some(volume_id.clone());
        }
        drop(claims);

        self.counters.bindings.fetch_add(1, Ordering::Relaxed);
        info!(volume = %volume_id, claim = %claim_id, "Bound claim to volume");
        self.emit(RegistryEvent::VolumeBound {
            volume_id: volume_id.clone(),
            claim_id: claim_id.clone(),
        });

        Ok(BindOutcome::Bound(bound))
    }

    /// Oldest pending claim naming `volume_id`, if any
    pub fn reserved_for(&self, volume_id: &VolumeId) -> Option<ClaimId> {
        reservation_holder(&self.claims.lock(), volume_id).cloned()
    }

    /// Undo a binding that could not be recorded in the cluster
    pub fn rollback_binding(&self, volume_id: &VolumeId, claim_id: &ClaimId) -> Result<()> {
        let mut claims = self.claims.lock();
        let key = self.key_of(volume_id)?;
        let mut state = self.shard(&key).state.write();

        let record = state
            .volumes
            .get_mut(&key)
            .filter(|r| r.id == *volume_id)
            .ok_or_else(|| Error::VolumeNotFound {
                volume_id: volume_id.to_string(),
            })?;

        if record.phase != VolumePhase::Bound || record.claim.as_ref() != Some(claim_id) {
            return Err(Error::InvariantViolation {
                subject: volume_id.to_string(),
                reason: format!("not bound to {}", claim_id),
            });
        }

        record.phase = VolumePhase::Available;
        record.claim = None;
        if let Some(claim) = claims.get_mut(claim_id) {
            claim.phase = ClaimPhase::Pending;
            claim.volume = None;
        }
        drop(state);
        drop(claims);

        warn!(volume = %volume_id, claim = %claim_id, "Rolled back binding");
        self.emit(RegistryEvent::BindingRolledBack {
            volume_id: volume_id.clone(),
            claim_id: claim_id.clone(),
        });
        Ok(())
    }

    /// Bound -> Released for a volume whose claim is gone
    pub fn release_volume(&self, volume_id: &VolumeId) -> Result<VolumeRecord> {
        let mut released_claim = None;
        let record = self.transition(volume_id, &[VolumePhase::Bound], |r| {
            r.phase = VolumePhase::Released;
            released_claim = r.claim.clone();
        })?;

        let claim_id = released_claim.unwrap_or_else(|| ClaimId::from("<unknown>"));
        info!(volume = %volume_id, claim = %claim_id, "Volume released");
        self.emit(RegistryEvent::VolumeReleased {
            volume_id: volume_id.clone(),
            claim_id,
        });
        Ok(record)
    }

    /// Released -> removed, once content has been wiped and the cluster
    /// object deleted. The path becomes eligible for rediscovery.
    pub fn finalize_recreation(&self, volume_id: &VolumeId) -> Result<VolumeRecord> {
        let key = self.key_of(volume_id)?;
        let mut state = self.shard(&key).state.write();

        let phase = state
            .volumes
            .get(&key)
            .filter(|r| r.id == *volume_id)
            .map(|r| r.phase)
            .ok_or_else(|| Error::VolumeNotFound {
                volume_id: volume_id.to_string(),
            })?;

        if phase != VolumePhase::Released {
            return Err(Error::InvariantViolation {
                subject: volume_id.to_string(),
                reason: format!("cannot recreate a {} volume", phase),
            });
        }

        let record = state.volumes.remove(&key).ok_or_else(|| Error::VolumeNotFound {
            volume_id: volume_id.to_string(),
        })?;
        drop(state);
        self.index.remove(volume_id);

        self.counters.recreations.fetch_add(1, Ordering::Relaxed);
        info!(volume = %volume_id, path = %key, "Volume recreated, path open for rediscovery");
        self.emit(RegistryEvent::VolumeRemoved {
            volume_id: volume_id.clone(),
            path: record.path().to_path_buf(),
            recreated: true,
        });
        Ok(record)
    }

    /// Get a record by id
    pub fn get(&self, id: &VolumeId) -> Option<VolumeRecord> {
        let key = self.index.get(id)?.value().clone();
        self.shard(&key)
            .state
            .read()
            .volumes
            .get(&key)
            .filter(|r| r.id == *id)
            .cloned()
    }

    /// Get the record for a path
    pub fn get_by_path(&self, key: &VolumeKey) -> Option<VolumeRecord> {
        self.shard(key).state.read().volumes.get(key).cloned()
    }

    /// All records, earliest discovered first
    pub fn records(&self) -> Vec<VolumeRecord> {
        let mut records: Vec<VolumeRecord> = self
            .shards
            .iter()
            .flat_map(|shard| shard.state.read().volumes.values().cloned().collect::<Vec<_>>())
            .collect();
        records.sort_by(|a, b| a.discovered_at.cmp(&b.discovered_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Records in a phase, earliest discovered first
    pub fn records_in_phase(&self, phase: VolumePhase) -> Vec<VolumeRecord> {
        self.records().into_iter().filter(|r| r.phase == phase).collect()
    }

    /// Tracked paths of a node found under a discovery root
    pub fn paths_under(&self, node: &NodeName, root: &Path) -> Vec<VolumeKey> {
        self.records()
            .into_iter()
            .filter(|r| r.source.node == *node && r.source.root == root)
            .map(|r| r.key())
            .collect()
    }

    // =========================================================================
    // Claim Records
    // =========================================================================

    /// Register a new Pending claim; a no-op if the id is known
    pub fn insert_claim(&self, claim: ClaimRecord) -> bool {
        let mut claims = self.claims.lock();
        if claims.contains_key(&claim.id) {
            return false;
        }
        let claim_id = claim.id.clone();
        claims.insert(claim_id.clone(), claim);
        drop(claims);

        debug!(claim = %claim_id, "Registered claim");
        self.emit(RegistryEvent::ClaimCreated { claim_id });
        true
    }

    /// Register a claim that the cluster already shows bound to one of our
    /// volumes. The volume must already be Bound to this claim.
    pub fn adopt_bound_claim(&self, mut claim: ClaimRecord, volume_id: &VolumeId) -> Result<()> {
        let mut claims = self.claims.lock();
        if claims.contains_key(&claim.id) {
            return Ok(());
        }

        let key = self.key_of(volume_id)?;
        let state = self.shard(&key).state.read();
        let bound_here = state
            .volumes
            .get(&key)
            .filter(|r| r.id == *volume_id)
            .map(|r| r.phase == VolumePhase::Bound && r.claim.as_ref() == Some(&claim.id))
            .unwrap_or(false);
        drop(state);

        if !bound_here {
            return Err(Error::InvariantViolation {
                subject: claim.id.to_string(),
                reason: format!("volume {} is not bound to this claim", volume_id),
            });
        }

        claim.phase = ClaimPhase::Bound;
        claim.volume = Some(volume_id.clone());
        claims.insert(claim.id.clone(), claim);
        Ok(())
    }

    /// Delete a claim and release its volume, if bound.
    ///
    /// Returns the released volume. Deleting an unknown claim is a no-op.
    pub fn release_claim(&self, claim_id: &ClaimId) -> Result<Option<VolumeId>> {
        let mut claims = self.claims.lock();
        let claim = match claims.remove(claim_id) {
            Some(claim) => claim,
            None => return Ok(None),
        };

        let mut released = None;
        if let Some(volume_id) = &claim.volume {
            if let Some(key) = self.index.get(volume_id).map(|e| e.value().clone()) {
                let mut state = self.shard(&key).state.write();
                if let Some(record) = state.volumes.get_mut(&key).filter(|r| r.id == *volume_id) {
                    if record.phase == VolumePhase::Bound && record.claim.as_ref() == Some(claim_id) {
                        record.phase = VolumePhase::Released;
                        released = Some(volume_id.clone());
                    }
                }
            }
        }
        drop(claims);

        info!(claim = %claim_id, "Claim deleted");
        self.emit(RegistryEvent::ClaimDeleted {
            claim_id: claim_id.clone(),
        });
        if let Some(volume_id) = &released {
            info!(volume = %volume_id, claim = %claim_id, "Volume released");
            self.emit(RegistryEvent::VolumeReleased {
                volume_id: volume_id.clone(),
                claim_id: claim_id.clone(),
            });
        }

        Ok(released)
    }

    /// Get a claim by id
    pub fn get_claim(&self, claim_id: &ClaimId) -> Option<ClaimRecord> {
        self.claims.lock().get(claim_id).cloned()
    }

    /// All claims
    pub fn claims(&self) -> Vec<ClaimRecord> {
        self.claims.lock().values().cloned().collect()
    }

    /// Pending claims, oldest first
    pub fn pending_claims(&self) -> Vec<ClaimRecord> {
        let mut pending: Vec<ClaimRecord> = self
            .claims
            .lock()
            .values()
            .filter(|c| c.phase == ClaimPhase::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        pending
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Get a statistics snapshot
    pub fn stats(&self) -> RegistryStatsSnapshot {
        let mut snapshot = RegistryStatsSnapshot::default();

        for shard in &self.shards {
            for record in shard.state.read().volumes.values() {
                snapshot.total_volumes += 1;
                match record.phase {
                    VolumePhase::Pending => snapshot.pending += 1,
                    VolumePhase::Available => snapshot.available += 1,
                    VolumePhase::Bound => snapshot.bound += 1,
                    VolumePhase::Released => snapshot.released += 1,
                    VolumePhase::Failed => snapshot.failed += 1,
                }
            }
        }

        {
            let claims = self.claims.lock();
            snapshot.total_claims = claims.len() as u64;
            snapshot.pending_claims = claims
                .values()
                .filter(|c| c.phase == ClaimPhase::Pending)
                .count() as u64;
        }

        snapshot.discoveries = self.counters.discoveries.load(Ordering::Relaxed);
        snapshot.bindings = self.counters.bindings.load(Ordering::Relaxed);
        snapshot.recreations = self.counters.recreations.load(Ordering::Relaxed);
        snapshot.removals = self.counters.removals.load(Ordering::Relaxed);
        snapshot.failures = self.counters.failures.load(Ordering::Relaxed);
        snapshot.refused_removals = self.counters.refused_removals.load(Ordering::Relaxed);
        snapshot.quarantined = self.counters.quarantines.load(Ordering::Relaxed);
        snapshot
    }
}

impl Default for VolumeRegistry {
    fn default() -> Self {
        Self::build()
    }
}

impl std::fmt::Debug for VolumeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeRegistry")
            .field("volumes", &self.index.len())
            .field("claims", &self.claims.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::thread;

    fn source(path: &str) -> DiscoveredPath {
        DiscoveredPath::new("node-1".into(), path, "/tmp/disks", "local-sc")
    }

    fn available(registry: &VolumeRegistry, path: &str, capacity: u64) -> VolumeRecord {
        let upserted = registry.upsert(source(path));
        registry.mark_available(&upserted.record.id, capacity).unwrap();
        registry.mark_published(&upserted.record.id).unwrap()
    }

    #[test]
    fn test_shard_index_is_stable() {
        let a = VolumeKey::new("node-1", "/tmp/disks/vol-a");
        let b = VolumeKey::new("node-1", "/tmp/disks/vol-a");
        assert_eq!(shard_index(&a), shard_index(&b));
        assert!(shard_index(&a) < REGISTRY_SHARD_COUNT);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let registry = VolumeRegistry::new();

        let first = registry.upsert(source("/tmp/disks/vol-a"));
        let second = registry.upsert(source("/tmp/disks/vol-a"));

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.record.id, second.record.id);
        assert_eq!(first.record.phase, VolumePhase::Pending);
        assert_eq!(registry.stats().total_volumes, 1);
    }

    #[test]
    fn test_recreation_mints_fresh_identity() {
        let registry = VolumeRegistry::new();
        let volume = available(&registry, "/tmp/disks/vol-a", 1 << 30);

        registry.insert_claim(ClaimRecord::pending("ns/pvc".into(), "local-sc", 1024));
        assert_matches!(registry.bind(&volume.id, &"ns/pvc".into()), Ok(BindOutcome::Bound(_)));

        let released = registry.release_claim(&"ns/pvc".into()).unwrap();
        assert_eq!(released.as_ref(), Some(&volume.id));
        assert_eq!(registry.get(&volume.id).unwrap().phase, VolumePhase::Released);

        // Still tracked while Released: rediscovery is a no-op
        let during = registry.upsert(source("/tmp/disks/vol-a"));
        assert!(!during.created);

        registry.finalize_recreation(&volume.id).unwrap();
        assert!(registry.get(&volume.id).is_none());

        let reborn = registry.upsert(source("/tmp/disks/vol-a"));
        assert!(reborn.created);
        assert_ne!(reborn.record.id, volume.id);
        assert_eq!(reborn.record.generation, volume.generation + 1);
        assert_eq!(registry.stats().recreations, 1);
    }

    #[test]
    fn test_remove_refuses_bound_volume() {
        let registry = VolumeRegistry::new();
        let volume = available(&registry, "/tmp/disks/vol-a", 1 << 30);
        registry.insert_claim(ClaimRecord::pending("ns/pvc".into(), "local-sc", 1024));
        registry.bind(&volume.id, &"ns/pvc".into()).unwrap();

        let result = registry.remove(&volume.key());
        assert_matches!(result, Err(Error::InvariantViolation { .. }));
        assert_eq!(registry.get(&volume.id).unwrap().phase, VolumePhase::Bound);
        assert_eq!(registry.stats().refused_removals, 1);
    }

    #[test]
    fn test_remove_available_volume() {
        let registry = VolumeRegistry::new();
        let volume = available(&registry, "/tmp/disks/vol-a", 1 << 30);

        let removed = registry.remove(&volume.key()).unwrap();
        assert_eq!(removed.unwrap().id, volume.id);
        assert!(registry.get(&volume.id).is_none());

        // Removing again is a no-op
        assert!(registry.remove(&volume.key()).unwrap().is_none());
    }

    #[test]
    fn test_failed_only_from_pending() {
        let registry = VolumeRegistry::new();
        let upserted = registry.upsert(source("/tmp/disks/vol-a"));

        let failed = registry.mark_failed(&upserted.record.id, "permission denied").unwrap();
        assert_eq!(failed.phase, VolumePhase::Failed);
        assert_eq!(failed.failure.as_deref(), Some("permission denied"));

        // No automatic way back
        assert!(registry.mark_available(&upserted.record.id, 1).is_err());
    }

    #[test]
    fn test_bind_requires_publication_and_match() {
        let registry = VolumeRegistry::new();
        let upserted = registry.upsert(source("/tmp/disks/vol-a"));
        registry.mark_available(&upserted.record.id, 10 * 1024 * 1024).unwrap();

        registry.insert_claim(ClaimRecord::pending("ns/small".into(), "local-sc", 1024));
        registry.insert_claim(ClaimRecord::pending("ns/huge".into(), "local-sc", 1 << 40));
        registry.insert_claim(ClaimRecord::pending("ns/other".into(), "fast-sc", 1024));

        // Not yet published
        assert_matches!(
            registry.bind(&upserted.record.id, &"ns/small".into()),
            Ok(BindOutcome::Contended)
        );

        registry.mark_published(&upserted.record.id).unwrap();
        assert_matches!(
            registry.bind(&upserted.record.id, &"ns/huge".into()),
            Ok(BindOutcome::Incompatible)
        );
        assert_matches!(
            registry.bind(&upserted.record.id, &"ns/other".into()),
            Ok(BindOutcome::Incompatible)
        );
        assert_matches!(
            registry.bind(&upserted.record.id, &"ns/small".into()),
            Ok(BindOutcome::Bound(_))
        );

        let claim = registry.get_claim(&"ns/small".into()).unwrap();
        assert_eq!(claim.phase, ClaimPhase::Bound);
        assert_eq!(claim.volume.as_ref(), Some(&upserted.record.id));
    }

    #[test]
    fn test_claim_binds_only_once() {
        let registry = VolumeRegistry::new();
        let a = available(&registry, "/tmp/disks/vol-a", 1 << 30);
        let b = available(&registry, "/tmp/disks/vol-b", 1 << 30);
        registry.insert_claim(ClaimRecord::pending("ns/pvc".into(), "local-sc", 1024));

        assert_matches!(registry.bind(&a.id, &"ns/pvc".into()), Ok(BindOutcome::Bound(_)));
        assert_matches!(
            registry.bind(&b.id, &"ns/pvc".into()),
            Ok(BindOutcome::ClaimNotPending)
        );
        assert_eq!(registry.get(&b.id).unwrap().phase, VolumePhase::Available);
    }

    #[test]
    fn test_requested_volume_is_reserved() {
        let registry = VolumeRegistry::new();
        let a = available(&registry, "/tmp/disks/vol-a", 1 << 30);
        let b = available(&registry, "/tmp/disks/vol-b", 1 << 30);

        let mut prebound =
            ClaimRecord::pending("ns/pre".into(), "local-sc", 1024).with_requested_volume(a.id.clone());
        prebound.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        registry.insert_claim(prebound);
        registry.insert_claim(ClaimRecord::pending("ns/other".into(), "local-sc", 1024));
        assert_eq!(registry.reserved_for(&a.id), Some("ns/pre".into()));

        // Other claims cannot take the named volume
        assert_matches!(
            registry.bind(&a.id, &"ns/other".into()),
            Ok(BindOutcome::Contended)
        );
        // The pre-bound claim cannot take any other volume
        assert_matches!(
            registry.bind(&b.id, &"ns/pre".into()),
            Ok(BindOutcome::Incompatible)
        );

        assert_matches!(registry.bind(&a.id, &"ns/pre".into()), Ok(BindOutcome::Bound(_)));
        assert_matches!(registry.bind(&b.id, &"ns/other".into()), Ok(BindOutcome::Bound(_)));
        assert_eq!(registry.reserved_for(&a.id), None);
    }

    #[test]
    fn test_quarantined_path_is_held() {
        let registry = VolumeRegistry::new();
        let mut record = VolumeRecord::pending(source("/tmp/disks/vol-a"), 3);
        record.claim = Some("ns/pvc".into());
        let key = record.key();

        let held = registry.quarantine(record, "pinned elsewhere").unwrap();
        assert_eq!(held.phase, VolumePhase::Failed);
        assert!(held.published);
        assert!(registry.is_quarantined(&key));

        // Rediscovery does not mint a new identity
        let upserted = registry.upsert(source("/tmp/disks/vol-a"));
        assert!(!upserted.created);
        assert_eq!(upserted.record.id, held.id);

        assert_matches!(registry.remove(&key), Err(Error::InvariantViolation { .. }));
        assert!(registry.get(&held.id).is_some());
        assert_eq!(registry.stats().quarantined, 1);
        assert_eq!(registry.stats().failed, 1);
    }

    #[test]
    fn test_concurrent_binds_single_winner() {
        let registry = VolumeRegistry::new();
        let volume = available(&registry, "/tmp/disks/vol-a", 1 << 30);

        for i in 0..16 {
            registry.insert_claim(ClaimRecord::pending(
                ClaimId::new("ns", &format!("pvc-{}", i)),
                "local-sc",
                1024,
            ));
        }

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                let volume_id = volume.id.clone();
                thread::spawn(move || {
                    let claim_id = ClaimId::new("ns", &format!("pvc-{}", i));
                    matches!(registry.bind(&volume_id, &claim_id), Ok(BindOutcome::Bound(_)))
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        let bound_claims = registry
            .claims()
            .into_iter()
            .filter(|c| c.phase == ClaimPhase::Bound)
            .count();
        assert_eq!(bound_claims, 1);
        assert_eq!(registry.stats().pending_claims, 15);
    }

    #[test]
    fn test_rollback_restores_both_records() {
        let registry = VolumeRegistry::new();
        let volume = available(&registry, "/tmp/disks/vol-a", 1 << 30);
        registry.insert_claim(ClaimRecord::pending("ns/pvc".into(), "local-sc", 1024));
        registry.bind(&volume.id, &"ns/pvc".into()).unwrap();

        registry.rollback_binding(&volume.id, &"ns/pvc".into()).unwrap();

        assert_eq!(registry.get(&volume.id).unwrap().phase, VolumePhase::Available);
        assert_eq!(
            registry.get_claim(&"ns/pvc".into()).unwrap().phase,
            ClaimPhase::Pending
        );
    }

    #[test]
    fn test_finalize_requires_released() {
        let registry = VolumeRegistry::new();
        let volume = available(&registry, "/tmp/disks/vol-a", 1 << 30);

        assert_matches!(
            registry.finalize_recreation(&volume.id),
            Err(Error::InvariantViolation { .. })
        );
    }

    #[test]
    fn test_pending_claims_oldest_first() {
        let registry = VolumeRegistry::new();
        let mut older = ClaimRecord::pending("ns/b".into(), "local-sc", 1);
        older.created_at = chrono::Utc::now() - chrono::Duration::seconds(60);
        let newer = ClaimRecord::pending("ns/a".into(), "local-sc", 1);

        registry.insert_claim(newer);
        registry.insert_claim(older);

        let ids: Vec<String> = registry
            .pending_claims()
            .into_iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(ids, vec!["ns/b", "ns/a"]);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let registry = VolumeRegistry::new();
        let mut events = registry.subscribe();

        let upserted = registry.upsert(source("/tmp/disks/vol-a"));
        registry.mark_available(&upserted.record.id, 42).unwrap();

        assert_matches!(
            events.recv().await.unwrap(),
            RegistryEvent::VolumeDiscovered { generation: 1, .. }
        );
        assert_matches!(
            events.recv().await.unwrap(),
            RegistryEvent::VolumeAvailable { capacity_bytes: 42, .. }
        );
    }
}

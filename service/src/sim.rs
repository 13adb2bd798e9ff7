//! Simulated platform collaborators.
//!
//! Stand-ins for the device tracking stack, the localization service and the
//! remote anchor store. Requests are answered by posting completions on the
//! bus, so they reach the session through the same queue a real platform
//! would use.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anchorsync_core::{
    AnchorStorage, AnchorTracking, Collaborators, CreateResult, ExpirationPolicy, LocalAnchorId,
    LocalizationEvent, LocalizationService, LocalizationState, MapPositionId, Pose, RequestOp,
    RequestRejected, StorageCompletion, SubsystemLoader, TrackingQuality, Vec3,
};
use async_trait::async_trait;

use crate::bus::{CompletionSink, StorageSinks};

/// Id reported with a failed create-from-storage; no tracked anchor exists.
pub const NO_ANCHOR: LocalAnchorId = LocalAnchorId(0);

fn distance(a: Vec3, b: Vec3) -> f32 {
    let (dx, dy, dz) = (a.x - b.x, a.y - b.y, a.z - b.z);
    (dx * dx + dy * dy + dz * dz).sqrt()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracking
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SimulatedTracking {
    next_id: AtomicU64,
    anchors: Mutex<HashMap<LocalAnchorId, Pose>>,
    quality: Mutex<TrackingQuality>,
}

impl Default for SimulatedTracking {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(NO_ANCHOR.0 + 1),
            anchors: Mutex::new(HashMap::new()),
            quality: Mutex::new(TrackingQuality::Tracking),
        }
    }
}

impl SimulatedTracking {
    /// Quality reported for every anchor.
    pub fn set_quality(&self, quality: TrackingQuality) {
        *self.quality.lock().unwrap_or_else(PoisonError::into_inner) = quality;
    }

    pub fn pose(&self, id: LocalAnchorId) -> Option<Pose> {
        self.anchors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
    }

    /// Anchors currently tracked (created and not yet released).
    pub fn live_count(&self) -> usize {
        self.anchors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn spawn(&self, pose: Pose) -> LocalAnchorId {
        let id = LocalAnchorId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.anchors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, pose);
        id
    }
}

impl AnchorTracking for SimulatedTracking {
    fn create_anchor(&self, pose: Pose) -> Result<LocalAnchorId, RequestRejected> {
        Ok(self.spawn(pose))
    }

    fn tracking_quality(&self, id: LocalAnchorId) -> TrackingQuality {
        if self.pose(id).is_none() {
            return TrackingQuality::NotTracking;
        }
        *self.quality.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_anchor(&self, id: LocalAnchorId) {
        self.anchors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct StoredAnchor {
    pose: Pose,
    expiration: ExpirationPolicy,
}

/// In-memory remote anchor store.
#[derive(Debug)]
pub struct SimulatedStorage {
    stored: Mutex<BTreeMap<MapPositionId, StoredAnchor>>,
    rejecting: Mutex<HashSet<RequestOp>>,
    tracking: Arc<SimulatedTracking>,
    sinks: StorageSinks,
}

impl SimulatedStorage {
    pub fn new(tracking: Arc<SimulatedTracking>, sinks: StorageSinks) -> Self {
        Self {
            stored: Mutex::new(BTreeMap::new()),
            rejecting: Mutex::new(HashSet::new()),
            tracking,
            sinks,
        }
    }

    /// Put an anchor into the store directly, as if another device had
    /// published it.
    pub fn seed(&self, pose: Pose) -> MapPositionId {
        let id = mint_map_position_id();
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id.clone(),
                StoredAnchor {
                    pose,
                    expiration: ExpirationPolicy::Never,
                },
            );
        id
    }

    /// Remove an anchor behind the session's back.
    pub fn evict(&self, id: &MapPositionId) -> bool {
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn stored_ids(&self) -> Vec<MapPositionId> {
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn reject(&self, op: RequestOp, reject: bool) {
        let mut rejecting = self.rejecting.lock().unwrap_or_else(PoisonError::into_inner);
        if reject {
            rejecting.insert(op);
        } else {
            rejecting.remove(&op);
        }
    }

    fn admit(&self, op: RequestOp) -> Result<(), RequestRejected> {
        if self
            .rejecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&op)
        {
            return Err(RequestRejected::new(format!("anchor store busy ({op})")));
        }
        Ok(())
    }
}

fn mint_map_position_id() -> MapPositionId {
    let raw = uuid::Uuid::new_v4().to_string();
    match MapPositionId::new(raw) {
        Some(id) => id,
        // A v4 uuid string is never empty.
        None => unreachable!("uuid produced an empty string"),
    }
}

impl AnchorStorage for SimulatedStorage {
    fn query_stored_anchors(&self, center: Vec3, radius_m: f32) -> Result<(), RequestRejected> {
        self.admit(RequestOp::Query)?;
        let map_position_ids = self
            .stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, stored)| distance(stored.pose.position, center) <= radius_m)
            .map(|(id, _)| id.to_string())
            .collect();
        self.sinks
            .post(StorageCompletion::QueryCompleted { map_position_ids });
        Ok(())
    }

    fn create_anchors_from_storage(
        &self,
        map_position_ids: &[MapPositionId],
    ) -> Result<(), RequestRejected> {
        self.admit(RequestOp::CreateFromStorage)?;
        for id in map_position_ids {
            let stored = self
                .stored
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(id)
                .copied();
            let completion = match stored {
                Some(stored) => StorageCompletion::CreatedFromStorage {
                    pose: stored.pose,
                    local_id: self.tracking.spawn(stored.pose),
                    map_position_id: id.to_string(),
                    result: CreateResult::Success,
                },
                None => StorageCompletion::CreatedFromStorage {
                    pose: Pose::default(),
                    local_id: NO_ANCHOR,
                    map_position_id: id.to_string(),
                    result: CreateResult::Failure(format!("anchor {id} not found")),
                },
            };
            self.sinks.post(completion);
        }
        Ok(())
    }

    fn publish_anchors_to_storage(
        &self,
        local_ids: &[LocalAnchorId],
        expiration: ExpirationPolicy,
    ) -> Result<(), RequestRejected> {
        self.admit(RequestOp::Publish)?;
        for &local_id in local_ids {
            let completion = match self.tracking.pose(local_id) {
                Some(pose) => {
                    let id = mint_map_position_id();
                    self.stored
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(id.clone(), StoredAnchor { pose, expiration });
                    StorageCompletion::Published {
                        local_id,
                        map_position_id: id.to_string(),
                    }
                }
                None => StorageCompletion::PublishFailed {
                    local_id,
                    reason: "anchor is no longer tracked".to_string(),
                },
            };
            self.sinks.post(completion);
        }
        Ok(())
    }

    fn delete_stored_anchors(
        &self,
        map_position_ids: &[MapPositionId],
    ) -> Result<(), RequestRejected> {
        self.admit(RequestOp::Delete)?;
        let mut stored = self.stored.lock().unwrap_or_else(PoisonError::into_inner);
        for id in map_position_ids {
            stored.remove(id);
        }
        drop(stored);
        self.sinks.post(StorageCompletion::Deleted {
            map_position_ids: map_position_ids.iter().map(ToString::to_string).collect(),
        });
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Localization
// ─────────────────────────────────────────────────────────────────────────────

/// Localizes immediately against whatever map is requested.
#[derive(Debug)]
pub struct SimulatedLocalization {
    state: Mutex<LocalizationState>,
    events_enabled: AtomicBool,
    reject: AtomicBool,
    sink: CompletionSink,
}

impl SimulatedLocalization {
    pub fn new(sink: CompletionSink) -> Self {
        Self {
            state: Mutex::new(LocalizationState::NotLocalized),
            events_enabled: AtomicBool::new(false),
            reject: AtomicBool::new(false),
            sink,
        }
    }

    pub fn reject_requests(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Report that tracking was lost and the device must localize again.
    pub fn lose_localization(&self) {
        self.transition(LocalizationState::NotLocalized, None);
    }

    /// Report that localization was regained against `map_id` without a new
    /// request, as when the device recognizes its surroundings again.
    pub fn recover_localization(&self, map_id: &str) {
        self.transition(LocalizationState::Localized, Some(map_id.to_string()));
    }

    fn transition(&self, state: LocalizationState, map_id: Option<String>) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        if self.events_enabled.load(Ordering::SeqCst) {
            self.sink.post_localization(LocalizationEvent { state, map_id });
        }
    }
}

impl LocalizationService for SimulatedLocalization {
    fn current_state(&self) -> LocalizationState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_localization(&self, map_id: &str) -> Result<(), RequestRejected> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(RequestRejected::new("localization service unavailable"));
        }
        self.transition(LocalizationState::Localizing, None);
        self.transition(LocalizationState::Localized, Some(map_id.to_string()));
        Ok(())
    }

    fn enable_events(&self, enabled: bool) {
        self.events_enabled.store(enabled, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loader
// ─────────────────────────────────────────────────────────────────────────────

/// The simulated platform, handed to `initialize` as its loader.
#[derive(Debug, Clone)]
pub struct SimulatedPlatform {
    pub storage: Arc<SimulatedStorage>,
    pub tracking: Arc<SimulatedTracking>,
    pub localization: Arc<SimulatedLocalization>,
    /// How long the platform takes to come up.
    pub startup_delay: Duration,
    /// Leave out the storage feature, as on a device without it.
    pub without_storage: bool,
}

impl SimulatedPlatform {
    pub fn new(bus: &crate::bus::CompletionBus) -> Self {
        let tracking = Arc::new(SimulatedTracking::default());
        let storage = Arc::new(SimulatedStorage::new(
            Arc::clone(&tracking),
            bus.register_storage(),
        ));
        let localization = Arc::new(SimulatedLocalization::new(
            bus.register(crate::bus::Topic::Localization),
        ));
        Self {
            storage,
            tracking,
            localization,
            startup_delay: Duration::ZERO,
            without_storage: false,
        }
    }
}

#[async_trait]
impl SubsystemLoader for SimulatedPlatform {
    async fn load(&self) -> anchorsync_core::Result<Collaborators> {
        if !self.startup_delay.is_zero() {
            tokio::time::sleep(self.startup_delay).await;
        }
        let storage: Option<Arc<dyn AnchorStorage>> = if self.without_storage {
            None
        } else {
            Some(self.storage.clone())
        };
        Ok(Collaborators {
            storage,
            tracking: Some(self.tracking.clone()),
            localization: Some(self.localization.clone()),
        })
    }
}

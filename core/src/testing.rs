//! In-memory collaborator fakes for tests.
//!
//! Requests are recorded and never complete on their own; tests feed the
//! completions they want back into the session by hand.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::collaborators::{AnchorStorage, AnchorTracking, Collaborators, LocalizationService};
use crate::config::AnchorSyncConfig;
use crate::errors::{RequestOp, RequestRejected};
use crate::events::{CreateResult, LocalizationEvent};
use crate::session::{AnchorSession, CompletionOutcome};
use crate::types::{
    ExpirationPolicy, LocalAnchorId, LocalizationState, MapPositionId, Pose, TrackingQuality, Vec3,
};

#[derive(Debug, Clone, PartialEq)]
pub enum StorageRequest {
    Query { center: Vec3, radius_m: f32 },
    Create(Vec<MapPositionId>),
    Publish {
        local_ids: Vec<LocalAnchorId>,
        expiration: ExpirationPolicy,
    },
    Delete(Vec<MapPositionId>),
}

/// Storage fake that records accepted requests and can refuse by operation.
#[derive(Debug, Default)]
pub struct RecordingStorage {
    requests: Mutex<Vec<StorageRequest>>,
    rejecting: Mutex<HashSet<RequestOp>>,
}

impl RecordingStorage {
    pub fn requests(&self) -> Vec<StorageRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn reject(&self, op: RequestOp, reject: bool) {
        let mut rejecting = self.rejecting.lock().unwrap_or_else(PoisonError::into_inner);
        if reject {
            rejecting.insert(op);
        } else {
            rejecting.remove(&op);
        }
    }

    /// Number of accepted publish requests naming `id`.
    pub fn publish_requests_for(&self, id: LocalAnchorId) -> usize {
        self.requests()
            .iter()
            .filter(|r| matches!(r, StorageRequest::Publish { local_ids, .. } if local_ids.contains(&id)))
            .count()
    }

    /// Ids asked for by create-from-storage requests, one entry per call.
    pub fn create_calls(&self) -> Vec<Vec<MapPositionId>> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                StorageRequest::Create(ids) => Some(ids),
                _ => None,
            })
            .collect()
    }

    fn record(&self, op: RequestOp, request: StorageRequest) -> Result<(), RequestRejected> {
        if self
            .rejecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&op)
        {
            return Err(RequestRejected::new(format!("{op} refused by test storage")));
        }
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        Ok(())
    }
}

impl AnchorStorage for RecordingStorage {
    fn query_stored_anchors(&self, center: Vec3, radius_m: f32) -> Result<(), RequestRejected> {
        self.record(RequestOp::Query, StorageRequest::Query { center, radius_m })
    }

    fn create_anchors_from_storage(
        &self,
        map_position_ids: &[MapPositionId],
    ) -> Result<(), RequestRejected> {
        self.record(
            RequestOp::CreateFromStorage,
            StorageRequest::Create(map_position_ids.to_vec()),
        )
    }

    fn publish_anchors_to_storage(
        &self,
        local_ids: &[LocalAnchorId],
        expiration: ExpirationPolicy,
    ) -> Result<(), RequestRejected> {
        self.record(
            RequestOp::Publish,
            StorageRequest::Publish {
                local_ids: local_ids.to_vec(),
                expiration,
            },
        )
    }

    fn delete_stored_anchors(
        &self,
        map_position_ids: &[MapPositionId],
    ) -> Result<(), RequestRejected> {
        self.record(
            RequestOp::Delete,
            StorageRequest::Delete(map_position_ids.to_vec()),
        )
    }
}

/// Tracking fake handing out sequential ids. Quality defaults to `Tracking`.
#[derive(Debug)]
pub struct FakeTracking {
    next_id: AtomicU64,
    default_quality: Mutex<TrackingQuality>,
    quality: Mutex<HashMap<LocalAnchorId, TrackingQuality>>,
    released: Mutex<Vec<LocalAnchorId>>,
    reject_creation: AtomicBool,
}

impl Default for FakeTracking {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            default_quality: Mutex::new(TrackingQuality::Tracking),
            quality: Mutex::new(HashMap::new()),
            released: Mutex::new(Vec::new()),
            reject_creation: AtomicBool::new(false),
        }
    }
}

impl FakeTracking {
    pub fn set_quality(&self, id: LocalAnchorId, quality: TrackingQuality) {
        self.quality
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, quality);
    }

    pub fn set_default_quality(&self, quality: TrackingQuality) {
        *self
            .default_quality
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = quality;
    }

    pub fn reject_creation(&self, reject: bool) {
        self.reject_creation.store(reject, Ordering::SeqCst);
    }

    pub fn released(&self) -> Vec<LocalAnchorId> {
        self.released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AnchorTracking for FakeTracking {
    fn create_anchor(&self, _pose: Pose) -> Result<LocalAnchorId, RequestRejected> {
        if self.reject_creation.load(Ordering::SeqCst) {
            return Err(RequestRejected::new("tracking refused anchor creation"));
        }
        Ok(LocalAnchorId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn tracking_quality(&self, id: LocalAnchorId) -> TrackingQuality {
        let overrides = self.quality.lock().unwrap_or_else(PoisonError::into_inner);
        match overrides.get(&id) {
            Some(quality) => *quality,
            None => *self
                .default_quality
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn release_anchor(&self, id: LocalAnchorId) {
        self.released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
    }
}

#[derive(Debug, Default)]
pub struct FakeLocalization {
    state: Mutex<LocalizationState>,
    requested: Mutex<Vec<String>>,
    events_enabled: AtomicBool,
    reject: AtomicBool,
}

impl FakeLocalization {
    pub fn set_state(&self, state: LocalizationState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events_enabled(&self) -> bool {
        self.events_enabled.load(Ordering::SeqCst)
    }

    pub fn reject_requests(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }
}

impl LocalizationService for FakeLocalization {
    fn current_state(&self) -> LocalizationState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_localization(&self, map_id: &str) -> Result<(), RequestRejected> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(RequestRejected::new("localization unavailable"));
        }
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(map_id.to_string());
        Ok(())
    }

    fn enable_events(&self, enabled: bool) {
        self.events_enabled.store(enabled, Ordering::SeqCst);
    }
}

/// A session wired to fakes, with handles to inspect them.
pub struct Harness {
    pub session: AnchorSession,
    pub storage: Arc<RecordingStorage>,
    pub tracking: Arc<FakeTracking>,
    pub localization: Arc<FakeLocalization>,
}

pub fn harness() -> Harness {
    harness_with_config(AnchorSyncConfig::default())
}

pub fn harness_with_config(config: AnchorSyncConfig) -> Harness {
    let storage = Arc::new(RecordingStorage::default());
    let tracking = Arc::new(FakeTracking::default());
    let localization = Arc::new(FakeLocalization::default());
    let collaborators = Collaborators {
        storage: Some(storage.clone()),
        tracking: Some(tracking.clone()),
        localization: Some(localization.clone()),
    };
    let session = match AnchorSession::builder()
        .collaborators(collaborators)
        .config(config)
        .build()
    {
        Ok(session) => session,
        Err(e) => panic!("harness collaborators are complete: {e}"),
    };
    Harness {
        session,
        storage,
        tracking,
        localization,
    }
}

/// Localization event reporting success against `map_id`.
pub fn localized(map_id: &str) -> LocalizationEvent {
    LocalizationEvent {
        state: LocalizationState::Localized,
        map_id: Some(map_id.to_string()),
    }
}

/// Restore `map_position_id` as `local_id` through a full query round trip:
/// storage reports it alongside everything already published, the session
/// requests it, and the creation completes.
pub fn restore(
    session: &mut AnchorSession,
    pose: Pose,
    local_id: LocalAnchorId,
    map_position_id: &str,
) -> CompletionOutcome {
    let mut remote: Vec<String> = session
        .registry()
        .published_ids()
        .iter()
        .map(ToString::to_string)
        .collect();
    remote.push(map_position_id.to_string());
    session.on_query_complete(&remote);
    session.on_create_complete(pose, local_id, map_position_id, &CreateResult::Success)
}

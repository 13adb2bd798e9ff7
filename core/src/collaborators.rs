//! Interfaces to the three external subsystems the session orchestrates.
//!
//! Request methods are fire-and-forget: `Ok(())` only means the request was
//! accepted. Results arrive later as [`StorageCompletion`] or
//! [`LocalizationEvent`] messages delivered to the control loop.
//!
//! [`StorageCompletion`]: crate::events::StorageCompletion
//! [`LocalizationEvent`]: crate::events::LocalizationEvent

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{RequestRejected, Result, SessionError};
use crate::types::{
    ExpirationPolicy, LocalAnchorId, LocalizationState, MapPositionId, Pose, TrackingQuality, Vec3,
};

/// Remote persistent anchor storage.
pub trait AnchorStorage: Send + Sync {
    fn query_stored_anchors(
        &self,
        center: Vec3,
        radius_m: f32,
    ) -> std::result::Result<(), RequestRejected>;

    fn create_anchors_from_storage(
        &self,
        map_position_ids: &[MapPositionId],
    ) -> std::result::Result<(), RequestRejected>;

    fn publish_anchors_to_storage(
        &self,
        local_ids: &[LocalAnchorId],
        expiration: ExpirationPolicy,
    ) -> std::result::Result<(), RequestRejected>;

    fn delete_stored_anchors(
        &self,
        map_position_ids: &[MapPositionId],
    ) -> std::result::Result<(), RequestRejected>;
}

/// The device tracking subsystem.
pub trait AnchorTracking: Send + Sync {
    /// Start tracking a new anchor at `pose` and return its handle.
    fn create_anchor(&self, pose: Pose) -> std::result::Result<LocalAnchorId, RequestRejected>;

    fn tracking_quality(&self, id: LocalAnchorId) -> TrackingQuality;

    /// Stop tracking and free the underlying object.
    fn release_anchor(&self, id: LocalAnchorId);
}

/// Map localization.
pub trait LocalizationService: Send + Sync {
    fn current_state(&self) -> LocalizationState;

    fn request_localization(&self, map_id: &str) -> std::result::Result<(), RequestRejected>;

    /// Turn the localization-change event feed on or off.
    fn enable_events(&self, enabled: bool);
}

/// The set of collaborators a session needs. Any of them may be missing when
/// the platform does not provide the feature; the session refuses to build
/// in that case.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub storage: Option<Arc<dyn AnchorStorage>>,
    pub tracking: Option<Arc<dyn AnchorTracking>>,
    pub localization: Option<Arc<dyn LocalizationService>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("storage", &self.storage.is_some())
            .field("tracking", &self.tracking.is_some())
            .field("localization", &self.localization.is_some())
            .finish()
    }
}

impl Collaborators {
    /// Name of the first missing collaborator, if any.
    pub fn missing(&self) -> Option<&'static str> {
        if self.storage.is_none() {
            Some("storage")
        } else if self.tracking.is_none() {
            Some("tracking")
        } else if self.localization.is_none() {
            Some("localization")
        } else {
            None
        }
    }

    pub fn require(&self) -> Result<()> {
        match self.missing() {
            Some(name) => Err(SessionError::MissingCollaborator { name }),
            None => Ok(()),
        }
    }
}

/// Brings the platform subsystems up once and hands back the collaborators.
///
/// Hosts await this before constructing a session instead of polling for
/// readiness every frame.
#[async_trait]
pub trait SubsystemLoader: Send + Sync {
    async fn load(&self) -> Result<Collaborators>;
}

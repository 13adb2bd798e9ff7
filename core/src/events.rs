//! Inbound events (host input, storage completions, localization changes)
//! and the outbound anchor notifications.

use serde::{Deserialize, Serialize};

use crate::types::{LocalAnchorId, LocalizationState, MapPositionId, Pose, Vec3};

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// Discrete actions delivered by the host session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostInput {
    /// Place a new anchor at the controller's current pose.
    CreateAnchor { pose: Pose },
    /// Delete the most recent anchor (newest local first, else newest published).
    DeleteMostRecent,
    /// Promote every local anchor into the publish pipeline.
    PublishAnchors,
    QueryAnchors { center: Vec3, radius_m: f32 },
    RequestLocalization { map_id: String },
}

/// Result of a create-from-storage attempt, as reported by the storage service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateResult {
    Success,
    Failure(String),
}

/// Asynchronous completions from the storage collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageCompletion {
    CreatedFromStorage {
        pose: Pose,
        local_id: LocalAnchorId,
        map_position_id: String,
        result: CreateResult,
    },
    Published {
        local_id: LocalAnchorId,
        map_position_id: String,
    },
    PublishFailed {
        local_id: LocalAnchorId,
        reason: String,
    },
    QueryCompleted {
        map_position_ids: Vec<String>,
    },
    Deleted {
        map_position_ids: Vec<String>,
    },
}

impl StorageCompletion {
    pub fn channel(&self) -> CompletionChannel {
        match self {
            Self::CreatedFromStorage { .. } => CompletionChannel::CreateFromStorage,
            Self::Published { .. } | Self::PublishFailed { .. } => CompletionChannel::Publish,
            Self::QueryCompleted { .. } => CompletionChannel::Query,
            Self::Deleted { .. } => CompletionChannel::Delete,
        }
    }
}

/// The four storage completion channels a session subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionChannel {
    CreateFromStorage,
    Publish,
    Query,
    Delete,
}

impl CompletionChannel {
    pub const ALL: [CompletionChannel; 4] = [
        Self::CreateFromStorage,
        Self::Publish,
        Self::Query,
        Self::Delete,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizationEvent {
    pub state: LocalizationState,
    /// Map the device is localized against, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_id: Option<String>,
}

/// Everything the control loop processes, one at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Input(HostInput),
    Storage(StorageCompletion),
    Localization(LocalizationEvent),
    Tick,
}

impl From<HostInput> for SessionEvent {
    fn from(input: HostInput) -> Self {
        Self::Input(input)
    }
}

impl From<StorageCompletion> for SessionEvent {
    fn from(completion: StorageCompletion) -> Self {
        Self::Storage(completion)
    }
}

impl From<LocalizationEvent> for SessionEvent {
    fn from(event: LocalizationEvent) -> Self {
        Self::Localization(event)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Deleted by the user before it was published.
    DeletedLocally,
    /// The storage service confirmed a delete request.
    DeletedRemotely,
    /// A query no longer reported it for the region.
    MissingRemotely,
    /// The localization map changed.
    MapChanged,
}

/// Broadcast to the host so it can instantiate and destroy anchor visuals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnchorNotification {
    Created {
        local_id: LocalAnchorId,
        pose: Pose,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        map_position_id: Option<MapPositionId>,
    },
    PublishRequested {
        local_id: LocalAnchorId,
    },
    Published {
        local_id: LocalAnchorId,
        map_position_id: MapPositionId,
    },
    DeleteRequested {
        local_id: LocalAnchorId,
        map_position_id: MapPositionId,
    },
    Removed {
        local_id: LocalAnchorId,
        reason: RemovalReason,
    },
}

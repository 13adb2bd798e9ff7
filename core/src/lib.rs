//! Spatial anchor lifecycle and storage reconciliation.
//!
//! Tracks anchors the user creates in the physical space, publishes them to a
//! remote anchor store once the device is localized against a map, restores
//! stored anchors near the user, and keeps the local view consistent with the
//! store across creation, publication, deletion and map changes.
//!
//! The crate is platform-neutral: tracking, localization and storage are
//! reached through the traits in [`collaborators`], and their asynchronous
//! results are fed back into an [`AnchorSession`] by the host's control loop.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod collaborators;
pub mod config;
pub mod errors;
pub mod events;
pub mod gate;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use collaborators::{
    AnchorStorage, AnchorTracking, Collaborators, LocalizationService, SubsystemLoader,
};
pub use config::AnchorSyncConfig;
pub use errors::{ErrorCategory, RegistryError, RequestOp, RequestRejected, Result, SessionError};
pub use events::{
    AnchorNotification, CompletionChannel, CreateResult, HostInput, LocalizationEvent,
    RemovalReason, SessionEvent, StorageCompletion,
};
pub use gate::{GateTransition, LocalizationGate};
pub use registry::{Anchor, AnchorRecord, AnchorRegistry, LifecycleState, StateCounts, StateKind};
pub use session::{
    AnchorSession, AnchorSessionBuilder, CompletionOutcome, DeleteOutcome, PublishRequest,
    ReconcileReport, SessionSnapshot, StartReport, TickReport,
};
pub use types::{
    ExpirationPolicy, LocalAnchorId, LocalizationState, MapPositionId, Pose, Quat,
    TrackingQuality, Vec3,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

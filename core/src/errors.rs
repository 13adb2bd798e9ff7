//! Error types for the anchor core.
//!
//! Policy: request rejections and completion failures are logged and leave
//! the registry unchanged; the next tick or reconciliation pass is the only
//! retry. A missing collaborator is fatal to the subsystem.

use thiserror::Error;

use crate::types::{LocalAnchorId, MapPositionId};

/// Error category for structured logging and behavior mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A request-issuing call was refused synchronously
    RequestRejected,
    /// An asynchronous completion reported a non-success result
    CompletionFailure,
    /// A completion referenced an anchor that no longer exists
    UnmatchedCompletion,
    /// A required collaborator was not supplied at startup
    MissingCollaborator,
    /// A lifecycle transition that the current state does not permit
    InvalidTransition,
    /// `anchorsync.toml` or env misconfigured
    ConfigError,
}

impl ErrorCategory {
    /// Machine-readable code for logging
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestRejected => "REQUEST_REJECTED",
            Self::CompletionFailure => "COMPLETION_FAILURE",
            Self::UnmatchedCompletion => "UNMATCHED_COMPLETION",
            Self::MissingCollaborator => "MISSING_COLLABORATOR",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::ConfigError => "CONFIG_ERROR",
        }
    }

    /// Whether the session keeps operating after this error.
    pub fn recoverable(self) -> bool {
        !matches!(self, Self::MissingCollaborator | Self::ConfigError)
    }
}

/// Which collaborator request a rejection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOp {
    Query,
    CreateFromStorage,
    Publish,
    Delete,
    Localize,
    TrackAnchor,
}

impl std::fmt::Display for RequestOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Query => "query",
            Self::CreateFromStorage => "create-from-storage",
            Self::Publish => "publish",
            Self::Delete => "delete",
            Self::Localize => "localize",
            Self::TrackAnchor => "track-anchor",
        };
        f.write_str(name)
    }
}

/// Synchronous refusal returned by a collaborator request method.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct RequestRejected {
    pub reason: String,
}

impl RequestRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Registry contract violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("anchor {0} is already registered")]
    Duplicate(LocalAnchorId),

    #[error("map position id {0} is already held by anchor {1}")]
    DuplicateMapPositionId(MapPositionId, LocalAnchorId),

    #[error("anchor {0} not found")]
    NotFound(LocalAnchorId),

    #[error("anchor {id} is {actual}, expected {expected}")]
    WrongState {
        id: LocalAnchorId,
        expected: &'static str,
        actual: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{op} request rejected: {source}")]
    RequestRejected {
        op: RequestOp,
        #[source]
        source: RequestRejected,
    },

    #[error("missing collaborator: {name}")]
    MissingCollaborator { name: &'static str },

    #[error("anchor {0} has a publish request in flight and cannot be deleted")]
    PublishInFlight(LocalAnchorId),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::RequestRejected { .. } => ErrorCategory::RequestRejected,
            Self::MissingCollaborator { .. } => ErrorCategory::MissingCollaborator,
            Self::PublishInFlight(_) | Self::Registry(_) => ErrorCategory::InvalidTransition,
            Self::Config { .. } => ErrorCategory::ConfigError,
        }
    }

    pub fn rejected(op: RequestOp, source: RequestRejected) -> Self {
        Self::RequestRejected { op, source }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

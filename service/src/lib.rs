//! `anchorsync-service` runs an anchor session on a single control loop.
//!
//! Wires the platform collaborators to an [`anchorsync_core::AnchorSession`]:
//! subsystems are brought up once through [`init::initialize`], their
//! completions travel over the [`bus::CompletionBus`], and
//! [`runtime::ControlLoop`] applies everything on one task. The [`sim`]
//! module provides an in-process platform for the binary and for tests.

pub mod bus;
pub mod init;
pub mod runtime;
pub mod sim;

pub use bus::{CompletionBus, CompletionSink, EventSender, StorageSinks, Subscriptions, Topic};
pub use init::{InitError, initialize, start_session};
pub use runtime::{ControlHandle, ControlLoop};

//! Single-threaded control loop.
//!
//! Owns the [`AnchorSession`] and feeds it one event at a time: host input,
//! storage completions, localization events and periodic ticks. Nothing else
//! touches the session, so no two handlers ever run concurrently.

use std::time::Duration;

use anchorsync_core::{
    AnchorNotification, AnchorSession, HostInput, SessionEvent, SessionSnapshot, Vec3,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::bus::{CompletionBus, EventSender};

/// Host-side handle to a running control loop.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    events: EventSender,
    shutdown_tx: watch::Sender<bool>,
}

impl ControlHandle {
    pub fn input(&self, input: HostInput) {
        self.events.input(input);
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

pub struct ControlLoop {
    session: AnchorSession,
    bus: CompletionBus,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown_rx: watch::Receiver<bool>,
    tick_interval: Duration,
    query_center: Vec3,
}

impl ControlLoop {
    pub fn new(
        session: AnchorSession,
        bus: CompletionBus,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> (Self, ControlHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = ControlHandle {
            events: bus.event_sender(),
            shutdown_tx,
        };
        let tick_interval = session.config().tick_interval();
        let control = Self {
            session,
            bus,
            events,
            shutdown_rx,
            tick_interval,
            query_center: Vec3::ZERO,
        };
        (control, handle)
    }

    /// Center of the region queried when the loop starts.
    pub fn with_query_center(mut self, center: Vec3) -> Self {
        self.query_center = center;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnchorNotification> {
        self.session.subscribe()
    }

    /// Run until shutdown is requested. Returns the final session snapshot,
    /// taken after subscriptions were closed.
    pub async fn run(mut self) -> SessionSnapshot {
        let report = self.session.start(self.query_center);
        tracing::info!(
            localization_requested = report.localization_requested,
            query_requested = report.query_requested,
            "control loop started"
        );

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(event) = self.events.recv() => self.dispatch(event),
                _ = ticker.tick() => self.dispatch(SessionEvent::Tick),
            }
        }

        self.teardown()
    }

    fn dispatch(&mut self, event: SessionEvent) {
        if !matches!(event, SessionEvent::Tick) {
            tracing::trace!(?event, "dispatching");
        }
        if let Err(e) = self.session.handle_event(event) {
            let category = e.category();
            if category.recoverable() {
                tracing::warn!(category = category.as_str(), "event failed: {e}");
            } else {
                tracing::error!(category = category.as_str(), "event failed: {e}");
            }
        }
    }

    fn teardown(mut self) -> SessionSnapshot {
        self.bus.close();
        self.session.shutdown();

        // Drain what was already queued; late completions are not applied.
        let mut dropped = 0usize;
        while self.events.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(dropped, "discarded queued events at teardown");
        }

        let snapshot = self.session.snapshot();
        tracing::info!(
            published = snapshot.counts.published,
            pending = snapshot.counts.pending_publish,
            local = snapshot.counts.local,
            "control loop stopped"
        );
        snapshot
    }
}

//! `AnchorSession` orchestrates the anchor lifecycle against tracking,
//! localization and remote storage.
//!
//! The session is driven from a single control thread. Host input, storage
//! completions, localization events and ticks are fed in one at a time; every
//! registry mutation happens inside one of those calls. Requests to the
//! storage service are fire-and-forget, and their completions are applied to
//! whatever state the anchor is in when they arrive.
//!
//! Lifecycle:
//!
//! ```text
//!  create_local ──► Local ──request_publish──► PendingPublish{submitted: false}
//!                                                 │ tick (localized + Tracking)
//!                                                 ▼
//!                                     PendingPublish{submitted: true}
//!                                                 │ on_publish_complete
//!                                                 ▼
//!  on_create_complete ────────────────────────► Published ──on_delete_complete──► (removed)
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::collaborators::{
    AnchorStorage, AnchorTracking, Collaborators, LocalizationService,
};
use crate::config::AnchorSyncConfig;
use crate::errors::{ErrorCategory, RegistryError, RequestOp, Result, SessionError};
use crate::events::{
    AnchorNotification, CreateResult, HostInput, LocalizationEvent, RemovalReason, SessionEvent,
    StorageCompletion,
};
use crate::gate::{GateTransition, LocalizationGate};
use crate::reconcile::{self, CreateRequests};
use crate::registry::{Anchor, AnchorRecord, AnchorRegistry, LifecycleState, StateCounts, StateKind};
use crate::types::{
    LocalAnchorId, LocalizationState, MapPositionId, Pose, TrackingQuality, Vec3,
};

/// What `request_publish` did with an anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishRequest {
    /// Moved into the publish pipeline.
    Promoted,
    /// Not localized yet; retried on every tick.
    Queued,
}

/// What `delete` did with an anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Never reached storage; removed immediately.
    Removed,
    /// A delete request is in flight; the anchor stays published until the
    /// completion arrives.
    DeleteRequested,
}

/// How a completion was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Applied,
    /// Unmatched or duplicate; nothing changed.
    Ignored,
    /// The completion reported a failure; nothing changed.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Queued publish requests promoted now that localization succeeded.
    pub promoted: usize,
    /// Publish requests accepted by storage.
    pub submitted: usize,
    /// Publish requests refused by storage; retried next tick.
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Ids asked of storage (across all create requests).
    pub requested: usize,
    /// Number of create-from-storage calls issued.
    pub create_calls: usize,
    pub removed: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub localization: LocalizationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_id: Option<String>,
    pub counts: StateCounts,
    pub queued_publishes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartReport {
    pub localization_requested: bool,
    pub query_requested: bool,
}

/// Builder enforcing that all three collaborators are present.
#[derive(Default)]
pub struct AnchorSessionBuilder {
    collaborators: Collaborators,
    config: AnchorSyncConfig,
}

impl AnchorSessionBuilder {
    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn AnchorStorage>) -> Self {
        self.collaborators.storage = Some(storage);
        self
    }

    pub fn tracking(mut self, tracking: Arc<dyn AnchorTracking>) -> Self {
        self.collaborators.tracking = Some(tracking);
        self
    }

    pub fn localization(mut self, localization: Arc<dyn LocalizationService>) -> Self {
        self.collaborators.localization = Some(localization);
        self
    }

    pub fn config(mut self, config: AnchorSyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Fails with `MissingCollaborator` if any collaborator is absent; the
    /// subsystem does not run in a degraded mode.
    pub fn build(self) -> Result<AnchorSession> {
        if let Err(e) = self.collaborators.require() {
            tracing::error!(
                category = e.category().as_str(),
                "anchor session disabled: {e}"
            );
            return Err(e);
        }
        let Collaborators {
            storage: Some(storage),
            tracking: Some(tracking),
            localization: Some(localization),
        } = self.collaborators
        else {
            return Err(SessionError::MissingCollaborator { name: "unknown" });
        };

        let (notify_tx, _) = broadcast::channel(self.config.notification_capacity);
        let gate = LocalizationGate::new(localization.current_state());
        Ok(AnchorSession {
            registry: AnchorRegistry::new(),
            gate,
            publish_queue: Vec::new(),
            requested_creates: HashSet::new(),
            config: self.config,
            storage,
            tracking,
            localization,
            notify_tx,
        })
    }
}

pub struct AnchorSession {
    registry: AnchorRegistry,
    gate: LocalizationGate,
    /// Local anchors whose publish was requested before localization.
    publish_queue: Vec<LocalAnchorId>,
    /// Map position ids with a create-from-storage request in flight on the
    /// current map.
    requested_creates: HashSet<MapPositionId>,
    config: AnchorSyncConfig,
    storage: Arc<dyn AnchorStorage>,
    tracking: Arc<dyn AnchorTracking>,
    localization: Arc<dyn LocalizationService>,
    notify_tx: broadcast::Sender<AnchorNotification>,
}

impl AnchorSession {
    pub fn builder() -> AnchorSessionBuilder {
        AnchorSessionBuilder::default()
    }

    pub fn registry(&self) -> &AnchorRegistry {
        &self.registry
    }

    pub fn gate(&self) -> &LocalizationGate {
        &self.gate
    }

    pub fn config(&self) -> &AnchorSyncConfig {
        &self.config
    }

    pub fn is_localized(&self) -> bool {
        self.gate.is_localized()
    }

    /// Subscribe to anchor notifications (visual instantiation/teardown).
    pub fn subscribe(&self) -> broadcast::Receiver<AnchorNotification> {
        self.notify_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            localization: self.gate.state(),
            map_id: self.gate.map_id().map(str::to_string),
            counts: self.registry.counts(),
            queued_publishes: self.publish_queue.len(),
        }
    }

    fn notify(&self, notification: AnchorNotification) {
        // Ignore error if no subscribers
        let _ = self.notify_tx.send(notification);
    }

    /// Release the tracked object behind a removed anchor and announce it.
    fn discard(&self, record: &AnchorRecord, reason: RemovalReason) {
        let local_id = record.local_id();
        self.tracking.release_anchor(local_id);
        self.notify(AnchorNotification::Removed { local_id, reason });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Session start / stop
    // ─────────────────────────────────────────────────────────────────────────

    /// Turn on localization events, localize against the configured map and
    /// optionally query the stored anchors around `query_center`. Failures are
    /// logged; the session keeps running and the host may retry.
    pub fn start(&mut self, query_center: Vec3) -> StartReport {
        self.localization.enable_events(true);

        let map_id = self.config.map_id.clone();
        let localization_requested = self.request_localization(&map_id).is_ok();

        let query_requested = if self.config.query_on_start {
            let radius = self.config.query_radius_m;
            match self.query_anchors(query_center, radius) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(category = e.category().as_str(), "initial query failed: {e}");
                    false
                }
            }
        } else {
            false
        };

        StartReport {
            localization_requested,
            query_requested,
        }
    }

    pub fn shutdown(&mut self) {
        self.localization.enable_events(false);
        tracing::info!(anchors = self.registry.len(), "anchor session shut down");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Publish pipeline
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new anchor at `pose`. It starts out Local.
    pub fn create_local(&mut self, pose: Pose) -> Result<LocalAnchorId> {
        let local_id = self
            .tracking
            .create_anchor(pose)
            .map_err(|e| SessionError::rejected(RequestOp::TrackAnchor, e))?;
        self.registry
            .insert(Anchor::new(local_id, pose), LifecycleState::Local)?;

        tracing::info!(%local_id, "created local anchor");
        self.notify(AnchorNotification::Created {
            local_id,
            pose,
            map_position_id: None,
        });
        Ok(local_id)
    }

    /// Local → PendingPublish while localized; otherwise queue the request
    /// and retry it on every tick.
    pub fn request_publish(&mut self, local_id: LocalAnchorId) -> Result<PublishRequest> {
        let kind = self
            .registry
            .get(local_id)
            .map(AnchorRecord::kind)
            .ok_or(RegistryError::NotFound(local_id))?;
        if kind != StateKind::Local {
            return Err(RegistryError::WrongState {
                id: local_id,
                expected: StateKind::Local.as_str(),
                actual: kind.as_str(),
            }
            .into());
        }

        if !self.gate.is_localized() {
            if !self.publish_queue.contains(&local_id) {
                self.publish_queue.push(local_id);
            }
            tracing::debug!(%local_id, "not localized, publish request queued");
            return Ok(PublishRequest::Queued);
        }

        self.promote(local_id)?;
        Ok(PublishRequest::Promoted)
    }

    fn promote(&mut self, local_id: LocalAnchorId) -> Result<()> {
        self.registry.transition(
            local_id,
            StateKind::Local,
            LifecycleState::PendingPublish { submitted: false },
        )?;
        self.publish_queue.retain(|id| *id != local_id);
        self.notify(AnchorNotification::PublishRequested { local_id });
        Ok(())
    }

    /// Promote every Local anchor into the publish pipeline. Returns how many
    /// were promoted immediately (the rest are queued).
    pub fn publish_anchors(&mut self) -> usize {
        let local: Vec<LocalAnchorId> = self
            .registry
            .all_in_state(StateKind::Local)
            .into_iter()
            .map(AnchorRecord::local_id)
            .collect();

        let mut promoted = 0;
        for local_id in local {
            match self.request_publish(local_id) {
                Ok(PublishRequest::Promoted) => promoted += 1,
                Ok(PublishRequest::Queued) => {}
                Err(e) => tracing::warn!(%local_id, "publish request failed: {e}"),
            }
        }
        promoted
    }

    /// Periodic step: promote queued requests once localized, then submit
    /// every unsubmitted pending anchor whose tracking is good. Safe to run
    /// every frame; the `submitted` flag keeps at most one publish request in
    /// flight per anchor.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        if !self.gate.is_localized() {
            return report;
        }

        for local_id in std::mem::take(&mut self.publish_queue) {
            let still_local = self
                .registry
                .get(local_id)
                .is_some_and(|r| r.kind() == StateKind::Local);
            if still_local && self.promote(local_id).is_ok() {
                report.promoted += 1;
            }
        }

        let candidates: Vec<LocalAnchorId> = self
            .registry
            .all_in_state(StateKind::PendingPublish)
            .into_iter()
            .filter(|r| r.state == LifecycleState::PendingPublish { submitted: false })
            .map(AnchorRecord::local_id)
            .collect();

        let expiration = self.config.expiration();
        for local_id in candidates {
            let quality = self.tracking.tracking_quality(local_id);
            if let Some(anchor) = self.registry.get_mut_anchor(local_id) {
                anchor.tracking_quality = Some(quality);
            }
            if quality != TrackingQuality::Tracking {
                continue;
            }

            match self
                .storage
                .publish_anchors_to_storage(&[local_id], expiration)
            {
                Ok(()) => {
                    if let Err(e) = self.registry.transition(
                        local_id,
                        StateKind::PendingPublish,
                        LifecycleState::PendingPublish { submitted: true },
                    ) {
                        tracing::warn!(%local_id, "could not mark anchor submitted: {e}");
                        continue;
                    }
                    tracing::info!(%local_id, "publish request submitted");
                    report.submitted += 1;
                }
                Err(e) => {
                    let pose = self.registry.get(local_id).map(|r| r.anchor.pose);
                    tracing::warn!(
                        category = ErrorCategory::RequestRejected.as_str(),
                        %local_id,
                        ?pose,
                        "failed to publish anchor to storage: {e}"
                    );
                    report.rejected += 1;
                }
            }
        }
        report
    }

    /// PendingPublish(submitted) → Published.
    pub fn on_publish_complete(
        &mut self,
        local_id: LocalAnchorId,
        map_position_id: &str,
    ) -> CompletionOutcome {
        let Some(map_position_id) = MapPositionId::new(map_position_id) else {
            return self.on_publish_failed(local_id, "storage returned an empty map position id");
        };

        let in_flight = self
            .registry
            .get(local_id)
            .is_some_and(|r| r.state == LifecycleState::PendingPublish { submitted: true });
        if !in_flight {
            tracing::debug!(
                category = ErrorCategory::UnmatchedCompletion.as_str(),
                %local_id,
                %map_position_id,
                "ignoring publish completion"
            );
            return CompletionOutcome::Ignored;
        }

        match self.registry.transition(
            local_id,
            StateKind::PendingPublish,
            LifecycleState::Published {
                map_position_id: map_position_id.clone(),
            },
        ) {
            Ok(()) => {
                tracing::info!(%local_id, %map_position_id, "anchor published");
                self.notify(AnchorNotification::Published {
                    local_id,
                    map_position_id,
                });
                CompletionOutcome::Applied
            }
            Err(e) => self.on_publish_failed(local_id, &e.to_string()),
        }
    }

    /// A publish completion reported failure. With `retry_failed_publish` the
    /// anchor is re-armed so the next tick submits it again; otherwise it
    /// stays parked until the user deletes it.
    pub fn on_publish_failed(&mut self, local_id: LocalAnchorId, reason: &str) -> CompletionOutcome {
        let in_flight = self
            .registry
            .get(local_id)
            .is_some_and(|r| r.state == LifecycleState::PendingPublish { submitted: true });
        if !in_flight {
            tracing::debug!(
                category = ErrorCategory::UnmatchedCompletion.as_str(),
                %local_id,
                "ignoring publish failure"
            );
            return CompletionOutcome::Ignored;
        }

        tracing::error!(
            category = ErrorCategory::CompletionFailure.as_str(),
            %local_id,
            retry = self.config.retry_failed_publish,
            "publish failed: {reason}"
        );
        if self.config.retry_failed_publish
            && let Err(e) = self.registry.transition(
                local_id,
                StateKind::PendingPublish,
                LifecycleState::PendingPublish { submitted: false },
            )
        {
            tracing::warn!(%local_id, "could not re-arm anchor: {e}");
        }
        CompletionOutcome::Failed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Deletion
    // ─────────────────────────────────────────────────────────────────────────

    /// Local or unsubmitted anchors are removed immediately. Published anchors
    /// get a delete request and stay published until it completes. An anchor
    /// with a publish in flight cannot be deleted.
    pub fn delete(&mut self, local_id: LocalAnchorId) -> Result<DeleteOutcome> {
        let state = self
            .registry
            .get(local_id)
            .map(|r| r.state.clone())
            .ok_or(RegistryError::NotFound(local_id))?;

        match state {
            LifecycleState::Local | LifecycleState::PendingPublish { submitted: false } => {
                if let Some(record) = self.registry.remove(local_id) {
                    self.publish_queue.retain(|id| *id != local_id);
                    self.discard(&record, RemovalReason::DeletedLocally);
                }
                tracing::info!(%local_id, "deleted unpublished anchor");
                Ok(DeleteOutcome::Removed)
            }
            LifecycleState::PendingPublish { submitted: true } => {
                Err(SessionError::PublishInFlight(local_id))
            }
            LifecycleState::Published { map_position_id } => {
                self.storage
                    .delete_stored_anchors(std::slice::from_ref(&map_position_id))
                    .map_err(|e| SessionError::rejected(RequestOp::Delete, e))?;
                tracing::info!(%local_id, %map_position_id, "delete requested");
                self.notify(AnchorNotification::DeleteRequested {
                    local_id,
                    map_position_id,
                });
                Ok(DeleteOutcome::DeleteRequested)
            }
        }
    }

    /// The "delete most recent anchor" action: the newest Local anchor if any,
    /// otherwise the most recently published one. At most one anchor per call.
    pub fn delete_most_recent(&mut self) -> Result<Option<(LocalAnchorId, DeleteOutcome)>> {
        let target = self
            .registry
            .newest_in_state(StateKind::Local)
            .or_else(|| self.registry.newest_in_state(StateKind::Published))
            .map(AnchorRecord::local_id);

        match target {
            Some(local_id) => {
                let outcome = self.delete(local_id)?;
                Ok(Some((local_id, outcome)))
            }
            None => {
                tracing::debug!("nothing to delete");
                Ok(None)
            }
        }
    }

    /// Remove every published anchor whose id the storage service confirmed
    /// deleted. Unknown ids are ignored, so repeated delivery is harmless.
    pub fn on_delete_complete<S: AsRef<str>>(&mut self, map_position_ids: &[S]) -> usize {
        let mut removed = 0;
        for raw in map_position_ids {
            let matched = MapPositionId::new(raw.as_ref())
                .and_then(|id| self.registry.find_by_map_position_id(&id))
                .map(AnchorRecord::local_id);
            let Some(local_id) = matched else {
                tracing::debug!(
                    category = ErrorCategory::UnmatchedCompletion.as_str(),
                    map_position_id = raw.as_ref(),
                    "ignoring delete completion"
                );
                continue;
            };
            if let Some(record) = self.registry.remove(local_id) {
                tracing::info!(%local_id, map_position_id = raw.as_ref(), "anchor deleted from storage");
                self.discard(&record, RemovalReason::DeletedRemotely);
                removed += 1;
            }
        }
        removed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Query reconciliation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn query_anchors(&mut self, center: Vec3, radius_m: f32) -> Result<()> {
        self.storage
            .query_stored_anchors(center, radius_m)
            .map_err(|e| {
                tracing::error!(
                    category = ErrorCategory::RequestRejected.as_str(),
                    "could not query stored anchors: {e}"
                );
                SessionError::rejected(RequestOp::Query, e)
            })
    }

    /// Reconcile the published set against the ids storage reports for the
    /// queried region.
    pub fn on_query_complete<S: AsRef<str>>(&mut self, map_position_ids: &[S]) -> ReconcileReport {
        let remote: Vec<MapPositionId> = map_position_ids
            .iter()
            .filter_map(|raw| MapPositionId::new(raw.as_ref()))
            .collect();
        if remote.len() != map_position_ids.len() {
            tracing::debug!(
                skipped = map_position_ids.len() - remote.len(),
                "query reported empty map position ids"
            );
        }

        let plan = reconcile::plan(&self.registry.published_ids(), &remote);
        let mut report = ReconcileReport::default();

        let requests: Vec<Vec<MapPositionId>> = match plan.create {
            CreateRequests::None => Vec::new(),
            CreateRequests::Batch(ids) => vec![ids],
            CreateRequests::Individual(ids) => ids.into_iter().map(|id| vec![id]).collect(),
        };
        for ids in requests {
            report.create_calls += 1;
            match self.storage.create_anchors_from_storage(&ids) {
                Ok(()) => {
                    report.requested += ids.len();
                    self.requested_creates.extend(ids);
                }
                Err(e) => {
                    tracing::error!(
                        category = ErrorCategory::RequestRejected.as_str(),
                        count = ids.len(),
                        "couldn't create spatial anchors from storage: {e}"
                    );
                    report.rejected += 1;
                }
            }
        }

        for map_position_id in &plan.remove {
            let Some(local_id) = self
                .registry
                .find_by_map_position_id(map_position_id)
                .map(AnchorRecord::local_id)
            else {
                continue;
            };
            if let Some(record) = self.registry.remove(local_id) {
                tracing::info!(%local_id, %map_position_id, "anchor no longer stored remotely");
                self.discard(&record, RemovalReason::MissingRemotely);
                report.removed += 1;
            }
        }

        report
    }

    /// A create-from-storage completion. Success inserts the anchor straight
    /// into Published. Completions for ids not requested on the current map
    /// (stale after a map change, or repeats) are ignored and their tracked
    /// anchor is released.
    pub fn on_create_complete(
        &mut self,
        pose: Pose,
        local_id: LocalAnchorId,
        map_position_id: &str,
        result: &CreateResult,
    ) -> CompletionOutcome {
        let requested = MapPositionId::new(map_position_id)
            .is_some_and(|id| self.requested_creates.remove(&id));

        if let CreateResult::Failure(reason) = result {
            tracing::error!(
                category = ErrorCategory::CompletionFailure.as_str(),
                map_position_id,
                "could not create anchor from storage: {reason}"
            );
            return CompletionOutcome::Failed;
        }

        let Some(map_position_id) = MapPositionId::new(map_position_id) else {
            tracing::error!(
                category = ErrorCategory::CompletionFailure.as_str(),
                %local_id,
                "create-from-storage completed without a map position id"
            );
            if !self.registry.contains(local_id) {
                self.tracking.release_anchor(local_id);
            }
            return CompletionOutcome::Failed;
        };

        if !requested {
            tracing::debug!(
                category = ErrorCategory::UnmatchedCompletion.as_str(),
                %local_id,
                %map_position_id,
                "ignoring create-from-storage completion not requested on this map"
            );
            if !self.registry.contains(local_id) {
                self.tracking.release_anchor(local_id);
            }
            return CompletionOutcome::Ignored;
        }

        if let Some(existing) = self.registry.find_by_map_position_id(&map_position_id) {
            let holder = existing.local_id();
            tracing::debug!(
                %map_position_id,
                %holder,
                "anchor already published, ignoring duplicate creation"
            );
            if holder != local_id && !self.registry.contains(local_id) {
                self.tracking.release_anchor(local_id);
            }
            return CompletionOutcome::Ignored;
        }

        let anchor = Anchor::new(local_id, pose);
        if let Err(e) = self.registry.insert(
            anchor,
            LifecycleState::Published {
                map_position_id: map_position_id.clone(),
            },
        ) {
            tracing::warn!(%local_id, "create-from-storage completion not applied: {e}");
            return CompletionOutcome::Ignored;
        }

        tracing::info!(%local_id, %map_position_id, "anchor restored from storage");
        self.notify(AnchorNotification::Created {
            local_id,
            pose,
            map_position_id: Some(map_position_id),
        });
        CompletionOutcome::Applied
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Localization / map change
    // ─────────────────────────────────────────────────────────────────────────

    /// Hard reset: every anchor is discarded, queued publishes included.
    /// Anchor identities only mean something within one localization map.
    pub fn on_map_change(&mut self) -> usize {
        self.publish_queue.clear();
        self.requested_creates.clear();
        let discarded = self.registry.drain();
        for record in &discarded {
            self.discard(record, RemovalReason::MapChanged);
        }
        if !discarded.is_empty() {
            tracing::info!(discarded = discarded.len(), "map changed, anchor state reset");
        }
        discarded.len()
    }

    /// Tear down all map-dependent state, then ask the localization service to
    /// localize against `map_id`.
    pub fn request_localization(&mut self, map_id: &str) -> Result<()> {
        self.on_map_change();
        self.gate.reset();
        self.localization
            .request_localization(map_id)
            .map_err(|e| {
                tracing::error!(
                    category = ErrorCategory::RequestRejected.as_str(),
                    map_id,
                    "failed to request localization: {e}"
                );
                SessionError::rejected(RequestOp::Localize, e)
            })?;
        tracing::info!(map_id, "localization requested");
        Ok(())
    }

    pub fn on_localization_event(&mut self, event: &LocalizationEvent) -> GateTransition {
        let transition = self.gate.apply(event);
        match &transition {
            GateTransition::MapSwitched { previous, current } => {
                tracing::info!(previous = %previous, current = %current, "localization map switched");
                self.on_map_change();
            }
            GateTransition::StateChanged { from, to } => {
                tracing::info!(?from, ?to, "localization state changed");
            }
            GateTransition::Unchanged => {}
        }
        transition
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────────

    pub fn handle_input(&mut self, input: HostInput) -> Result<()> {
        match input {
            HostInput::CreateAnchor { pose } => {
                self.create_local(pose)?;
                if self.config.auto_publish_on_create {
                    self.publish_anchors();
                }
                Ok(())
            }
            HostInput::DeleteMostRecent => self.delete_most_recent().map(|_| ()),
            HostInput::PublishAnchors => {
                self.publish_anchors();
                Ok(())
            }
            HostInput::QueryAnchors { center, radius_m } => self.query_anchors(center, radius_m),
            HostInput::RequestLocalization { map_id } => self.request_localization(&map_id),
        }
    }

    pub fn handle_completion(&mut self, completion: StorageCompletion) -> CompletionOutcome {
        match completion {
            StorageCompletion::CreatedFromStorage {
                pose,
                local_id,
                map_position_id,
                result,
            } => self.on_create_complete(pose, local_id, &map_position_id, &result),
            StorageCompletion::Published {
                local_id,
                map_position_id,
            } => self.on_publish_complete(local_id, &map_position_id),
            StorageCompletion::PublishFailed { local_id, reason } => {
                self.on_publish_failed(local_id, &reason)
            }
            StorageCompletion::QueryCompleted { map_position_ids } => {
                self.on_query_complete(&map_position_ids);
                CompletionOutcome::Applied
            }
            StorageCompletion::Deleted { map_position_ids } => {
                if self.on_delete_complete(&map_position_ids) > 0 {
                    CompletionOutcome::Applied
                } else {
                    CompletionOutcome::Ignored
                }
            }
        }
    }

    /// Process one event from the control loop. Errors are returned for the
    /// caller to log; none of them leave the registry half-updated.
    pub fn handle_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Input(input) => self.handle_input(input),
            SessionEvent::Storage(completion) => {
                self.handle_completion(completion);
                Ok(())
            }
            SessionEvent::Localization(event) => {
                self.on_localization_event(&event);
                Ok(())
            }
            SessionEvent::Tick => {
                self.tick();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FakeLocalization, FakeTracking, RecordingStorage, StorageRequest, harness, localized, restore,
    };
    use pretty_assertions::assert_eq;

    fn pose(x: f32) -> Pose {
        Pose::at(Vec3::new(x, 0.0, 0.0))
    }

    #[test]
    fn build_requires_every_collaborator() {
        let result = AnchorSession::builder()
            .storage(Arc::new(RecordingStorage::default()))
            .tracking(Arc::new(FakeTracking::default()))
            .build();
        match result {
            Err(SessionError::MissingCollaborator { name }) => assert_eq!(name, "localization"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("session built without localization"),
        }

        let result = AnchorSession::builder()
            .tracking(Arc::new(FakeTracking::default()))
            .localization(Arc::new(FakeLocalization::default()))
            .build();
        assert!(matches!(
            result,
            Err(SessionError::MissingCollaborator { name: "storage" })
        ));
    }

    #[test]
    fn create_local_enters_local() {
        let h = harness();
        let mut session = h.session;
        let id = session.create_local(pose(1.0)).unwrap();
        let record = session.registry().get(id).unwrap();
        assert_eq!(record.state, LifecycleState::Local);
        assert_eq!(record.anchor.pose, pose(1.0));
    }

    #[test]
    fn create_local_surfaces_tracking_rejection() {
        let h = harness();
        let mut session = h.session;
        h.tracking.reject_creation(true);
        let err = session.create_local(pose(1.0)).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::RequestRejected);
        assert!(session.registry().is_empty());
    }

    #[test]
    fn request_publish_rejects_non_local() {
        let h = harness();
        let mut session = h.session;
        session.on_localization_event(&localized("m"));
        let id = session.create_local(pose(1.0)).unwrap();
        assert_eq!(session.request_publish(id).unwrap(), PublishRequest::Promoted);
        assert!(session.request_publish(id).is_err());
        assert!(session.request_publish(LocalAnchorId(999)).is_err());
    }

    #[test]
    fn tick_waits_for_good_tracking() {
        let h = harness();
        let mut session = h.session;
        session.on_localization_event(&localized("m"));
        let id = session.create_local(pose(1.0)).unwrap();
        h.tracking.set_quality(id, TrackingQuality::Limited);
        session.request_publish(id).unwrap();

        assert_eq!(session.tick().submitted, 0);
        assert!(h.storage.requests().is_empty());
        assert_eq!(
            session.registry().get(id).unwrap().anchor.tracking_quality,
            Some(TrackingQuality::Limited)
        );

        h.tracking.set_quality(id, TrackingQuality::Tracking);
        assert_eq!(session.tick().submitted, 1);
        assert_eq!(
            session.registry().get(id).unwrap().state,
            LifecycleState::PendingPublish { submitted: true }
        );
    }

    #[test]
    fn rejected_publish_is_retried_next_tick() {
        let h = harness();
        let mut session = h.session;
        session.on_localization_event(&localized("m"));
        let id = session.create_local(pose(1.0)).unwrap();
        session.request_publish(id).unwrap();

        h.storage.reject(RequestOp::Publish, true);
        let report = session.tick();
        assert_eq!(report.rejected, 1);
        assert_eq!(
            session.registry().get(id).unwrap().state,
            LifecycleState::PendingPublish { submitted: false }
        );

        h.storage.reject(RequestOp::Publish, false);
        assert_eq!(session.tick().submitted, 1);
        assert_eq!(h.storage.publish_requests_for(id), 1);
    }

    #[test]
    fn publish_complete_requires_submitted_anchor() {
        let h = harness();
        let mut session = h.session;
        session.on_localization_event(&localized("m"));
        let id = session.create_local(pose(1.0)).unwrap();

        // Still Local: completion is unmatched.
        assert_eq!(session.on_publish_complete(id, "m-1"), CompletionOutcome::Ignored);
        session.request_publish(id).unwrap();
        assert_eq!(session.on_publish_complete(id, "m-1"), CompletionOutcome::Ignored);

        session.tick();
        assert_eq!(session.on_publish_complete(id, "m-1"), CompletionOutcome::Applied);
        let record = session.registry().get(id).unwrap();
        assert_eq!(
            record.state.map_position_id().map(MapPositionId::as_str),
            Some("m-1")
        );

        // Deleted anchors ignore late completions.
        assert_eq!(
            session.on_publish_complete(LocalAnchorId(4242), "m-2"),
            CompletionOutcome::Ignored
        );
    }

    #[test]
    fn failed_publish_completion_rearms_when_configured() {
        let h = harness();
        let mut session = h.session;
        session.on_localization_event(&localized("m"));
        let id = session.create_local(pose(1.0)).unwrap();
        session.request_publish(id).unwrap();
        session.tick();

        assert_eq!(session.on_publish_failed(id, "quota"), CompletionOutcome::Failed);
        assert_eq!(
            session.registry().get(id).unwrap().state,
            LifecycleState::PendingPublish { submitted: false }
        );
        assert_eq!(session.tick().submitted, 1);
        assert_eq!(h.storage.publish_requests_for(id), 2);
    }

    #[test]
    fn failed_publish_completion_parks_without_retry() {
        let mut config = AnchorSyncConfig::default();
        config.retry_failed_publish = false;
        let h = crate::testing::harness_with_config(config);
        let mut session = h.session;
        session.on_localization_event(&localized("m"));
        let id = session.create_local(pose(1.0)).unwrap();
        session.request_publish(id).unwrap();
        session.tick();

        session.on_publish_failed(id, "quota");
        assert_eq!(
            session.registry().get(id).unwrap().state,
            LifecycleState::PendingPublish { submitted: true }
        );
        assert_eq!(session.tick().submitted, 0);
    }

    #[test]
    fn empty_publish_id_counts_as_failure() {
        let h = harness();
        let mut session = h.session;
        session.on_localization_event(&localized("m"));
        let id = session.create_local(pose(1.0)).unwrap();
        session.request_publish(id).unwrap();
        session.tick();
        assert_eq!(session.on_publish_complete(id, ""), CompletionOutcome::Failed);
        assert_eq!(session.registry().counts().published, 0);
    }

    #[test]
    fn publish_id_already_held_counts_as_failure() {
        let h = harness();
        let mut session = h.session;
        session.on_localization_event(&localized("m"));
        restore(&mut session, pose(0.0), LocalAnchorId(50), "p-1");
        let id = session.create_local(pose(1.0)).unwrap();
        session.request_publish(id).unwrap();
        session.tick();

        assert_eq!(session.on_publish_complete(id, "p-1"), CompletionOutcome::Failed);
        assert_eq!(
            session.registry().get(id).unwrap().state,
            LifecycleState::PendingPublish { submitted: false }
        );
        assert_eq!(session.registry().counts().published, 1);
        assert_eq!(session.tick().submitted, 1);
    }

    #[test]
    fn limited_tracking_holds_every_publish() {
        let h = harness();
        let mut session = h.session;
        h.tracking.set_default_quality(TrackingQuality::Limited);
        session.on_localization_event(&localized("m"));
        let first = session.create_local(pose(1.0)).unwrap();
        let second = session.create_local(pose(2.0)).unwrap();
        session.request_publish(first).unwrap();
        session.request_publish(second).unwrap();
        assert_eq!(session.tick().submitted, 0);

        h.tracking.set_quality(second, TrackingQuality::Tracking);
        assert_eq!(session.tick().submitted, 1);
        assert_eq!(h.storage.publish_requests_for(first), 0);
        assert_eq!(h.storage.publish_requests_for(second), 1);
    }

    #[test]
    fn build_adopts_current_localization_state() {
        let localization = Arc::new(FakeLocalization::default());
        localization.set_state(LocalizationState::Localized);
        let mut session = AnchorSession::builder()
            .storage(Arc::new(RecordingStorage::default()))
            .tracking(Arc::new(FakeTracking::default()))
            .localization(localization)
            .build()
            .unwrap();

        assert!(session.is_localized());
        let id = session.create_local(pose(1.0)).unwrap();
        assert_eq!(session.request_publish(id).unwrap(), PublishRequest::Promoted);
    }

    #[test]
    fn unrequested_create_completion_is_released() {
        let h = harness();
        let mut session = h.session;
        assert_eq!(
            session.on_create_complete(pose(0.0), LocalAnchorId(7), "p-9", &CreateResult::Success),
            CompletionOutcome::Ignored
        );
        assert!(session.registry().is_empty());
        assert_eq!(h.tracking.released(), vec![LocalAnchorId(7)]);
    }

    #[test]
    fn delete_in_flight_publish_is_refused() {
        let h = harness();
        let mut session = h.session;
        session.on_localization_event(&localized("m"));
        let id = session.create_local(pose(1.0)).unwrap();
        session.request_publish(id).unwrap();
        session.tick();
        assert!(matches!(
            session.delete(id),
            Err(SessionError::PublishInFlight(_))
        ));
        assert!(session.registry().contains(id));
    }

    #[test]
    fn delete_unsubmitted_pending_is_local_only() {
        let h = harness();
        let mut session = h.session;
        session.on_localization_event(&localized("m"));
        let id = session.create_local(pose(1.0)).unwrap();
        h.tracking.set_quality(id, TrackingQuality::NotTracking);
        session.request_publish(id).unwrap();

        assert_eq!(session.delete(id).unwrap(), DeleteOutcome::Removed);
        assert!(!session.registry().contains(id));
        assert!(h.storage.requests().is_empty());
        assert_eq!(h.tracking.released(), vec![id]);
    }

    #[test]
    fn delete_published_waits_for_completion() {
        let h = harness();
        let mut session = h.session;
        restore(&mut session, pose(0.0), LocalAnchorId(50), "p-1");
        h.storage.clear();

        assert_eq!(
            session.delete(LocalAnchorId(50)).unwrap(),
            DeleteOutcome::DeleteRequested
        );
        assert!(session.registry().contains(LocalAnchorId(50)));
        assert_eq!(
            h.storage.requests(),
            vec![StorageRequest::Delete(vec![MapPositionId::new("p-1").unwrap()])]
        );

        assert_eq!(session.on_delete_complete(&["p-1"]), 1);
        assert!(session.registry().is_empty());
    }

    #[test]
    fn rejected_delete_keeps_anchor() {
        let h = harness();
        let mut session = h.session;
        restore(&mut session, pose(0.0), LocalAnchorId(50), "p-1");
        h.storage.reject(RequestOp::Delete, true);
        let err = session.delete(LocalAnchorId(50)).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::RequestRejected);
        assert_eq!(session.registry().counts().published, 1);
    }

    #[test]
    fn delete_most_recent_prefers_local_then_newest_published() {
        let h = harness();
        let mut session = h.session;
        restore(&mut session, pose(0.0), LocalAnchorId(50), "p-1");
        restore(&mut session, pose(0.0), LocalAnchorId(51), "p-2");
        let local = session.create_local(pose(1.0)).unwrap();

        assert_eq!(
            session.delete_most_recent().unwrap(),
            Some((local, DeleteOutcome::Removed))
        );
        assert_eq!(
            session.delete_most_recent().unwrap(),
            Some((LocalAnchorId(51), DeleteOutcome::DeleteRequested))
        );
    }

    #[test]
    fn delete_most_recent_on_empty_registry() {
        let h = harness();
        let mut session = h.session;
        assert_eq!(session.delete_most_recent().unwrap(), None);
    }

    #[test]
    fn create_complete_failure_leaves_registry_unchanged() {
        let h = harness();
        let mut session = h.session;
        let outcome = session.on_create_complete(
            pose(0.0),
            LocalAnchorId(7),
            "p-1",
            &CreateResult::Failure("XR_ERROR".to_string()),
        );
        assert_eq!(outcome, CompletionOutcome::Failed);
        assert!(session.registry().is_empty());

        // Next reconciliation asks again because nothing is published.
        session.on_query_complete(&["p-1"]);
        assert_eq!(
            h.storage.requests(),
            vec![StorageRequest::Create(vec![MapPositionId::new("p-1").unwrap()])]
        );
    }

    #[test]
    fn duplicate_create_complete_is_ignored_and_released() {
        let h = harness();
        let mut session = h.session;
        assert_eq!(
            restore(&mut session, pose(0.0), LocalAnchorId(7), "p-1"),
            CompletionOutcome::Applied
        );
        assert_eq!(
            session.on_create_complete(pose(0.0), LocalAnchorId(8), "p-1", &CreateResult::Success),
            CompletionOutcome::Ignored
        );
        assert_eq!(session.registry().len(), 1);
        assert_eq!(h.tracking.released(), vec![LocalAnchorId(8)]);
    }

    #[test]
    fn request_localization_resets_before_requesting() {
        let h = harness();
        let mut session = h.session;
        session.on_localization_event(&localized("m"));
        session.create_local(pose(1.0)).unwrap();
        restore(&mut session, pose(0.0), LocalAnchorId(50), "p-1");

        session.request_localization("other-map").unwrap();
        assert!(session.registry().is_empty());
        assert!(!session.is_localized());
        assert_eq!(h.localization.requested(), vec!["other-map".to_string()]);
    }

    #[test]
    fn create_requested_before_localization_request_is_dropped() {
        let h = harness();
        let mut session = h.session;
        session.on_localization_event(&localized("map-a"));
        session.on_query_complete(&["X"]);

        session.request_localization("map-b").unwrap();
        session.on_localization_event(&localized("map-b"));
        assert_eq!(
            session.on_create_complete(pose(0.0), LocalAnchorId(77), "X", &CreateResult::Success),
            CompletionOutcome::Ignored
        );
        assert_eq!(session.registry().counts().published, 0);
        assert_eq!(h.tracking.released(), vec![LocalAnchorId(77)]);
    }

    #[test]
    fn rejected_localization_request_is_reported() {
        let h = harness();
        let mut session = h.session;
        h.localization.reject_requests(true);
        let err = session.request_localization("m").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::RequestRejected);
    }

    #[test]
    fn map_switch_event_discards_everything() {
        let h = harness();
        let mut session = h.session;
        session.on_localization_event(&localized("map-a"));
        let id = session.create_local(pose(1.0)).unwrap();
        session.request_publish(id).unwrap();
        restore(&mut session, pose(0.0), LocalAnchorId(50), "p-1");

        let transition = session.on_localization_event(&localized("map-b"));
        assert!(matches!(transition, GateTransition::MapSwitched { .. }));
        assert!(session.registry().is_empty());
    }

    #[test]
    fn start_localizes_and_queries() {
        let h = harness();
        let mut session = h.session;
        let report = session.start(Vec3::ZERO);
        assert_eq!(
            report,
            StartReport {
                localization_requested: true,
                query_requested: true,
            }
        );
        assert!(h.localization.events_enabled());
        assert_eq!(
            h.localization.requested(),
            vec![AnchorSyncConfig::default().map_id]
        );
        assert_eq!(
            h.storage.requests(),
            vec![StorageRequest::Query {
                center: Vec3::ZERO,
                radius_m: 10.0,
            }]
        );

        session.shutdown();
        assert!(!h.localization.events_enabled());
    }

    #[test]
    fn create_input_auto_publishes() {
        let h = harness();
        let mut session = h.session;
        session.on_localization_event(&localized("m"));
        session
            .handle_input(HostInput::CreateAnchor { pose: pose(2.0) })
            .unwrap();
        assert_eq!(session.registry().counts().pending_publish, 1);
        assert_eq!(session.registry().counts().local, 0);
    }

    #[test]
    fn notifications_follow_lifecycle() {
        let h = harness();
        let mut session = h.session;
        let mut rx = session.subscribe();
        session.on_localization_event(&localized("m"));
        let id = session.create_local(pose(1.0)).unwrap();
        session.request_publish(id).unwrap();
        session.tick();
        session.on_publish_complete(id, "m-1");

        let mut seen = Vec::new();
        while let Ok(n) = rx.try_recv() {
            seen.push(n);
        }
        assert_eq!(
            seen,
            vec![
                AnchorNotification::Created {
                    local_id: id,
                    pose: pose(1.0),
                    map_position_id: None,
                },
                AnchorNotification::PublishRequested { local_id: id },
                AnchorNotification::Published {
                    local_id: id,
                    map_position_id: MapPositionId::new("m-1").unwrap(),
                },
            ]
        );
    }

    #[test]
    fn snapshot_reports_queue_and_counts() {
        let h = harness();
        let mut session = h.session;
        let id = session.create_local(pose(1.0)).unwrap();
        session.request_publish(id).unwrap();
        let snap = session.snapshot();
        assert_eq!(snap.queued_publishes, 1);
        assert_eq!(snap.counts.local, 1);
        assert_eq!(snap.localization, LocalizationState::NotLocalized);
    }
}

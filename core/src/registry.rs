//! Anchor registry: the single owner of anchor lifecycle state.
//!
//! Every anchor lives in exactly one lifecycle collection. The collection is
//! encoded in [`LifecycleState`], and the map position id only exists inside
//! the `Published` variant, so "map position id iff published" cannot be
//! violated by construction. The registry additionally keeps a reverse index
//! from map position id to local id, which must stay unique.

use std::collections::HashMap;

use serde::Serialize;

use crate::errors::RegistryError;
use crate::types::{LocalAnchorId, MapPositionId, Pose, TrackingQuality};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    /// Created by the session, not yet in the publish pipeline.
    Local,
    /// Publish requested. `submitted` is set once the storage service has
    /// accepted a publish request and cleared only if that request fails.
    PendingPublish { submitted: bool },
    /// Durably stored by the storage service.
    Published { map_position_id: MapPositionId },
}

impl LifecycleState {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Local => StateKind::Local,
            Self::PendingPublish { .. } => StateKind::PendingPublish,
            Self::Published { .. } => StateKind::Published,
        }
    }

    pub fn map_position_id(&self) -> Option<&MapPositionId> {
        match self {
            Self::Published { map_position_id } => Some(map_position_id),
            _ => None,
        }
    }
}

/// The lifecycle collection an anchor belongs to, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Local,
    PendingPublish,
    Published,
}

impl StateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::PendingPublish => "pending_publish",
            Self::Published => "published",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Anchor {
    pub local_id: LocalAnchorId,
    pub pose: Pose,
    /// Last quality reported by the tracking subsystem, if sampled.
    pub tracking_quality: Option<TrackingQuality>,
}

impl Anchor {
    pub fn new(local_id: LocalAnchorId, pose: Pose) -> Self {
        Self {
            local_id,
            pose,
            tracking_quality: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnchorRecord {
    pub anchor: Anchor,
    pub state: LifecycleState,
    /// Monotonic position within the current collection; refreshed whenever
    /// the anchor enters a new collection.
    seq: u64,
}

impl AnchorRecord {
    pub fn local_id(&self) -> LocalAnchorId {
        self.anchor.local_id
    }

    pub fn kind(&self) -> StateKind {
        self.state.kind()
    }
}

/// Per-collection sizes at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub local: usize,
    pub pending_publish: usize,
    pub submitted: usize,
    pub published: usize,
}

#[derive(Debug, Default)]
pub struct AnchorRegistry {
    records: HashMap<LocalAnchorId, AnchorRecord>,
    by_map_position_id: HashMap<MapPositionId, LocalAnchorId>,
    next_seq: u64,
}

impl AnchorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn insert(&mut self, anchor: Anchor, state: LifecycleState) -> Result<(), RegistryError> {
        let id = anchor.local_id;
        if self.records.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        if let Some(map_id) = state.map_position_id() {
            if let Some(holder) = self.by_map_position_id.get(map_id) {
                return Err(RegistryError::DuplicateMapPositionId(
                    map_id.clone(),
                    *holder,
                ));
            }
            self.by_map_position_id.insert(map_id.clone(), id);
        }
        let seq = self.bump_seq();
        self.records.insert(
            id,
            AnchorRecord {
                anchor,
                state,
                seq,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, id: LocalAnchorId) -> Option<AnchorRecord> {
        let record = self.records.remove(&id)?;
        if let Some(map_id) = record.state.map_position_id() {
            self.by_map_position_id.remove(map_id);
        }
        Some(record)
    }

    /// Move `id` from `from` into `to`. Fails without side effects when the
    /// anchor is missing, is not currently in `from`, or `to` would duplicate
    /// another anchor's map position id.
    pub fn transition(
        &mut self,
        id: LocalAnchorId,
        from: StateKind,
        to: LifecycleState,
    ) -> Result<(), RegistryError> {
        let current = self
            .records
            .get(&id)
            .map(AnchorRecord::kind)
            .ok_or(RegistryError::NotFound(id))?;
        if current != from {
            return Err(RegistryError::WrongState {
                id,
                expected: from.as_str(),
                actual: current.as_str(),
            });
        }
        if let Some(map_id) = to.map_position_id()
            && let Some(holder) = self.by_map_position_id.get(map_id)
            && *holder != id
        {
            return Err(RegistryError::DuplicateMapPositionId(
                map_id.clone(),
                *holder,
            ));
        }

        let entering_new_collection = current != to.kind();
        let seq = if entering_new_collection {
            Some(self.bump_seq())
        } else {
            None
        };
        let Some(record) = self.records.get_mut(&id) else {
            return Err(RegistryError::NotFound(id));
        };
        if let Some(old) = record.state.map_position_id() {
            self.by_map_position_id.remove(old);
        }
        if let Some(new) = to.map_position_id() {
            self.by_map_position_id.insert(new.clone(), id);
        }
        record.state = to;
        if let Some(seq) = seq {
            record.seq = seq;
        }
        Ok(())
    }

    pub fn get(&self, id: LocalAnchorId) -> Option<&AnchorRecord> {
        self.records.get(&id)
    }

    pub fn get_mut_anchor(&mut self, id: LocalAnchorId) -> Option<&mut Anchor> {
        self.records.get_mut(&id).map(|r| &mut r.anchor)
    }

    pub fn contains(&self, id: LocalAnchorId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn find_by_map_position_id(&self, map_id: &MapPositionId) -> Option<&AnchorRecord> {
        self.by_map_position_id
            .get(map_id)
            .and_then(|id| self.records.get(id))
    }

    /// Anchors in `kind`, oldest entry into that collection first.
    pub fn all_in_state(&self, kind: StateKind) -> Vec<&AnchorRecord> {
        let mut matching: Vec<&AnchorRecord> =
            self.records.values().filter(|r| r.kind() == kind).collect();
        matching.sort_by_key(|r| r.seq);
        matching
    }

    /// The anchor that most recently entered `kind`.
    pub fn newest_in_state(&self, kind: StateKind) -> Option<&AnchorRecord> {
        self.records
            .values()
            .filter(|r| r.kind() == kind)
            .max_by_key(|r| r.seq)
    }

    /// Map position ids of every published anchor.
    pub fn published_ids(&self) -> Vec<MapPositionId> {
        self.all_in_state(StateKind::Published)
            .into_iter()
            .filter_map(|r| r.state.map_position_id().cloned())
            .collect()
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for record in self.records.values() {
            match &record.state {
                LifecycleState::Local => counts.local += 1,
                LifecycleState::PendingPublish { submitted } => {
                    counts.pending_publish += 1;
                    if *submitted {
                        counts.submitted += 1;
                    }
                }
                LifecycleState::Published { .. } => counts.published += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove every anchor, returning them in insertion order.
    pub fn drain(&mut self) -> Vec<AnchorRecord> {
        self.by_map_position_id.clear();
        let mut all: Vec<AnchorRecord> = self.records.drain().map(|(_, r)| r).collect();
        all.sort_by_key(|r| r.seq);
        all
    }
}

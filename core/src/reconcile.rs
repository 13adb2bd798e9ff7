//! Query reconciliation planning.
//!
//! Compares the ids the session currently holds as published against the ids
//! the storage service reports for a region. Planning is pure; the session
//! applies the resulting plan afterwards so no collection is mutated while it
//! is being walked.

use std::collections::HashSet;

use crate::types::MapPositionId;

/// How missing anchors should be requested from storage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CreateRequests {
    #[default]
    None,
    /// Nothing is published yet: request every remote id in one call.
    Batch(Vec<MapPositionId>),
    /// One request per id not matched locally.
    Individual(Vec<MapPositionId>),
}

impl CreateRequests {
    pub fn ids(&self) -> &[MapPositionId] {
        match self {
            Self::None => &[],
            Self::Batch(ids) | Self::Individual(ids) => ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReconcilePlan {
    pub create: CreateRequests,
    /// Published ids no longer present remotely.
    pub remove: Vec<MapPositionId>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.create == CreateRequests::None && self.remove.is_empty()
    }
}

/// Plan a reconciliation pass. Remote ids may arrive in any order and with
/// repeats; the plan lists each id at most once, in first-seen order.
pub fn plan(published: &[MapPositionId], remote: &[MapPositionId]) -> ReconcilePlan {
    let mut seen = HashSet::new();
    let remote: Vec<MapPositionId> = remote
        .iter()
        .filter(|id| seen.insert(*id))
        .cloned()
        .collect();

    if published.is_empty() {
        let create = if remote.is_empty() {
            CreateRequests::None
        } else {
            CreateRequests::Batch(remote)
        };
        return ReconcilePlan {
            create,
            remove: Vec::new(),
        };
    }

    let local: HashSet<&MapPositionId> = published.iter().collect();
    let missing: Vec<MapPositionId> = remote
        .iter()
        .filter(|id| !local.contains(id))
        .cloned()
        .collect();
    let remove = published
        .iter()
        .filter(|id| !seen.contains(id))
        .cloned()
        .collect();

    ReconcilePlan {
        create: if missing.is_empty() {
            CreateRequests::None
        } else {
            CreateRequests::Individual(missing)
        },
        remove,
    }
}

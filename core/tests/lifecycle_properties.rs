#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Lifecycle properties exercised through the public session API.
//!
//! Every test drives an `AnchorSession` wired to the in-memory fakes and feeds
//! completions back by hand, the way the control loop would deliver them.

use anchorsync_core::testing::{StorageRequest, harness, localized, restore};
use anchorsync_core::{
    AnchorNotification, AnchorSession, CompletionOutcome, CreateResult, LifecycleState, LocalAnchorId,
    LocalizationEvent, LocalizationState, MapPositionId, Pose, RemovalReason, StateKind,
    StorageCompletion, Vec3,
};
use pretty_assertions::assert_eq;

fn pose(x: f32) -> Pose {
    Pose::at(Vec3::new(x, 1.5, -2.0))
}

fn mid(raw: &str) -> MapPositionId {
    MapPositionId::new(raw).expect("non-empty id")
}

/// Every anchor sits in exactly one collection, and holds a map position id
/// exactly when it is published.
fn assert_partition(session: &AnchorSession) {
    let registry = session.registry();
    let local = registry.all_in_state(StateKind::Local);
    let pending = registry.all_in_state(StateKind::PendingPublish);
    let published = registry.all_in_state(StateKind::Published);
    assert_eq!(local.len() + pending.len() + published.len(), registry.len());

    for record in local.iter().chain(pending.iter()) {
        assert!(record.state.map_position_id().is_none());
    }
    for record in &published {
        let id = record.state.map_position_id().expect("published has id");
        assert!(!id.as_str().is_empty());
    }
}

/// Create `n` anchors and drive them all the way to Published.
fn publish_n(session: &mut AnchorSession, prefix: &str, n: usize) -> Vec<LocalAnchorId> {
    let ids: Vec<LocalAnchorId> = (0..n)
        .map(|i| session.create_local(pose(i as f32)).unwrap())
        .collect();
    session.publish_anchors();
    session.tick();
    for (i, id) in ids.iter().enumerate() {
        session.on_publish_complete(*id, &format!("{prefix}-{i}"));
    }
    ids
}

#[test]
fn partition_holds_across_a_full_lifecycle() {
    let h = harness();
    let mut session = h.session;
    assert_partition(&session);

    let a = session.create_local(pose(0.0)).unwrap();
    let b = session.create_local(pose(1.0)).unwrap();
    assert_partition(&session);

    session.request_publish(a).unwrap();
    assert_partition(&session);

    session.on_localization_event(&localized("map"));
    session.tick();
    assert_partition(&session);

    session.on_publish_complete(a, "remote-a");
    restore(&mut session, pose(5.0), LocalAnchorId(100), "remote-c");
    assert_partition(&session);

    session.delete(b).unwrap();
    session.on_query_complete(&["remote-a"]);
    assert_partition(&session);

    let counts = session.registry().counts();
    assert_eq!(counts.published, 1);
    assert_eq!(counts.local, 0);
}

#[test]
fn at_most_one_publish_request_in_flight_per_anchor() {
    let h = harness();
    let mut session = h.session;
    session.on_localization_event(&localized("map"));
    let id = session.create_local(pose(0.0)).unwrap();
    session.request_publish(id).unwrap();

    for _ in 0..10 {
        session.tick();
    }
    assert_eq!(h.storage.publish_requests_for(id), 1);
    assert_eq!(
        session.registry().get(id).unwrap().state,
        LifecycleState::PendingPublish { submitted: true }
    );
}

#[test]
fn repeated_delete_completion_is_idempotent() {
    let h = harness();
    let mut session = h.session;
    restore(&mut session, pose(0.0), LocalAnchorId(10), "keep");
    restore(&mut session, pose(1.0), LocalAnchorId(11), "gone");

    assert_eq!(session.on_delete_complete(&["gone"]), 1);
    let once = session.snapshot();
    assert_eq!(session.on_delete_complete(&["gone"]), 0);
    let twice = session.snapshot();

    assert_eq!(once.counts, twice.counts);
    assert!(session.registry().contains(LocalAnchorId(10)));
    assert!(!session.registry().contains(LocalAnchorId(11)));
}

#[test]
fn published_anchor_survives_reconciliation_without_recreation() {
    let h = harness();
    let mut session = h.session;
    session.on_localization_event(&localized("map"));
    let ids = publish_n(&mut session, "pub", 1);
    h.storage.clear();

    let report = session.on_query_complete(&["pub-0"]);
    assert_eq!(report.create_calls, 0);
    assert_eq!(report.removed, 0);
    assert!(h.storage.create_calls().is_empty());
    assert_eq!(
        session.registry().get(ids[0]).unwrap().state,
        LifecycleState::Published {
            map_position_id: mid("pub-0"),
        }
    );
}

#[test]
fn reconciliation_removes_anchors_missing_remotely() {
    let h = harness();
    let mut session = h.session;
    let mut rx = session.subscribe();
    restore(&mut session, pose(0.0), LocalAnchorId(1), "A");
    restore(&mut session, pose(1.0), LocalAnchorId(2), "B");

    let report = session.on_query_complete(&["A"]);
    assert_eq!(report.removed, 1);
    assert!(session.registry().find_by_map_position_id(&mid("A")).is_some());
    assert!(session.registry().find_by_map_position_id(&mid("B")).is_none());
    assert_eq!(h.tracking.released(), vec![LocalAnchorId(2)]);

    let removed: Vec<AnchorNotification> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter(|n| matches!(n, AnchorNotification::Removed { .. }))
        .collect();
    assert_eq!(
        removed,
        vec![AnchorNotification::Removed {
            local_id: LocalAnchorId(2),
            reason: RemovalReason::MissingRemotely,
        }]
    );
}

#[test]
fn cold_start_issues_a_single_batch() {
    let h = harness();
    let mut session = h.session;
    let report = session.on_query_complete(&["X", "Y", "Z"]);

    assert_eq!(report.create_calls, 1);
    assert_eq!(report.requested, 3);
    assert_eq!(
        h.storage.create_calls(),
        vec![vec![mid("X"), mid("Y"), mid("Z")]]
    );
}

#[test]
fn warm_reconciliation_requests_each_missing_id() {
    let h = harness();
    let mut session = h.session;
    restore(&mut session, pose(0.0), LocalAnchorId(1), "A");
    h.storage.clear();

    session.on_query_complete(&["C", "A", "B", "C"]);
    assert_eq!(
        h.storage.create_calls(),
        vec![vec![mid("C")], vec![mid("B")]]
    );
}

#[test]
fn in_flight_creation_completes_once() {
    let h = harness();
    let mut session = h.session;
    session.on_query_complete(&["X"]);
    // Storage reported X again before the first creation completed.
    session.on_query_complete(&["X"]);

    session.handle_completion(StorageCompletion::CreatedFromStorage {
        pose: pose(0.0),
        local_id: LocalAnchorId(20),
        map_position_id: "X".to_string(),
        result: CreateResult::Success,
    });
    session.handle_completion(StorageCompletion::CreatedFromStorage {
        pose: pose(0.0),
        local_id: LocalAnchorId(21),
        map_position_id: "X".to_string(),
        result: CreateResult::Success,
    });

    assert_eq!(session.registry().counts().published, 1);
    assert!(session.registry().contains(LocalAnchorId(20)));
    assert_eq!(h.tracking.released(), vec![LocalAnchorId(21)]);
}

#[test]
fn publish_is_gated_on_localization() {
    let h = harness();
    let mut session = h.session;
    let id = session.create_local(pose(0.0)).unwrap();

    session.request_publish(id).unwrap();
    session.tick();
    session.tick();
    assert_eq!(session.registry().get(id).unwrap().state, LifecycleState::Local);
    assert!(h.storage.requests().is_empty());

    session.on_localization_event(&LocalizationEvent {
        state: LocalizationState::Localizing,
        map_id: None,
    });
    session.tick();
    assert_eq!(session.registry().get(id).unwrap().state, LifecycleState::Local);

    session.on_localization_event(&localized("map"));
    let report = session.tick();
    assert_eq!(report.promoted, 1);
    assert_eq!(report.submitted, 1);
    assert_eq!(
        session.registry().get(id).unwrap().state,
        LifecycleState::PendingPublish { submitted: true }
    );
}

#[test]
fn queued_publish_dropped_when_anchor_deleted() {
    let h = harness();
    let mut session = h.session;
    let id = session.create_local(pose(0.0)).unwrap();
    session.request_publish(id).unwrap();
    session.delete(id).unwrap();

    session.on_localization_event(&localized("map"));
    let report = session.tick();
    assert_eq!(report.promoted, 0);
    assert!(session.registry().is_empty());
}

#[test]
fn map_change_empties_pending_and_published() {
    let h = harness();
    let mut session = h.session;
    session.on_localization_event(&localized("map"));
    publish_n(&mut session, "p", 2);
    let pending = session.create_local(pose(9.0)).unwrap();
    session.request_publish(pending).unwrap();
    session.create_local(pose(10.0)).unwrap();

    let discarded = session.on_map_change();
    assert_eq!(discarded, 4);
    let counts = session.registry().counts();
    assert_eq!(counts.published, 0);
    assert_eq!(counts.pending_publish, 0);
    assert_eq!(h.tracking.released().len(), 4);
}

#[test]
fn late_publish_completion_after_map_change_is_ignored() {
    let h = harness();
    let mut session = h.session;
    session.on_localization_event(&localized("map"));
    let id = session.create_local(pose(0.0)).unwrap();
    session.request_publish(id).unwrap();
    session.tick();

    session.on_map_change();
    session.on_publish_complete(id, "late");
    assert!(session.registry().is_empty());
}

#[test]
fn late_create_completion_after_map_change_is_ignored() {
    let h = harness();
    let mut session = h.session;
    let mut rx = session.subscribe();
    session.on_localization_event(&localized("map-a"));
    session.on_query_complete(&["X"]);
    assert_eq!(h.storage.create_calls(), vec![vec![mid("X")]]);

    session.on_localization_event(&localized("map-b"));
    let outcome = session.handle_completion(StorageCompletion::CreatedFromStorage {
        pose: pose(0.0),
        local_id: LocalAnchorId(30),
        map_position_id: "X".to_string(),
        result: CreateResult::Success,
    });

    assert_eq!(outcome, CompletionOutcome::Ignored);
    assert!(session.registry().is_empty());
    assert!(session.registry().find_by_map_position_id(&mid("X")).is_none());
    assert_eq!(h.tracking.released(), vec![LocalAnchorId(30)]);
    let created = std::iter::from_fn(|| rx.try_recv().ok())
        .filter(|n| matches!(n, AnchorNotification::Created { .. }))
        .count();
    assert_eq!(created, 0);

    // Once the new map reports the id, it is requested and restored again.
    assert_eq!(
        restore(&mut session, pose(0.0), LocalAnchorId(31), "X"),
        CompletionOutcome::Applied
    );
}

#[test]
fn delete_action_takes_newest_local_first() {
    let h = harness();
    let mut session = h.session;
    let l1 = session.create_local(pose(0.0)).unwrap();
    let l2 = session.create_local(pose(1.0)).unwrap();

    let (deleted, _) = session.delete_most_recent().unwrap().unwrap();
    assert_eq!(deleted, l2);
    assert!(session.registry().contains(l1));
    assert!(!session.registry().contains(l2));
}

#[test]
fn delete_action_falls_back_to_last_published() {
    let h = harness();
    let mut session = h.session;
    session.on_localization_event(&localized("map"));
    let ids = publish_n(&mut session, "p", 3);

    let (deleted, _) = session.delete_most_recent().unwrap().unwrap();
    assert_eq!(deleted, ids[2]);
    assert_eq!(
        h.storage.requests().last(),
        Some(&StorageRequest::Delete(vec![mid("p-2")]))
    );
    // Still published until storage confirms.
    assert_eq!(session.registry().counts().published, 3);
}

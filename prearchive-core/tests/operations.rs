//! Operation handler behaviour: the status mutex, lifecycle chaining, and
//! the dispatch runtime.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use prearchive_core::Result;
use prearchive_core::error::ArchiveError;
use prearchive_core::events::{InProcEventBus, OperationEventPayload};
use prearchive_core::ops::{
    ArchiveOperation, DeleteOperation, HandlerRegistry, MoveOperation, OperationExecutor,
    OperationHandler, OperationKind, OperationRequest, Outcome, RebuildOperation,
    SeparateOperation,
};
use prearchive_core::routing::ImportNote;
use prearchive_core::store::{MemorySessionStore, SessionStore};
use prearchive_model::{
    AutoArchivePolicy, SessionKey, SessionRecord, SessionStatus,
};

use prearchive_core::config::ProjectSettings;
use support::{DenyAllPermissions, FailingRouting, harness, seed_session};

const PROJECT: &str = "neuro01";

fn request(kind: OperationKind, key: &SessionKey) -> OperationRequest {
    OperationRequest::new(kind, key.clone(), "ingest-svc")
}

async fn status_of(store: &MemorySessionStore, key: &SessionKey) -> Option<SessionStatus> {
    store.get_status(key).await.expect("status")
}

/// Store wrapper yielding at every call so `tokio::join!` interleaves two
/// handler executions the way separate workers would.
struct YieldingStore {
    inner: Arc<MemorySessionStore>,
}

#[async_trait]
impl SessionStore for YieldingStore {
    async fn compare_and_set_status(
        &self,
        key: &SessionKey,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.compare_and_set_status(key, expected, next).await
    }

    async fn get_status(&self, key: &SessionKey) -> Result<Option<SessionStatus>> {
        tokio::task::yield_now().await;
        self.inner.get_status(key).await
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<SessionRecord>> {
        tokio::task::yield_now().await;
        self.inner.get(key).await
    }

    async fn upsert(&self, record: SessionRecord) -> Result<()> {
        tokio::task::yield_now().await;
        self.inner.upsert(record).await
    }

    async fn set_status(&self, key: &SessionKey, status: SessionStatus) -> Result<()> {
        tokio::task::yield_now().await;
        self.inner.set_status(key, status).await
    }

    async fn delete_row(&self, key: &SessionKey) -> Result<()> {
        tokio::task::yield_now().await;
        self.inner.delete_row(key).await
    }

    async fn list(&self, project: Option<&str>) -> Result<Vec<SessionRecord>> {
        tokio::task::yield_now().await;
        self.inner.list(project).await
    }
}

#[tokio::test]
async fn concurrent_rebuilds_serialize_on_the_status_row() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(root.path(), ProjectSettings::default());
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_cas");
    seed_session(
        &h,
        &key,
        SessionStatus::Receiving,
        &[("1", "MR", vec![("f.dcm", "U1")])],
    )
    .await;

    let mut ctx = h.ctx.clone();
    ctx.store = Arc::new(YieldingStore {
        inner: h.store.clone(),
    });

    let handler = RebuildOperation;
    let req_a = request(OperationKind::Rebuild, &key);
    let req_b = request(OperationKind::Rebuild, &key);
    let (a, b) = tokio::join!(
        handler.execute(&ctx, &req_a),
        handler.execute(&ctx, &req_b),
    );
    let outcomes = [a.expect("rebuild a"), b.expect("rebuild b")];

    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, Outcome::Skipped { .. }))
        .count();
    assert_eq!(skipped, 1, "exactly one request loses the CAS and no-ops");
    assert_eq!(status_of(&h.store, &key).await, Some(SessionStatus::Ready));
}

#[tokio::test]
async fn rebuild_while_building_is_a_quiet_no_op() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(root.path(), ProjectSettings::default());
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_busy");
    let record = seed_session(
        &h,
        &key,
        SessionStatus::Building,
        &[("1", "MR", vec![("f.dcm", "U1")])],
    )
    .await;

    let outcome = RebuildOperation
        .execute(&h.ctx, &request(OperationKind::Rebuild, &key))
        .await
        .expect("rebuild");

    assert!(matches!(outcome, Outcome::Skipped { .. }));
    assert_eq!(status_of(&h.store, &key).await, Some(SessionStatus::Building));
    assert!(
        !record.session_dir.join("session.json").exists(),
        "losing handler must not touch session storage"
    );
}

#[tokio::test]
async fn rebuild_chains_auto_archive_only_for_receiving_sessions_with_policy() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(root.path(), ProjectSettings::default());

    // Policy set: exactly one archive follow-up.
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_auto");
    let mut record = seed_session(
        &h,
        &key,
        SessionStatus::Receiving,
        &[("1", "MR", vec![("f.dcm", "U1")])],
    )
    .await;
    record.autoarchive = AutoArchivePolicy::ArchiveOverwrite;
    h.ctx.store.upsert(record).await.expect("upsert");

    RebuildOperation
        .execute(&h.ctx, &request(OperationKind::Rebuild, &key))
        .await
        .expect("rebuild");

    let follow_ups = h.sink.requests();
    assert_eq!(follow_ups.len(), 1);
    assert_eq!(follow_ups[0].kind, OperationKind::Archive);
    assert_eq!(follow_ups[0].key, key);
    assert!(follow_ups[0].params.overwrite_files, "overwrite policy flows through");

    // No policy: zero follow-ups.
    let key_none = SessionKey::new(Some(PROJECT), "20260801_100000", "sess_plain");
    seed_session(
        &h,
        &key_none,
        SessionStatus::Receiving,
        &[("1", "MR", vec![("g.dcm", "U2")])],
    )
    .await;
    RebuildOperation
        .execute(&h.ctx, &request(OperationKind::Rebuild, &key_none))
        .await
        .expect("rebuild");
    assert_eq!(h.sink.requests().len(), 1, "no new archive request enqueued");
    assert_eq!(
        status_of(&h.store, &key_none).await,
        Some(SessionStatus::Ready)
    );
}

#[tokio::test]
async fn rebuild_clears_the_row_when_the_directory_vanished() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(root.path(), ProjectSettings::default());
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_gone");
    let record = seed_session(&h, &key, SessionStatus::Receiving, &[]).await;
    std::fs::remove_dir_all(&record.session_dir).ok();

    let outcome = RebuildOperation
        .execute(&h.ctx, &request(OperationKind::Rebuild, &key))
        .await
        .expect("rebuild");

    assert!(matches!(outcome, Outcome::Completed { .. }));
    assert_eq!(status_of(&h.store, &key).await, None, "row removed");
}

/// Store wrapper that reports `RECEIVING_INTERRUPT` on the post-build
/// re-read, simulating data arriving mid-rebuild.
struct InterruptingStore {
    inner: Arc<MemorySessionStore>,
    status_reads: AtomicUsize,
}

#[async_trait]
impl SessionStore for InterruptingStore {
    async fn compare_and_set_status(
        &self,
        key: &SessionKey,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<bool> {
        self.inner.compare_and_set_status(key, expected, next).await
    }

    async fn get_status(&self, key: &SessionKey) -> Result<Option<SessionStatus>> {
        if self.status_reads.fetch_add(1, Ordering::SeqCst) == 1 {
            return Ok(Some(SessionStatus::ReceivingInterrupt));
        }
        self.inner.get_status(key).await
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<SessionRecord>> {
        self.inner.get(key).await
    }

    async fn upsert(&self, record: SessionRecord) -> Result<()> {
        self.inner.upsert(record).await
    }

    async fn set_status(&self, key: &SessionKey, status: SessionStatus) -> Result<()> {
        self.inner.set_status(key, status).await
    }

    async fn delete_row(&self, key: &SessionKey) -> Result<()> {
        self.inner.delete_row(key).await
    }

    async fn list(&self, project: Option<&str>) -> Result<Vec<SessionRecord>> {
        self.inner.list(project).await
    }
}

#[tokio::test]
async fn rebuild_interrupted_by_new_data_resets_to_receiving() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(root.path(), ProjectSettings::default());
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_int");
    seed_session(
        &h,
        &key,
        SessionStatus::Receiving,
        &[("1", "MR", vec![("f.dcm", "U1")])],
    )
    .await;

    let mut ctx = h.ctx.clone();
    ctx.store = Arc::new(InterruptingStore {
        inner: h.store.clone(),
        status_reads: AtomicUsize::new(0),
    });

    let outcome = RebuildOperation
        .execute(&ctx, &request(OperationKind::Rebuild, &key))
        .await
        .expect("rebuild");

    assert!(matches!(outcome, Outcome::Skipped { .. }));
    assert_eq!(
        status_of(&h.store, &key).await,
        Some(SessionStatus::Receiving),
        "session handed back to the receiver"
    );
    assert!(h.sink.requests().is_empty(), "post-processing abandoned");
}

#[tokio::test]
async fn rebuild_of_combined_modality_session_enqueues_separate() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(
        root.path(),
        ProjectSettings {
            split_combined_modalities: true,
            ..ProjectSettings::default()
        },
    );
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_pm");
    seed_session(
        &h,
        &key,
        SessionStatus::Receiving,
        &[
            ("1", "PT", vec![("p.dcm", "U1")]),
            ("2", "MR", vec![("m.dcm", "U2")]),
        ],
    )
    .await;

    RebuildOperation
        .execute(&h.ctx, &request(OperationKind::Rebuild, &key))
        .await
        .expect("rebuild");

    let follow_ups = h.sink.requests();
    assert_eq!(follow_ups.len(), 1);
    assert_eq!(follow_ups[0].kind, OperationKind::Separate);
    assert_eq!(
        status_of(&h.store, &key).await,
        Some(SessionStatus::Receiving),
        "pre-build status restored so separate sees the receiving context"
    );
}

#[tokio::test]
async fn separate_splits_into_per_modality_sessions_and_chains_archives() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(
        root.path(),
        ProjectSettings {
            auto_archive: AutoArchivePolicy::Archive,
            split_combined_modalities: true,
            ..ProjectSettings::default()
        },
    );
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_s");
    seed_session(
        &h,
        &key,
        SessionStatus::Receiving,
        &[
            ("1", "PT", vec![("p.dcm", "U1")]),
            ("2", "MR", vec![("m.dcm", "U2")]),
        ],
    )
    .await;

    let outcome = SeparateOperation
        .execute(&h.ctx, &request(OperationKind::Separate, &key))
        .await
        .expect("separate");
    assert!(matches!(outcome, Outcome::Completed { .. }));

    let pet_key = key.with_folder("sess_s_PT");
    let mr_key = key.with_folder("sess_s_MR");
    assert_eq!(status_of(&h.store, &pet_key).await, Some(SessionStatus::Ready));
    assert_eq!(status_of(&h.store, &mr_key).await, Some(SessionStatus::Ready));
    assert_eq!(status_of(&h.store, &key).await, None, "original row dissolved");

    let pet_record = h.store.get(&pet_key).await.expect("get").expect("record");
    assert!(pet_record.session_dir.join("SCANS/1/p.dcm").exists());
    let mr_record = h.store.get(&mr_key).await.expect("get").expect("record");
    assert!(mr_record.session_dir.join("SCANS/2/m.dcm").exists());

    let follow_ups = h.sink.requests();
    let archives: Vec<_> = follow_ups
        .iter()
        .filter(|r| r.kind == OperationKind::Archive)
        .collect();
    assert_eq!(archives.len(), 2, "one archive per sub-session");
}

#[tokio::test]
async fn separate_leaves_single_modality_sessions_alone() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(root.path(), ProjectSettings::default());
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_mr");
    seed_session(
        &h,
        &key,
        SessionStatus::Ready,
        &[("1", "MR", vec![("m.dcm", "U1")])],
    )
    .await;

    let outcome = SeparateOperation
        .execute(&h.ctx, &request(OperationKind::Separate, &key))
        .await
        .expect("separate");

    assert!(matches!(outcome, Outcome::Completed { .. }));
    assert_eq!(status_of(&h.store, &key).await, Some(SessionStatus::Ready));
    assert!(h.sink.requests().is_empty());
}

#[tokio::test]
async fn archive_requires_exclusive_hold() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(root.path(), ProjectSettings::default());
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_lock");
    seed_session(
        &h,
        &key,
        SessionStatus::Building,
        &[("1", "MR", vec![("f.dcm", "U1")])],
    )
    .await;

    let err = ArchiveOperation
        .execute(&h.ctx, &request(OperationKind::Archive, &key))
        .await
        .expect_err("archive against a held session is a hard error");
    assert!(matches!(err, ArchiveError::Locked { .. }), "got {err:?}");
}

#[tokio::test]
async fn archive_folds_the_session_into_the_destination() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(root.path(), ProjectSettings::default());
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_arch");
    let record = seed_session(
        &h,
        &key,
        SessionStatus::Ready,
        &[("1", "MR", vec![("f.dcm", "U1")])],
    )
    .await;

    let outcome = ArchiveOperation
        .execute(&h.ctx, &request(OperationKind::Archive, &key))
        .await
        .expect("archive");

    let Outcome::Completed {
        destination: Some(destination),
    } = outcome
    else {
        panic!("expected completion with destination");
    };
    assert!(destination.contains("arc001"));
    assert!(std::path::Path::new(&destination).join("SCANS/1/f.dcm").exists());
    assert_eq!(status_of(&h.store, &key).await, None, "row folded away");
    assert!(!record.session_dir.exists(), "quarantine storage removed");
}

#[tokio::test]
async fn move_denies_without_permission_and_mutates_nothing() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(root.path(), ProjectSettings::default());
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_mv");
    let record = seed_session(
        &h,
        &key,
        SessionStatus::Ready,
        &[("1", "MR", vec![("f.dcm", "U1")])],
    )
    .await;

    let mut ctx = h.ctx.clone();
    ctx.permissions = Arc::new(DenyAllPermissions);
    let mut req = request(OperationKind::Move, &key);
    req.params.destination = Some("other_project".to_string());

    let err = MoveOperation
        .execute(&ctx, &req)
        .await
        .expect_err("denied move must fail");
    assert!(matches!(err, ArchiveError::PermissionDenied { .. }), "got {err:?}");
    assert_eq!(status_of(&h.store, &key).await, Some(SessionStatus::Ready));
    assert!(record.session_dir.exists(), "storage untouched");
}

#[tokio::test]
async fn move_relocates_storage_and_enqueues_a_rebuild() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(root.path(), ProjectSettings::default());
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_mv2");
    let record = seed_session(
        &h,
        &key,
        SessionStatus::Ready,
        &[("1", "MR", vec![("f.dcm", "U1")])],
    )
    .await;

    let mut req = request(OperationKind::Move, &key);
    req.params.destination = Some("dest_project".to_string());
    let outcome = MoveOperation.execute(&h.ctx, &req).await.expect("move");
    assert!(matches!(outcome, Outcome::Completed { .. }));

    let new_key = key.with_project("dest_project");
    assert_eq!(status_of(&h.store, &key).await, None, "old identity gone");
    let moved = h.store.get(&new_key).await.expect("get").expect("moved row");
    assert_eq!(moved.status, SessionStatus::Ready);
    assert!(moved.session_dir.join("SCANS/1/f.dcm").exists());
    assert!(!record.session_dir.exists());

    let follow_ups = h.sink.requests();
    assert_eq!(follow_ups.len(), 1);
    assert_eq!(follow_ups[0].kind, OperationKind::Rebuild);
    assert_eq!(follow_ups[0].key, new_key);
}

#[tokio::test]
async fn delete_clears_routing_best_effort() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(root.path(), ProjectSettings::default());
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_del");
    let record = seed_session(
        &h,
        &key,
        SessionStatus::Ready,
        &[("1", "MR", vec![("f.dcm", "U1")])],
    )
    .await;
    let tag = record.tag.clone().expect("tag");
    h.routing.set_rule(tag.as_str(), PROJECT);

    let outcome = DeleteOperation
        .execute(&h.ctx, &request(OperationKind::Delete, &key))
        .await
        .expect("delete");

    assert!(matches!(outcome, Outcome::Completed { .. }));
    assert!(!h.routing.has_rule(&tag), "routing state cleared");
    assert_eq!(status_of(&h.store, &key).await, None);
    assert!(!record.session_dir.exists());
}

#[tokio::test]
async fn delete_survives_a_failing_routing_backend() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(root.path(), ProjectSettings::default());
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_del2");
    let record = seed_session(
        &h,
        &key,
        SessionStatus::Ready,
        &[("1", "MR", vec![("f.dcm", "U1")])],
    )
    .await;

    let mut ctx = h.ctx.clone();
    ctx.routing = Arc::new(FailingRouting);

    let outcome = DeleteOperation
        .execute(&ctx, &request(OperationKind::Delete, &key))
        .await
        .expect("delete succeeds despite routing failure");

    assert!(matches!(outcome, Outcome::Completed { .. }));
    assert_eq!(status_of(&h.store, &key).await, None);
    assert!(!record.session_dir.exists());
}

#[tokio::test]
async fn executor_publishes_lifecycle_events_and_tracker_notes() {
    let root = tempfile::tempdir().expect("tempdir");
    let h = harness(root.path(), ProjectSettings::default());
    let key = SessionKey::new(Some(PROJECT), "20260801_090000", "sess_ex");
    seed_session(
        &h,
        &key,
        SessionStatus::Ready,
        &[("1", "MR", vec![("f.dcm", "U1")])],
    )
    .await;

    let bus = Arc::new(InProcEventBus::new(16));
    let mut events = bus.subscribe();
    let executor =
        OperationExecutor::new(Arc::new(HandlerRegistry::standard()), h.ctx.clone(), bus);

    let req = request(OperationKind::Delete, &key);
    let correlation_id = req.correlation_id;
    executor.dispatch(req).await;

    let started = events.recv().await.expect("started event");
    assert!(matches!(started.payload, OperationEventPayload::Started));
    let completed = events.recv().await.expect("completed event");
    assert!(matches!(
        completed.payload,
        OperationEventPayload::Completed { .. }
    ));
    assert_eq!(completed.kind, OperationKind::Delete);

    let notes = h.tracker.notes(correlation_id);
    assert!(
        notes
            .iter()
            .any(|n| matches!(n, ImportNote::Completed { .. })),
        "tracker saw the completion: {notes:?}"
    );
}

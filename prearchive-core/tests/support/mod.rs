//! Shared fixtures for the integration tests: on-disk session layouts and
//! an operation context wired with in-process fakes.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use prearchive_core::Result;
use prearchive_core::anonymize::{
    AnonymizationContext, AnonymizationDisposition, AnonymizationResult, Anonymizer,
    NoopAnonymizer,
};
use prearchive_core::config::{CoreSettings, ProjectSettings, StaticProjectSettings};
use prearchive_core::error::ArchiveError;
use prearchive_core::ops::{OperationContext, OperationRequest, RequestSink};
use prearchive_core::routing::{
    AllowAllPermissions, MemoryImportTracker, MemorySessionRouting, PermissionPort,
    SessionRouting,
};
use prearchive_core::session::SessionMergeEngine;
use prearchive_core::store::{MemorySessionStore, SessionStore};
use prearchive_model::{SessionKey, SessionRecord, SessionStatus};

/// Captures follow-up submissions instead of running them.
#[derive(Debug, Default)]
pub struct CapturingSink {
    requests: Mutex<Vec<OperationRequest>>,
}

impl CapturingSink {
    pub fn requests(&self) -> Vec<OperationRequest> {
        self.requests.lock().expect("sink lock").clone()
    }
}

impl RequestSink for CapturingSink {
    fn submit(&self, request: OperationRequest) -> Result<()> {
        self.requests.lock().expect("sink lock").push(request);
        Ok(())
    }
}

/// Denies every modification request.
#[derive(Debug, Default)]
pub struct DenyAllPermissions;

#[async_trait]
impl PermissionPort for DenyAllPermissions {
    async fn can_modify(&self, _username: &str, _project: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Routing port whose clear always fails, for the best-effort path.
#[derive(Debug, Default)]
pub struct FailingRouting;

#[async_trait]
impl SessionRouting for FailingRouting {
    async fn clear(&self, _tag: &str) -> Result<()> {
        Err(ArchiveError::Internal("routing backend unavailable".into()))
    }
}

/// Scripted anonymizer: rewrites every file except those whose name appears
/// in the reject list, which it rejects.
#[derive(Debug, Default)]
pub struct ScriptedAnonymizer {
    pub reject: Vec<String>,
}

#[async_trait]
impl Anonymizer for ScriptedAnonymizer {
    async fn anonymize(
        &self,
        files: &[PathBuf],
        _ctx: &AnonymizationContext,
    ) -> Result<Vec<AnonymizationResult>> {
        Ok(files
            .iter()
            .map(|file| {
                let name = file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                let disposition = if self.reject.contains(&name) {
                    AnonymizationDisposition::Rejected
                } else {
                    AnonymizationDisposition::Success
                };
                AnonymizationResult {
                    file: file.clone(),
                    disposition,
                    detail: None,
                }
            })
            .collect())
    }
}

pub struct TestHarness {
    pub ctx: OperationContext,
    pub store: Arc<MemorySessionStore>,
    pub sink: Arc<CapturingSink>,
    pub tracker: Arc<MemoryImportTracker>,
    pub routing: Arc<MemorySessionRouting>,
    pub settings: CoreSettings,
}

pub fn settings_for(root: &Path) -> CoreSettings {
    CoreSettings {
        prearchive_root: root.join("prearchive"),
        archive_root: root.join("archive"),
        identify_by_uid: true,
        retain_file_history: true,
        require_checksums: false,
    }
}

/// Context over in-process fakes with the given default project settings.
pub fn harness(root: &Path, project: ProjectSettings) -> TestHarness {
    let settings = settings_for(root);
    let store = Arc::new(MemorySessionStore::new());
    let sink = Arc::new(CapturingSink::default());
    let tracker = Arc::new(MemoryImportTracker::new());
    let routing = Arc::new(MemorySessionRouting::new());
    let projects = Arc::new(StaticProjectSettings::new(project));
    let merge_engine = Arc::new(SessionMergeEngine::new(
        settings.clone(),
        projects.clone(),
        Arc::new(NoopAnonymizer),
    ));
    let ctx = OperationContext {
        store: store.clone(),
        settings: settings.clone(),
        projects,
        permissions: Arc::new(AllowAllPermissions),
        routing: routing.clone(),
        tracker: tracker.clone(),
        merge_engine,
        sink: sink.clone(),
    };
    TestHarness {
        ctx,
        store,
        sink,
        tracker,
        routing,
        settings,
    }
}

/// One scan's worth of fixture files: `(scan_id, modality, [(file, uid)])`.
pub type ScanFixture<'a> = (&'a str, &'a str, Vec<(&'a str, &'a str)>);

/// Lay a session directory out on disk the way the upstream receiver does:
/// `SCANS/<scan>/` with loose instance files plus a `scan.json` sidecar.
pub fn seed_session_dir(session_dir: &Path, scans: &[ScanFixture<'_>]) {
    for (scan_id, modality, files) in scans {
        let scan_dir = session_dir.join("SCANS").join(scan_id);
        fs::create_dir_all(&scan_dir).expect("create scan dir");
        let mut file_uids = BTreeMap::new();
        for (name, uid) in files {
            fs::write(scan_dir.join(name), format!("instance data {uid}")).expect("write file");
            file_uids.insert((*name).to_string(), (*uid).to_string());
        }
        let sidecar = serde_json::json!({
            "modality": modality,
            "series_description": format!("series {scan_id}"),
            "file_uids": file_uids,
        });
        fs::write(
            scan_dir.join("scan.json"),
            serde_json::to_vec_pretty(&sidecar).expect("encode sidecar"),
        )
        .expect("write sidecar");
    }
}

/// Seed a session directory plus its store row.
pub async fn seed_session(
    harness: &TestHarness,
    key: &SessionKey,
    status: SessionStatus,
    scans: &[ScanFixture<'_>],
) -> SessionRecord {
    let session_dir = harness
        .settings
        .prearchive_root
        .join(key.project_or_unassigned())
        .join(&key.timestamp)
        .join(&key.folder_name);
    seed_session_dir(&session_dir, scans);
    let mut record = SessionRecord::new(key.clone(), &session_dir);
    record.status = status;
    record.tag = Some(format!("study-{}", key.folder_name));
    harness
        .ctx
        .store
        .upsert(record.clone())
        .await
        .expect("seed row");
    record
}

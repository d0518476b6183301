//! End-to-end sync scenarios across engine and server.

use serde_json::json;
use std::time::Duration;
use tillsync_engine::NewSession;
use tillsync_protocol::{
    BatchRequest, BatchStatus, Capability, ConflictResolution, ConflictType, DownloadRequest,
    RecordErrorKind, ResolveConflictRequest, SessionRequest, SessionStatus, SyncChange, SyncRequest, SyncResponse,
    UploadRequest,
};
use tillsync_testkit::prelude::*;

#[test]
fn create_completes_and_is_downloadable() {
    with_pos_engine(|t| {
        let result = t
            .upload_blocking(UploadRequest::new(
                "till-1",
                vec![SyncChange::create(
                    "Product",
                    Some("p1".into()),
                    json!({"name": "Tea", "price": 350}),
                    1,
                )],
            ))
            .unwrap();

        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(result.processed_records, 1);
        assert_eq!(t.stored("Product", "p1").unwrap().data["price"], json!(350));
        assert_eq!(t.audit.entries_for("Product", "p1").len(), 1);

        let download = t
            .download(&DownloadRequest {
                device_id: "till-2".into(),
                ..DownloadRequest::default()
            })
            .unwrap();
        assert_eq!(download.changes.len(), 1);
    });
}

#[tokio::test]
async fn version_conflict_resolved_remote_completes_batch() {
    let harness = ServerHarness::default();
    let t = &harness.fixture;
    t.seed("Product", "p1", json!({"name": "Tea", "price": 300}));
    t.seed("Product", "p1", json!({"price": 320}));

    let result = harness
        .upload_and_wait(UploadRequest::new(
            "till-1",
            vec![SyncChange::update("Product", "p1", json!({"price": 400}), 1)],
        ))
        .await;
    assert_eq!(result.status, BatchStatus::Conflicted);
    assert_eq!(result.conflicted_records, 1);
    let conflict = &result.conflicts[0];
    assert_eq!(conflict.conflict_type, ConflictType::Version);
    assert_eq!(t.stored("Product", "p1").unwrap().data["price"], json!(320));

    let response = harness
        .server
        .handle(SyncRequest::ResolveConflict(ResolveConflictRequest {
            batch_id: result.batch_id.clone(),
            conflict_id: conflict.id.clone(),
            resolution: ConflictResolution::Remote,
            resolved_data: None,
        }));
    assert!(matches!(response, SyncResponse::Conflict(ref c) if c.is_resolved()));

    let status = harness.server.handle(SyncRequest::BatchStatus(BatchRequest {
        batch_id: result.batch_id,
    }));
    match status {
        SyncResponse::Batch(batch) => assert_eq!(batch.status, BatchStatus::Completed),
        other => panic!("unexpected response: {other:?}"),
    }
    let stored = t.stored("Product", "p1").unwrap();
    assert_eq!(stored.data["price"], json!(400));
    assert_eq!(stored.version, 3);
}

#[test]
fn session_expires_after_its_window() {
    with_pos_engine(|t| {
        let session = t
            .sessions()
            .create_session(NewSession::new("till-1", "u1").with_max_offline_hours(1))
            .unwrap();
        assert!(t.sessions().validate_session(&session.id).unwrap());

        t.advance(Duration::from_secs(61 * 60));
        assert!(!t.sessions().validate_session(&session.id).unwrap());
        assert_eq!(
            t.sessions().get_session(&session.id).unwrap().status,
            SessionStatus::Expired
        );
    });
}

#[test]
fn session_without_write_rejects_every_change() {
    with_pos_engine(|t| {
        let session = t
            .sessions()
            .create_session(
                NewSession::new("till-1", "u1").with_capabilities([Capability::Read, Capability::Sync]),
            )
            .unwrap();

        let outcome = t
            .sessions()
            .save_offline_changes(
                &session.id,
                vec![
                    SyncChange::create("Customer", Some("c1".into()), json!({"name": "Ann"}), 1),
                    SyncChange::create("Customer", Some("c2".into()), json!({"name": "Bo"}), 1),
                ],
            )
            .unwrap();

        assert!(outcome.saved_changes.is_empty());
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome
            .errors
            .iter()
            .all(|e| e.kind == RecordErrorKind::CapabilityDenied));
        assert!(t.sessions().pending_changes(&session.id).unwrap().is_empty());
    });
}

#[tokio::test]
async fn record_topic_fans_out_to_its_subscribers_only() {
    let harness = ServerHarness::default();
    let mut p1_watcher = harness.connect("till-2", "u2");
    let mut p2_watcher = harness.connect("till-3", "u3");
    let mut bystander = harness.connect("till-4", "u4");
    harness.subscribe(&p1_watcher, "Product", Some("p1"));
    harness.subscribe(&p2_watcher, "Product", Some("p2"));
    harness.subscribe(&bystander, "Customer", None);
    for connection in [&mut p1_watcher, &mut p2_watcher, &mut bystander] {
        connection.drain();
    }

    harness
        .upload_and_wait(UploadRequest::new(
            "till-1",
            vec![SyncChange::create("Product", Some("p1".into()), json!({"name": "Tea"}), 1)],
        ))
        .await;

    assert_eq!(p1_watcher.updated_keys(), vec!["Product:p1".to_string()]);
    assert!(p2_watcher.updated_keys().is_empty());
    assert!(bystander.updated_keys().is_empty());
}

#[tokio::test]
async fn offline_check_in_replays_queue() {
    let harness = ServerHarness::default();
    let t = &harness.fixture;
    let session = t
        .sessions()
        .create_session(NewSession::new("till-1", "u1"))
        .unwrap();
    t.sessions()
        .save_offline_changes(
            &session.id,
            vec![SyncChange::create("Customer", Some("c1".into()), json!({"name": "Ann"}), 1)],
        )
        .unwrap();

    let batch_id = match harness.server.handle(SyncRequest::CheckIn(SessionRequest {
        session_id: session.id.clone(),
    })) {
        SyncResponse::CheckIn(check_in) => check_in.batch_id.unwrap(),
        other => panic!("unexpected response: {other:?}"),
    };
    let result = t.worker().wait(&batch_id).await.unwrap();
    assert_eq!(result.status, BatchStatus::Completed);
    assert!(t.stored("Customer", "c1").is_some());
    assert!(!t.sessions().validate_session(&session.id).unwrap());
}

//! Status persistence through the public store API: round-trips,
//! resumption records, and readers racing a writer.

use chrono::Utc;
use ralph_core::convergence::{BlockReason, RequirementState};
use ralph_core::error::StatusError;
use ralph_core::gate::{GateError, GateResult, PipelineResult};
use ralph_core::requirement::RequirementId;
use ralph_core::status::{MilestoneStatus, ProjectStatus, RequirementRecord};
use ralph_store::StatusStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn test_store() -> (tempfile::TempDir, StatusStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = StatusStore::new(dir.path().join(".ralph").join("status"));
    (dir, store)
}

fn rich_status(slug: &str) -> ProjectStatus {
    let mut status = ProjectStatus::new("demo", slug, format!("ralph/{slug}"));
    status.external_project_id = Some("proj_1".into());
    status.external_team_id = Some("team_1".into());
    let now = Utc::now();
    status.advance_milestone("M1", MilestoneStatus::Complete, now);
    status.advance_milestone("M2", MilestoneStatus::InProgress, now);

    status.record_requirement(
        RequirementId::new("REQ-1"),
        RequirementRecord {
            state: RequirementState::Succeeded { iterations: 2 },
            iterations: 2,
            last_result: None,
            updated_at: now,
        },
    );
    status.record_requirement(
        RequirementId::new("REQ-2"),
        RequirementRecord {
            state: RequirementState::FailedExhausted { iterations: 3 },
            iterations: 3,
            last_result: Some(PipelineResult::from_gates(vec![GateResult::failed(
                "tests",
                vec![GateError::at("tests/it.rs", 9, None, "test failed: roundtrip")],
                Duration::from_millis(820),
            )])),
            updated_at: now,
        },
    );
    status.record_requirement(
        RequirementId::new("REQ-3"),
        RequirementRecord {
            state: RequirementState::Blocked {
                reason: BlockReason::Dependency {
                    requirement: RequirementId::new("REQ-2"),
                },
            },
            iterations: 0,
            last_result: None,
            updated_at: now,
        },
    );
    status
}

#[test]
fn write_then_read_roundtrips_everything() {
    let (_dir, store) = test_store();
    let status = rich_status("v1");
    store.write("v1", &status).unwrap();

    let back = store.read("v1").unwrap();
    assert_eq!(back, status);
    assert!(back.milestones["M1"].completed_at.is_some());
    assert_eq!(
        back.requirement_state(&RequirementId::new("REQ-2")).map(|s| s.label()),
        Some("FAILED_EXHAUSTED")
    );
}

#[test]
fn second_write_replaces_first() {
    let (_dir, store) = test_store();
    let mut status = ProjectStatus::new("demo", "v1", "main");
    store.write("v1", &status).unwrap();

    status.branch = "ralph/v1".into();
    store.write("v1", &status).unwrap();
    assert_eq!(store.read("v1").unwrap().branch, "ralph/v1");
    assert_eq!(store.list().unwrap(), vec!["v1"]);
}

#[test]
fn invalid_milestone_status_on_disk_is_rejected() {
    let (_dir, store) = test_store();
    std::fs::create_dir_all(store.dir()).unwrap();
    std::fs::write(
        store.path_for("v1"),
        r#"{"project":"demo","slug":"v1","branch":"main","createdAt":"2026-01-01T00:00:00Z",
            "milestones":{"M1":{"status":"shipped"}}}"#,
    )
    .unwrap();
    let err = store.read("v1").unwrap_err();
    assert!(matches!(err, StatusError::Validation { .. }), "{err}");
}

/// Readers polling while a writer keeps replacing the file must only ever
/// observe complete documents.
#[test]
fn concurrent_reads_never_see_partial_content() {
    let (_dir, store) = test_store();
    let store = Arc::new(store);
    store.write("v1", &rich_status("v1")).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        readers.push(std::thread::spawn(move || {
            let mut reads = 0u32;
            while !done.load(Ordering::Relaxed) {
                let status = store
                    .read("v1")
                    .unwrap_or_else(|e| panic!("reader observed a broken file: {e}"));
                assert_eq!(status.slug, "v1");
                assert_eq!(status.requirements.len(), 3);
                reads += 1;
            }
            reads
        }));
    }

    for i in 0..200 {
        let mut status = rich_status("v1");
        status.branch = format!("ralph/v1-{i}");
        store.write("v1", &status).unwrap();
    }
    done.store(true, Ordering::Relaxed);

    let total: u32 = readers.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(total > 0);
    assert_eq!(store.read("v1").unwrap().branch, "ralph/v1-199");
}

/// Two writers racing: the file always ends up as one writer's full document.
#[test]
fn concurrent_writers_last_writer_wins() {
    let (_dir, store) = test_store();
    let store = Arc::new(store);

    let writers: Vec<_> = (0..2)
        .map(|w| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..50 {
                    let mut status = ProjectStatus::new("demo", "v1", format!("writer-{w}-{i}"));
                    status.external_team_id = Some(format!("team-{w}"));
                    store.write("v1", &status).unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    let status = store.read("v1").unwrap();
    let writer = status.external_team_id.as_deref().unwrap().trim_start_matches("team-");
    assert!(status.branch.starts_with(&format!("writer-{writer}-")));
}

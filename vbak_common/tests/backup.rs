//! End-to-end engine scenarios over in-memory collaborators.

mod common;

use common::*;

use vbak_common::archive::{ArchiveKind, ArchiveName};
use vbak_common::lineage::{LineageStore, RunOutcome};
use vbak_common::runner::RunController;
use vbak_common::snapshot::{Snapshot, SnapshotSource};
use vbak_common::system::random_bytes;
use vbak_common::EngineError;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn first_run_upgrades_to_full() {
    let fixture = fixture();

    let outcome = run_to_completion(&fixture, Some(ArchiveKind::Incremental), false);
    assert_eq!(outcome, RunOutcome::Success);

    for subvol in ["root", "home"] {
        let record = fixture.store.latest_committed(subvol).unwrap().unwrap();
        assert_eq!(record.kind, ArchiveKind::Full);
        assert!(record.parent_taken.is_none());
        assert!(record.remote_path.starts_with("/srv/backups/talos/202608/full/"));
        assert!(fixture
            .remote_state
            .files
            .lock()
            .unwrap()
            .contains_key(&record.remote_path));
    }

    // The liveness marker names the client.
    let files = fixture.remote_state.files.lock().unwrap();
    let marker = files.get("/srv/backups/talos/.verification").unwrap();
    assert!(String::from_utf8_lossy(marker).trim().ends_with("talos"));
}

#[test]
fn second_run_is_incremental() {
    let fixture = fixture();

    assert_eq!(run_to_completion(&fixture, None, false), RunOutcome::Success);

    let root_full = fixture.store.latest_committed("root").unwrap().unwrap();
    let home_full = fixture.store.latest_committed("home").unwrap().unwrap();

    assert_eq!(run_to_completion(&fixture, None, false), RunOutcome::Success);

    let root_incr = fixture.store.latest_committed("root").unwrap().unwrap();
    assert_eq!(root_incr.kind, ArchiveKind::Incremental);
    assert_eq!(root_incr.parent_taken, Some(root_full.taken));

    let home_incr = fixture.store.latest_committed("home").unwrap().unwrap();
    assert_eq!(home_incr.parent_taken, Some(home_full.taken));

    // The parent timestamp is recorded in the file name.
    let name = root_incr.remote_path.rsplit_once('/').unwrap().1;
    let parsed = ArchiveName::try_from(name).unwrap();
    assert_eq!(parsed.parent, Some(root_full.taken));
    assert!(root_incr
        .remote_path
        .contains("/202608/incremental/"));
}

#[test]
fn missing_parent_snapshot_downgrades_one_subvolume() {
    let fixture = fixture();

    assert_eq!(run_to_completion(&fixture, None, false), RunOutcome::Success);
    assert_eq!(run_to_completion(&fixture, None, false), RunOutcome::Success);

    // Losing the local base snapshot of one subvolume
    // must only downgrade that subvolume.
    let home_parent = fixture.store.latest_committed("home").unwrap().unwrap();
    fixture
        .snapshots
        .delete(&Snapshot::new("home".to_string(), home_parent.taken))
        .unwrap();

    assert_eq!(run_to_completion(&fixture, None, false), RunOutcome::Success);

    let home = fixture.store.latest_committed("home").unwrap().unwrap();
    assert_eq!(home.kind, ArchiveKind::Full);

    let root = fixture.store.latest_committed("root").unwrap().unwrap();
    assert_eq!(root.kind, ArchiveKind::Incremental);
}

#[test]
fn mid_stream_failure_is_partial_and_clean() {
    let fixture = fixture();

    assert_eq!(run_to_completion(&fixture, None, false), RunOutcome::Success);
    let root_records_before = fixture.store.records_of("root").unwrap();

    // The next part writer (the root transfer) dies mid-stream.
    *fixture.remote_state.fail_after.lock().unwrap() = Some(16);

    let outcome = run_to_completion(&fixture, None, false);
    assert_eq!(outcome, RunOutcome::Partial);

    // No temporary object and no lineage row survive the failure.
    assert!(fixture.remote_state.part_files().is_empty());
    assert_eq!(
        fixture.store.records_of("root").unwrap(),
        root_records_before
    );
    assert_eq!(fixture.store.records_of("home").unwrap().len(), 2);

    let runs = fixture.controller.list_runs(10, 0, None).unwrap();
    assert_eq!(runs[0].outcome, RunOutcome::Partial);
    let root_item = runs[0]
        .items
        .iter()
        .find(|item| item.subvol == "root")
        .unwrap();
    assert_eq!(root_item.outcome, RunOutcome::Failed);
    assert!(root_item.error.is_some());

    // The earlier run is untouched.
    assert_eq!(runs[1].outcome, RunOutcome::Success);
}

#[test]
fn cancel_terminates_without_leftovers() {
    let fixture = fixture();
    fixture.snapshots.set_pacing(Some(StreamPacing {
        chunk_size: 32 * 1024,
        chunks: 600,
        delay: Duration::from_millis(3),
    }));

    fixture.controller.start(None, false, &[]).unwrap();

    // Wait for the first progress sample, then cancel.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = fixture.controller.status().unwrap();
        if status.progress.map(|p| p.bytes_in > 0).unwrap_or(false) {
            break;
        }

        assert!(Instant::now() < deadline, "no progress before deadline");
        thread::sleep(Duration::from_millis(5));
    }
    fixture.controller.cancel();

    assert_eq!(fixture.controller.wait(), Some(RunOutcome::Cancelled));

    assert!(fixture.remote_state.part_files().is_empty());
    assert!(fixture.store.records_of("root").unwrap().is_empty());
    assert!(fixture.store.records_of("home").unwrap().is_empty());

    let runs = fixture.controller.list_runs(10, 0, None).unwrap();
    assert_eq!(runs[0].outcome, RunOutcome::Cancelled);

    // Cancel after terminal is a no-op.
    fixture.controller.cancel();
    assert_eq!(runs.len(), 1);
}

#[test]
fn concurrent_starts_admit_exactly_one() {
    let fixture = fixture();
    fixture.snapshots.set_pacing(Some(StreamPacing {
        chunk_size: 32 * 1024,
        chunks: 600,
        delay: Duration::from_millis(3),
    }));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let controller = Arc::clone(&fixture.controller);
        handles.push(thread::spawn(move || controller.start(None, false, &[])));
    }

    let mut started = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) => started += 1,
            Err(EngineError::AlreadyRunning) => refused += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(started, 1);
    assert_eq!(refused, 7);

    fixture.controller.cancel();
    fixture.controller.wait();
}

#[test]
fn unreachable_host_is_a_synchronous_precondition() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_with_sources(&tmp);

    let store = Arc::new(LineageStore::open_in_memory().unwrap());
    let snapshots = Arc::new(MemorySnapshots::new(ts("20260814-010000")));

    let controller = Arc::new(
        RunController::with_parts(
            config,
            Arc::clone(&store),
            snapshots as Arc<dyn SnapshotSource>,
            Arc::new(UnreachableConnect),
            random_bytes(32),
        )
        .with_clock(test_clock()),
    );

    assert!(matches!(
        controller.start(None, false, &[]),
        Err(EngineError::Remote(_))
    ));

    // The run never existed.
    assert!(store.list_runs(10, 0, None).unwrap().is_empty());
    assert!(controller.status().is_none());
}

#[test]
fn unknown_subvolume_is_refused() {
    let fixture = fixture();

    assert!(matches!(
        fixture
            .controller
            .start(None, false, &["var".to_string()]),
        Err(EngineError::UnknownSubvolume(_))
    ));
}

#[test]
fn browse_archives_by_month() {
    let fixture = fixture();
    assert_eq!(run_to_completion(&fixture, None, false), RunOutcome::Success);

    match fixture.controller.browse_archives(None).unwrap() {
        vbak_common::control::ArchiveListing::Months(months) => {
            assert_eq!(months, vec!["202608".to_string()])
        }
        _ => panic!("expected month listing"),
    }

    match fixture
        .controller
        .browse_archives(Some("202608".to_string()))
        .unwrap()
    {
        vbak_common::control::ArchiveListing::Entries(entries) => {
            assert_eq!(entries.len(), 2);
        }
        _ => panic!("expected entry listing"),
    }
}

//! Retention reaping against in-memory collaborators.

mod common;

use common::*;

use vbak_common::archive::ArchiveKind;
use vbak_common::lineage::{LineageRecord, LineageStore};
use vbak_common::retention::Reaper;
use vbak_common::snapshot::{Snapshot, SnapshotSource};

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDateTime;

fn committed(
    store: &LineageStore,
    remote_state: &MemoryState,
    subvol: &str,
    taken: &str,
    parent: Option<&str>,
) -> LineageRecord {
    let kind = match parent {
        Some(_) => ArchiveKind::Incremental,
        None => ArchiveKind::Full,
    };
    let record = LineageRecord {
        subvol: subvol.to_string(),
        taken: ts(taken),
        kind,
        parent_taken: parent.map(ts),
        remote_path: format!(
            "/srv/backups/talos/{}/{}/{}_{}.zst.vbk",
            &taken[..6],
            kind,
            subvol,
            taken
        ),
        bytes_written: 64,
        digest: "00".repeat(32),
    };

    store.record_commit(&record).unwrap();
    remote_state
        .files
        .lock()
        .unwrap()
        .insert(record.remote_path.clone(), vec![0; 64]);

    record
}

struct ReaperFixture {
    config: vbak_common::config::AgentConfig,
    store: Arc<LineageStore>,
    snapshots: Arc<MemorySnapshots>,
    remote_state: Arc<MemoryState>,
    _tmp: tempfile::TempDir,
}

fn reaper_fixture() -> ReaperFixture {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config_with_sources(&tmp);
    config.daily_incremental_days = 3;

    ReaperFixture {
        config,
        store: Arc::new(LineageStore::open_in_memory().unwrap()),
        snapshots: Arc::new(MemorySnapshots::new(ts("20260801-010000"))),
        remote_state: Arc::new(MemoryState::default()),
        _tmp: tmp,
    }
}

impl ReaperFixture {
    fn reap(&self, now: NaiveDateTime) {
        let remote = MemoryRemote(Arc::clone(&self.remote_state));

        Reaper {
            config: &self.config,
            store: &self.store,
            snapshots: &*self.snapshots,
            remote: &remote,
        }
        .reap(now);
    }

    fn remote_files(&self) -> Vec<String> {
        self.remote_state.file_names()
    }
}

#[test]
fn expired_incrementals_survive_while_depended_on() {
    let fixture = reaper_fixture();

    // A chain whose old links are expired but still carry fresh links.
    committed(&fixture.store, &fixture.remote_state, "root", "20260808-040000", None);
    let mut parent = "20260808-040000".to_string();
    for day in 9..=13 {
        let taken = format!("202608{:02}-040000", day);
        committed(
            &fixture.store,
            &fixture.remote_state,
            "root",
            &taken,
            Some(&parent),
        );
        parent = taken;
    }

    let before = fixture.remote_files();
    fixture.reap(ts("20260815-043000"));

    // Nothing may go: every expired link is the base of a younger one.
    assert_eq!(fixture.remote_files(), before);
    assert_eq!(fixture.store.records_of("root").unwrap().len(), 6);
}

#[test]
fn fully_expired_chain_tail_is_released() {
    let fixture = reaper_fixture();

    committed(&fixture.store, &fixture.remote_state, "home", "20260801-040000", None);
    committed(
        &fixture.store,
        &fixture.remote_state,
        "home",
        "20260802-040000",
        Some("20260801-040000"),
    );
    committed(
        &fixture.store,
        &fixture.remote_state,
        "home",
        "20260803-040000",
        Some("20260802-040000"),
    );

    fixture.reap(ts("20260815-043000"));

    // All incrementals were expired and nothing depends on them anymore;
    // the full archive stays (month retention governs it).
    let records = fixture.store.records_of("home").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, ArchiveKind::Full);
    assert_eq!(fixture.remote_files().len(), 1);
}

#[test]
fn expired_month_bucket_is_dropped_unless_depended_on() {
    let fixture = reaper_fixture();

    // An old bucket nothing depends on, and a recent chain.
    committed(&fixture.store, &fixture.remote_state, "root", "20250901-040000", None);
    committed(&fixture.store, &fixture.remote_state, "root", "20260814-040000", None);

    fixture.reap(ts("20260815-043000"));

    assert!(fixture
        .store
        .records_of_month("202509")
        .unwrap()
        .is_empty());
    assert!(!fixture
        .remote_files()
        .iter()
        .any(|name| name.contains("/202509/")));
    assert_eq!(fixture.store.records_of("root").unwrap().len(), 1);

    // A bucket that still carries a later incremental must stay.
    let fixture = reaper_fixture();
    committed(&fixture.store, &fixture.remote_state, "root", "20250930-040000", None);
    committed(
        &fixture.store,
        &fixture.remote_state,
        "root",
        "20251001-040000",
        Some("20250930-040000"),
    );

    fixture.reap(ts("20260415-043000"));

    assert_eq!(fixture.store.records_of_month("202509").unwrap().len(), 1);
}

#[test]
fn reaping_is_idempotent() {
    let fixture = reaper_fixture();

    committed(&fixture.store, &fixture.remote_state, "home", "20260801-040000", None);
    committed(
        &fixture.store,
        &fixture.remote_state,
        "home",
        "20260802-040000",
        Some("20260801-040000"),
    );

    fixture.reap(ts("20260815-043000"));
    let files = fixture.remote_files();
    let records = fixture.store.records_of("home").unwrap();

    fixture.reap(ts("20260815-043000"));
    assert_eq!(fixture.remote_files(), files);
    assert_eq!(fixture.store.records_of("home").unwrap(), records);
}

#[test]
fn expired_local_snapshots_keep_incremental_bases() {
    let fixture = reaper_fixture();

    // Snapshots taken on the 1st and 2nd, with matching committed archives.
    let old_base = fixture
        .snapshots
        .create("root", Path::new("/"))
        .unwrap();
    let fresh = fixture.snapshots.create("root", Path::new("/")).unwrap();

    committed(
        &fixture.store,
        &fixture.remote_state,
        "root",
        &old_base.taken().format("%Y%m%d-%H%M%S").to_string(),
        None,
    );
    committed(
        &fixture.store,
        &fixture.remote_state,
        "root",
        &fresh.taken().format("%Y%m%d-%H%M%S").to_string(),
        Some(&old_base.taken().format("%Y%m%d-%H%M%S").to_string()),
    );

    // Both snapshots are far past local retention, but both are needed:
    // one as a named parent, one as the next incremental base.
    fixture.reap(ts("20261001-043000"));
    assert_eq!(fixture.snapshots.list("root").unwrap().len(), 2);

    // An unreferenced expired snapshot goes.
    let stray = fixture.snapshots.create("home", Path::new("/")).unwrap();
    fixture.reap(ts("20261001-043000"));
    assert!(fixture.snapshots.list("home").unwrap().is_empty());
    drop(stray);

    let snapshot = Snapshot::new("root".to_string(), old_base.taken());
    assert!(fixture.snapshots.list("root").unwrap().contains(&snapshot));
}
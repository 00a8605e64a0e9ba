//! In-memory stand-ins for the archival host and the snapshot primitive,
//! substituted at the capability seams of the engine.
#![allow(dead_code)]

use vbak_common::archive::ArchiveKind;
use vbak_common::config::AgentConfig;
use vbak_common::lineage::LineageStore;
use vbak_common::remote::{part_path, Connect, RemoteChannel, RemoteEntry};
use vbak_common::runner::{Clock, RunController};
use vbak_common::snapshot::{Snapshot, SnapshotSource, TIMESTAMP_FMT};
use vbak_common::system::random_bytes;
use vbak_common::{RemoteError, SnapshotError};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Cursor, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::prelude::*;

/// The fixed instant all engine tests plan against (mid-month).
pub const TEST_NOW: &str = "20260815-043000";

pub fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FMT).unwrap()
}

pub fn test_clock() -> Clock {
    Arc::new(|| (ts(TEST_NOW), ts(TEST_NOW).date()))
}

/// Shared state of the in-memory archival host.
#[derive(Default)]
pub struct MemoryState {
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub dirs: Mutex<HashSet<String>>,
    /// When set, the next opened part writer fails after this many bytes.
    pub fail_after: Mutex<Option<u64>>,
}

impl MemoryState {
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn part_files(&self) -> Vec<String> {
        self.file_names()
            .into_iter()
            .filter(|name| name.ends_with(".part"))
            .collect()
    }
}

/// An in-memory [`RemoteChannel`] over shared state.
pub struct MemoryRemote(pub Arc<MemoryState>);

struct PartWriter {
    state: Arc<MemoryState>,
    path: String,
    budget: Option<u64>,
    written: u64,
}

impl Write for PartWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(budget) = self.budget {
            if self.written + buf.len() as u64 > budget {
                return Err(io::Error::other("injected remote write failure"));
            }
        }
        self.written += buf.len() as u64;

        self.state
            .files
            .lock()
            .unwrap()
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RemoteChannel for MemoryRemote {
    fn ensure_dir(&self, path: &str) -> Result<(), RemoteError> {
        let mut prefix = String::new();
        let mut dirs = self.0.dirs.lock().unwrap();

        for component in path.split('/').filter(|c| !c.is_empty()) {
            prefix.push('/');
            prefix.push_str(component);
            dirs.insert(prefix.clone());
        }

        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool, RemoteError> {
        Ok(self.0.files.lock().unwrap().contains_key(path))
    }

    fn size_of(&self, path: &str) -> Result<Option<u64>, RemoteError> {
        Ok(self
            .0
            .files
            .lock()
            .unwrap()
            .get(path)
            .map(|data| data.len() as u64))
    }

    fn create_part(&self, path: &str) -> Result<Box<dyn Write + Send>, RemoteError> {
        let part = part_path(path);
        self.0.files.lock().unwrap().insert(part.clone(), Vec::new());

        Ok(Box::new(PartWriter {
            state: Arc::clone(&self.0),
            path: part,
            budget: self.0.fail_after.lock().unwrap().take(),
            written: 0,
        }))
    }

    fn promote(&self, path: &str) -> Result<(), RemoteError> {
        let mut files = self.0.files.lock().unwrap();
        let data = files
            .remove(&part_path(path))
            .ok_or_else(|| RemoteError::NoSuchObject(part_path(path)))?;
        files.insert(path.to_string(), data);

        Ok(())
    }

    fn discard_part(&self, path: &str) -> Result<(), RemoteError> {
        self.0.files.lock().unwrap().remove(&part_path(path));
        Ok(())
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>, RemoteError> {
        let data = self
            .0
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::NoSuchObject(path.to_string()))?;

        Ok(Box::new(Cursor::new(data)))
    }

    fn put_file(&self, path: &str, contents: &[u8]) -> Result<(), RemoteError> {
        self.0
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_vec());

        Ok(())
    }

    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let files = self.0.files.lock().unwrap();
        let dirs = self.0.dirs.lock().unwrap();

        let mut entries = Vec::new();
        for (name, data) in files.iter() {
            if let Some(rest) = name.strip_prefix(&prefix) {
                if !rest.contains('/') {
                    entries.push(RemoteEntry {
                        name: rest.to_string(),
                        size: data.len() as u64,
                        mtime: None,
                        is_dir: false,
                    });
                }
            }
        }
        for name in dirs.iter() {
            if let Some(rest) = name.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    entries.push(RemoteEntry {
                        name: rest.to_string(),
                        size: 0,
                        mtime: None,
                        is_dir: true,
                    });
                }
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.0.files.lock().unwrap().remove(path);
        Ok(())
    }

    fn delete_dir(&self, path: &str) -> Result<(), RemoteError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));

        self.0
            .files
            .lock()
            .unwrap()
            .retain(|name, _| !name.starts_with(&prefix));
        self.0
            .dirs
            .lock()
            .unwrap()
            .retain(|name| !name.starts_with(&prefix) && name != path);

        Ok(())
    }

    fn read_head(&self, path: &str, n: usize) -> Result<Vec<u8>, RemoteError> {
        let files = self.0.files.lock().unwrap();
        let data = files
            .get(path)
            .ok_or_else(|| RemoteError::NoSuchObject(path.to_string()))?;

        Ok(data[..n.min(data.len())].to_vec())
    }
}

/// A [`Connect`] handing out channels onto the same in-memory host.
pub struct MemoryConnect(pub Arc<MemoryState>);

impl Connect for MemoryConnect {
    fn connect(&self) -> Result<Box<dyn RemoteChannel>, RemoteError> {
        Ok(Box::new(MemoryRemote(Arc::clone(&self.0))))
    }
}

/// A [`Connect`] standing in for an unreachable archival host.
pub struct UnreachableConnect;

impl Connect for UnreachableConnect {
    fn connect(&self) -> Result<Box<dyn RemoteChannel>, RemoteError> {
        Err(RemoteError::NoAddrs)
    }
}

/// Per-snapshot stream pacing, used to keep a transfer running
/// long enough to cancel it.
#[derive(Clone, Copy)]
pub struct StreamPacing {
    pub chunk_size: usize,
    pub chunks: usize,
    pub delay: Duration,
}

struct SnapState {
    /// Current payload per subvolume, captured on snapshot creation.
    contents: HashMap<String, Vec<u8>>,
    /// Snapshot payloads by identity.
    snaps: BTreeMap<(String, NaiveDateTime), Vec<u8>>,
    /// Deterministic snapshot timestamps.
    clock: NaiveDateTime,
    pacing: Option<StreamPacing>,
}

/// A deterministic in-memory [`SnapshotSource`].
pub struct MemorySnapshots {
    state: Mutex<SnapState>,
}

impl MemorySnapshots {
    pub fn new(first_taken: NaiveDateTime) -> Self {
        Self {
            state: Mutex::new(SnapState {
                contents: HashMap::new(),
                snaps: BTreeMap::new(),
                clock: first_taken,
                pacing: None,
            }),
        }
    }

    /// Sets the payload future snapshots of the subvolume capture.
    pub fn set_contents(&self, subvol: &str, data: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .contents
            .insert(subvol.to_string(), data);
    }

    pub fn set_pacing(&self, pacing: Option<StreamPacing>) {
        self.state.lock().unwrap().pacing = pacing;
    }

    /// The exact stream bytes a snapshot serializes to,
    /// for byte-for-byte round-trip comparison.
    pub fn stream_bytes(
        &self,
        snapshot: &Snapshot,
        parent_taken: Option<NaiveDateTime>,
    ) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let payload = state
            .snaps
            .get(&(snapshot.subvol().to_string(), snapshot.taken()))
            .expect("unknown snapshot");

        let mut stream = match parent_taken {
            Some(parent) => format!("incr {} ", parent.format(TIMESTAMP_FMT)).into_bytes(),
            None => b"full ".to_vec(),
        };
        stream.extend_from_slice(&snapshot.taken().format(TIMESTAMP_FMT).to_string().into_bytes());
        stream.push(b' ');
        stream.extend_from_slice(payload);

        stream
    }
}

/// A reader that trickles out its data to keep the pipeline busy.
struct PacedReader {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
    delay: Duration,
}

impl Read for PacedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.data.len() {
            return Ok(0);
        }

        thread::sleep(self.delay);

        let n = buf
            .len()
            .min(self.chunk)
            .min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;

        Ok(n)
    }
}

impl SnapshotSource for MemorySnapshots {
    fn create(&self, subvol: &str, _source_path: &Path) -> Result<Snapshot, SnapshotError> {
        let mut state = self.state.lock().unwrap();

        state.clock = state.clock + chrono::Duration::hours(1);
        let taken = state.clock;

        let payload = state.contents.get(subvol).cloned().unwrap_or_default();
        state
            .snaps
            .insert((subvol.to_string(), taken), payload);

        Ok(Snapshot::new(subvol.to_string(), taken))
    }

    fn list(&self, subvol: &str) -> Result<Vec<Snapshot>, SnapshotError> {
        let state = self.state.lock().unwrap();

        let mut snapshots: Vec<Snapshot> = state
            .snaps
            .keys()
            .filter(|(name, _)| name == subvol)
            .map(|(name, taken)| Snapshot::new(name.clone(), *taken))
            .collect();

        snapshots.sort_by_key(|snapshot| std::cmp::Reverse(snapshot.taken()));
        Ok(snapshots)
    }

    fn delete(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        self.state
            .lock()
            .unwrap()
            .snaps
            .remove(&(snapshot.subvol().to_string(), snapshot.taken()));

        Ok(())
    }

    fn send_stream(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
    ) -> Result<Box<dyn Read + Send>, SnapshotError> {
        {
            let state = self.state.lock().unwrap();

            let key = (snapshot.subvol().to_string(), snapshot.taken());
            if !state.snaps.contains_key(&key) {
                return Err(SnapshotError::NoSuchSnapshot(snapshot.clone()));
            }

            if let Some(parent) = parent {
                let key = (parent.subvol().to_string(), parent.taken());
                if !state.snaps.contains_key(&key) {
                    return Err(SnapshotError::NoSuchSnapshot(parent.clone()));
                }
            }
        }

        let mut data = self.stream_bytes(snapshot, parent.map(Snapshot::taken));
        let pacing = self.state.lock().unwrap().pacing;

        match pacing {
            Some(pacing) => {
                data = random_bytes(pacing.chunk_size * pacing.chunks);
                Ok(Box::new(PacedReader {
                    data,
                    pos: 0,
                    chunk: pacing.chunk_size,
                    delay: pacing.delay,
                }))
            }
            None => Ok(Box::new(Cursor::new(data))),
        }
    }
}

/// A fully wired engine over in-memory collaborators.
pub struct Fixture {
    pub controller: Arc<RunController>,
    pub config: AgentConfig,
    pub store: Arc<LineageStore>,
    pub snapshots: Arc<MemorySnapshots>,
    pub remote_state: Arc<MemoryState>,
    pub key_material: Vec<u8>,
    _tmp: tempfile::TempDir,
}

pub fn config_with_sources(tmp: &tempfile::TempDir) -> AgentConfig {
    let root = tmp.path().join("root");
    let home = tmp.path().join("home");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::create_dir_all(&home).unwrap();

    toml::from_str(&format!(
        r#"
        client_id = "talos"
        remote_host = "10.11.0.1"
        remote_user = "backup"
        remote_base_path = "/srv/backups"
        snapshot_dir = "{snapdir}"

        [[subvolumes]]
        name = "root"
        source_path = "{root}"

        [[subvolumes]]
        name = "home"
        source_path = "{home}"
        "#,
        snapdir = tmp.path().join("snapshots").display(),
        root = root.display(),
        home = home.display(),
    ))
    .unwrap()
}

pub fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_with_sources(&tmp);

    let store = Arc::new(LineageStore::open_in_memory().unwrap());
    let snapshots = Arc::new(MemorySnapshots::new(ts("20260814-010000")));
    snapshots.set_contents("root", b"root subvolume payload".repeat(512));
    snapshots.set_contents("home", b"home subvolume payload".repeat(512));

    let remote_state = Arc::new(MemoryState::default());
    let key_material = random_bytes(32);

    let controller = Arc::new(
        RunController::with_parts(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&snapshots) as Arc<dyn SnapshotSource>,
            Arc::new(MemoryConnect(Arc::clone(&remote_state))),
            key_material.clone(),
        )
        .with_clock(test_clock()),
    );

    Fixture {
        controller,
        config,
        store,
        snapshots,
        remote_state,
        key_material,
        _tmp: tmp,
    }
}

/// Starts a run and blocks until it finishes, asserting the outcome.
pub fn run_to_completion(
    fixture: &Fixture,
    mode: Option<ArchiveKind>,
    force_full: bool,
) -> vbak_common::lineage::RunOutcome {
    fixture
        .controller
        .start(mode, force_full, &[])
        .expect("run refused");

    fixture.controller.wait().expect("no run to wait for")
}

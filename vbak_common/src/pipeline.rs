// vbak_common is the main vbak library implementing the backup engine logic.
// Copyright (C) 2026  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::archive::{ArchiveKind, ArchiveName};
use crate::lineage::{LineageRecord, LineageStore};
use crate::remote::RemoteChannel;
use crate::snapshot::{Snapshot, SnapshotSource};
use crate::stream::{CompressAlgo, CompressWriter, EncryptWriter, CHUNKSIZE};
use crate::{PipelineError, SnapshotError};

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How many chunks may be in flight between two neighboring stages.
pub const PIPELINE_DEPTH: usize = 8;

/// Minimum interval between two progress log lines.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// A `CancelToken` signals cooperative cancellation to a running transfer.
/// Stages observe it between chunks.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Reports whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The lifecycle stage of the transfer a progress sample belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Creating the local snapshot.
    Snapshot,
    /// Streaming data to the archival host.
    Stream,
    /// Verifying the renamed remote object.
    Verify,
    /// Committing the record to the lineage store.
    Commit,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Stream => "stream",
            Self::Verify => "verify",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `ProgressSample` is a point-in-time description of a running transfer.
/// `bytes_in` counts snapshot stream bytes read, `bytes_out` encrypted
/// bytes written to the archival host. Both are monotonic within a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressSample {
    /// The subvolume currently being processed.
    pub subvol: String,
    /// The lifecycle stage of the current transfer.
    pub stage: Stage,
    /// Bytes read from the snapshot stream so far.
    pub bytes_in: u64,
    /// Bytes written to the archival host so far.
    pub bytes_out: u64,
    /// Time elapsed since the run started.
    pub since_start: Duration,
}

struct ProgressState {
    subvol: String,
    stage: Stage,
    last_logged: Instant,
}

/// Run-scoped progress counters shared between the pipeline stages
/// and the status surface. Byte counters never reset within a run.
pub struct Progress {
    state: Mutex<ProgressState>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    started: Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProgressState {
                subvol: String::new(),
                stage: Stage::Snapshot,
                last_logged: Instant::now(),
            }),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Marks the subvolume and stage subsequent samples belong to.
    pub fn begin(&self, subvol: &str, stage: Stage) {
        let mut state = self.state.lock().unwrap();
        state.subvol = subvol.to_string();
        state.stage = stage;
    }

    /// Advances the lifecycle stage of the current transfer.
    pub fn set_stage(&self, stage: Stage) {
        self.state.lock().unwrap().stage = stage;
    }

    fn add_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn add_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Returns the current sample.
    pub fn sample(&self) -> ProgressSample {
        let state = self.state.lock().unwrap();

        ProgressSample {
            subvol: state.subvol.clone(),
            stage: state.stage,
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            since_start: self.started.elapsed(),
        }
    }

    /// Emits a progress log line, rate-limited to a few per second.
    fn maybe_log(&self) {
        let mut state = self.state.lock().unwrap();
        if state.last_logged.elapsed() < PROGRESS_INTERVAL {
            return;
        }
        state.last_logged = Instant::now();

        debug!(
            "{}: {} {} B in, {} B out",
            state.subvol,
            state.stage,
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
        );
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

/// A `ChunkWriter` adapts the [`Write`] side of a stage
/// to the bounded chunk channel feeding the next stage.
struct ChunkWriter {
    tx: SyncSender<Vec<u8>>,
    buf: Vec<u8>,
}

impl ChunkWriter {
    fn new(tx: SyncSender<Vec<u8>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNKSIZE),
        }
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);

        while self.buf.len() >= CHUNKSIZE {
            let chunk: Vec<u8> = self.buf.drain(..CHUNKSIZE).collect();
            self.tx
                .send(chunk)
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let chunk = std::mem::take(&mut self.buf);
            self.tx
                .send(chunk)
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        }

        Ok(())
    }
}

/// Maps stage-local I/O errors to pipeline errors, turning the
/// broken-pipe artifacts of a torn-down neighbor stage into the
/// secondary [`PipelineError::ChannelClosed`].
fn stage_error(e: io::Error) -> PipelineError {
    match e.kind() {
        io::ErrorKind::BrokenPipe => PipelineError::ChannelClosed,
        _ => PipelineError::IoError(e),
    }
}

/// A `Pipeline` transfers single snapshots to the archival host:
/// snapshot stream, compressor, encryptor and remote writer run
/// concurrently, joined by bounded chunk channels.
pub struct Pipeline<'a> {
    pub snapshots: &'a dyn SnapshotSource,
    pub remote: &'a dyn RemoteChannel,
    pub store: &'a LineageStore,
    pub key_material: &'a [u8],
    pub compress: CompressAlgo,
    pub compress_level: i32,
    pub base_path: &'a str,
    pub client_id: &'a str,
}

impl Pipeline<'_> {
    /// Transfers one snapshot as an archive of the requested kind,
    /// committing it to the lineage store on success.
    ///
    /// On any failure the temporary remote object is deleted and
    /// no lineage record is left behind.
    pub fn ship(
        &self,
        kind: ArchiveKind,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
        cancel: &CancelToken,
        progress: &Progress,
    ) -> Result<LineageRecord, PipelineError> {
        if kind == ArchiveKind::Incremental && parent.is_none() {
            return Err(PipelineError::MissingParent(snapshot.subvol().to_string()));
        }
        let parent = match kind {
            ArchiveKind::Full => None,
            ArchiveKind::Incremental => parent,
        };

        let name = ArchiveName {
            subvol: snapshot.subvol().to_string(),
            taken: snapshot.taken(),
            parent: parent.map(|parent| parent.taken()),
            compress: self.compress,
        };
        let remote_path = name.remote_path(self.base_path, self.client_id);

        if self.remote.exists(&remote_path)? {
            return Err(PipelineError::RemoteConflict(remote_path));
        }

        self.remote.ensure_dir(parent_dir(&remote_path))?;

        // No byte has been streamed yet, a transient remote fault
        // may still be retried once.
        let part = match self.remote.create_part(&remote_path) {
            Ok(part) => part,
            Err(e) => {
                warn!("{}: retrying remote open after error: {}", remote_path, e);
                thread::sleep(Duration::from_millis(500));
                self.remote.create_part(&remote_path)?
            }
        };

        let stream = self.snapshots.send_stream(snapshot, parent)?;

        progress.begin(snapshot.subvol(), Stage::Stream);

        match self.pump(stream, part, cancel, progress) {
            Ok((bytes_written, digest)) => {
                progress.set_stage(Stage::Verify);

                if let Err(e) = self.remote.promote(&remote_path) {
                    let _ = self.remote.discard_part(&remote_path);
                    return Err(e.into());
                }

                if !self.remote.verify_object(&remote_path, bytes_written)? {
                    let _ = self.remote.delete(&remote_path);
                    return Err(PipelineError::VerifyFailed(remote_path));
                }

                progress.set_stage(Stage::Commit);

                let record = LineageRecord {
                    subvol: name.subvol.clone(),
                    taken: name.taken,
                    kind,
                    parent_taken: name.parent,
                    remote_path: remote_path.clone(),
                    bytes_written,
                    digest,
                };

                if let Err(e) = self.store.record_commit(&record) {
                    let _ = self.remote.delete(&remote_path);
                    return Err(e.into());
                }

                Ok(record)
            }
            Err(e) => {
                let _ = self.remote.discard_part(&remote_path);
                Err(e)
            }
        }
    }

    /// Pumps the snapshot stream through compression and encryption
    /// into the remote writer, returning the encrypted byte count
    /// and its hex-encoded SHA-256 digest.
    fn pump(
        &self,
        mut stream: Box<dyn Read + Send>,
        mut part: Box<dyn Write + Send>,
        cancel: &CancelToken,
        progress: &Progress,
    ) -> Result<(u64, String), PipelineError> {
        let (comp_tx, comp_rx) = sync_channel::<Vec<u8>>(PIPELINE_DEPTH);
        let (enc_tx, enc_rx) = sync_channel::<Vec<u8>>(PIPELINE_DEPTH);
        let (out_tx, out_rx) = sync_channel::<Vec<u8>>(PIPELINE_DEPTH);

        let compress = self.compress;
        let compress_level = self.compress_level;
        let key_material = self.key_material;

        let (reader_res, comp_res, enc_res, writer_res) = thread::scope(|s| {
            let reader = s.spawn(move || -> Result<(), PipelineError> {
                loop {
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }

                    let mut chunk = vec![0; CHUNKSIZE];
                    let n = stream
                        .read(&mut chunk)
                        .map_err(|e| PipelineError::Snapshot(SnapshotError::IoError(e)))?;
                    if n == 0 {
                        // Dropping the sender is the EOF signal downstream.
                        return Ok(());
                    }
                    chunk.truncate(n);

                    progress.add_in(n);
                    comp_tx
                        .send(chunk)
                        .map_err(|_| PipelineError::ChannelClosed)?;
                }
            });

            let compressor = s.spawn(move || -> Result<(), PipelineError> {
                let mut compressor =
                    CompressWriter::new(compress, compress_level, ChunkWriter::new(enc_tx))?;

                for chunk in comp_rx {
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }

                    compressor.write_all(&chunk).map_err(stage_error)?;
                }

                if cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }

                let mut chunks = compressor.finish().map_err(stage_error)?;
                chunks.flush().map_err(stage_error)?;
                Ok(())
            });

            let encryptor = s.spawn(move || -> Result<(), PipelineError> {
                let mut encryptor =
                    EncryptWriter::new(ChunkWriter::new(out_tx), key_material)
                        .map_err(stage_error)?;

                for chunk in enc_rx {
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }

                    encryptor.write_all(&chunk).map_err(stage_error)?;
                }

                if cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }

                // `finish` flushes the chunk writer, closing the channel.
                encryptor.finish().map_err(stage_error)?;
                Ok(())
            });

            let writer = s.spawn(move || -> Result<(u64, String), PipelineError> {
                let mut hasher = Sha256::new();
                let mut bytes_written = 0u64;

                for chunk in out_rx {
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }

                    part.write_all(&chunk)?;
                    hasher.update(&chunk);
                    bytes_written += chunk.len() as u64;

                    progress.add_out(chunk.len());
                    progress.maybe_log();
                }

                part.flush()?;
                Ok((bytes_written, hex::encode(hasher.finalize())))
            });

            (
                reader.join().expect("snapshot reader stage panicked"),
                compressor.join().expect("compressor stage panicked"),
                encryptor.join().expect("encryptor stage panicked"),
                writer.join().expect("remote writer stage panicked"),
            )
        });

        let (writer_out, writer_err) = match writer_res {
            Ok(out) => (Some(out), None),
            Err(e) => (None, Some(e)),
        };

        // The first fatal error wins. Torn-channel artifacts are
        // secondary symptoms of whichever stage failed first.
        let mut fatal = None;
        let mut cancelled = false;
        for e in [reader_res.err(), comp_res.err(), enc_res.err(), writer_err] {
            match e {
                Some(PipelineError::Cancelled) => cancelled = true,
                Some(PipelineError::ChannelClosed) => {}
                Some(e) => fatal = fatal.or(Some(e)),
                None => {}
            }
        }

        if let Some(e) = fatal {
            Err(e)
        } else if cancelled {
            Err(PipelineError::Cancelled)
        } else {
            writer_out.ok_or(PipelineError::ChannelClosed)
        }
    }
}

/// Returns the directory part of a remote path.
fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

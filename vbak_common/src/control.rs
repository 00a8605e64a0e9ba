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

use crate::archive::ArchiveKind;
use crate::lineage::{LineageRecord, Run, RunOutcome};
use crate::pipeline::ProgressSample;
use crate::restore::RestoreDescriptor;
use crate::ControlError;

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

/// Default location of the control socket served by `vbakd`.
pub const SOCKET_PATH: &str = "/run/vbakd.sock";

/// A control request sent from `vbak` (or the external UI) to `vbakd`.
///
/// One request is answered by exactly one [`Response`] per connection.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Start a new run. Answered by [`Response::Started`].
    StartBackup {
        /// The requested mode. The engine may upgrade incremental
        /// requests to full transfers per subvolume.
        mode: Option<ArchiveKind>,
        /// Force full transfers for every subvolume.
        force_full: bool,
        /// Limit the run to these subvolumes.
        /// An empty list selects all configured subvolumes.
        subvolumes: Vec<String>,
    },
    /// Cancel the active run, if any. Answered by [`Response::Cancelled`].
    CancelBackup,
    /// Query the active or most recent run. Answered by [`Response::Status`].
    BackupStatus,
    /// Page through the run history. Answered by [`Response::Runs`].
    ListRuns {
        limit: u32,
        offset: u32,
        status: Option<RunOutcome>,
    },
    /// List archive months, or the archives of one month.
    /// Answered by [`Response::Archives`].
    BrowseArchives { month: Option<String> },
    /// Run the retention reaper outside a run.
    /// Answered by [`Response::Pruned`].
    Prune,
    /// Restore a subvolume chain into a target directory.
    /// Answered by [`Response::Restored`] once complete.
    StartRestore {
        /// The subvolume to restore.
        subvol: String,
        /// The snapshot timestamp to restore to.
        /// The latest committed archive is used if unset.
        at: Option<NaiveDateTime>,
        /// The directory to receive the chain into.
        target: PathBuf,
    },
}

/// A control response sent from `vbakd` back to the requester.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    /// A run was started.
    Started(RunDescriptor),
    /// The cancellation request was acknowledged.
    Cancelled,
    /// The active or most recent run, if any run happened yet.
    Status(Option<StatusReport>),
    /// A page of the run history.
    Runs(Vec<Run>),
    /// A listing of the committed archives.
    Archives(ArchiveListing),
    /// A retention pass completed.
    Pruned,
    /// A restore completed.
    Restored(RestoreDescriptor),
    /// The request failed.
    Error(String),
}

/// A `RunDescriptor` identifies a run and its current outcome.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunDescriptor {
    pub run_id: i64,
    pub started_at: NaiveDateTime,
    pub mode: ArchiveKind,
    pub outcome: RunOutcome,
}

/// A `StatusReport` combines a run descriptor
/// with the latest progress sample.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub descriptor: RunDescriptor,
    pub progress: Option<ProgressSample>,
}

/// The result of browsing the archive namespace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ArchiveListing {
    /// All month buckets with committed archives, newest first.
    Months(Vec<String>),
    /// The committed archives of one month, oldest first.
    Entries(Vec<LineageRecord>),
}

/// Writes one control message to the stream.
pub fn send_message<M: Serialize>(stream: &mut UnixStream, message: &M) -> Result<(), ControlError> {
    bincode::serialize_into(&mut *stream, message)?;
    stream.flush()?;

    Ok(())
}

/// Reads one control message from the stream.
pub fn recv_message<M: for<'de> Deserialize<'de>>(
    stream: &mut UnixStream,
) -> Result<M, ControlError> {
    Ok(bincode::deserialize_from(stream)?)
}

/// Performs one request/response round trip against the daemon socket.
pub fn request(socket_path: &Path, request: &Request) -> Result<Response, ControlError> {
    let mut stream = UnixStream::connect(socket_path)?;

    send_message(&mut stream, request)?;
    recv_message(&mut stream)
}

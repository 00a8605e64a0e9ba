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

use crate::archive::ArchiveId;
use crate::snapshot::Snapshot;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A `SnapshotParseError` indicates a failure parsing a `Snapshot`
/// from a snapshot directory entry.
#[derive(Debug, Error)]
pub enum SnapshotParseError {
    /// The name is too short to contain a subvolume name and a timestamp.
    #[error("Snapshot name \"{0}\" is too short")]
    TooShort(String),
    /// The subvolume name and the timestamp are not separated by a dash.
    #[error("Snapshot name \"{0}\" is missing the subvolume separator")]
    MissingSeparator(String),

    /// When parsing from a [`std::path::Path`] this error indicates
    /// that [`std::path::Path::file_name`] returned `None`
    /// which happens when the last part of the path is the double dot.
    #[error("Snapshot path ends in ..")]
    NoFileName,

    /// When parsing from a [`std::path::Path`] this error indicates
    /// that the return value of [`std::path::Path::file_name`]
    /// could not be converted to a regular string
    /// due to it containing invalid Unicode.
    #[error("Snapshot path contains invalid unicode")]
    InvalidUnicode,

    /// The timestamp of when the snapshot was taken
    /// does not follow the `%Y%m%d-%H%M%S` format.
    #[error("Unable to parse capture timestamp: {0}")]
    MalformedTimeTaken(#[from] chrono::ParseError),
}

/// An `ArchiveParseError` indicates a failure parsing an archive file name.
#[derive(Debug, Error)]
pub enum ArchiveParseError {
    /// The name is missing the subvolume name or the timestamp.
    #[error("Incomplete archive name \"{0}\"")]
    Incomplete(String),
    /// The compression or encryption extension is missing or unknown.
    #[error("Unknown archive extension in \"{0}\"")]
    UnknownExtension(String),

    /// A timestamp does not follow the `%Y%m%d-%H%M%S` format.
    #[error("Unable to parse archive timestamp: {0}")]
    MalformedTimestamp(#[from] chrono::ParseError),
}

/// A `SnapshotError` indicates a failure creating, enumerating,
/// deleting or serializing local snapshots.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// A btrfs command failed to execute correctly.
    #[error("Btrfs command execution failed")]
    BtrfsCmd,
    /// A btrfs command did not provide a stdin file.
    #[error("Btrfs command does not have stdin")]
    NoBtrfsInput,
    /// A btrfs command did not provide a stdout file.
    #[error("Btrfs command does not have stdout")]
    NoBtrfsOutput,

    /// A snapshot with the same identifier already exists.
    #[error("A snapshot with identifier \"{0}\" already exists")]
    SnapshotExists(Snapshot),
    /// The source path of a subvolume does not exist.
    #[error("Subvolume source path {0:?} does not exist")]
    SourceMissing(PathBuf),
    /// A snapshot needed as the base of a relative stream is gone.
    #[error("Snapshot \"{0}\" does not exist locally")]
    NoSuchSnapshot(Snapshot),

    /// There was a failure parsing a `Snapshot`.
    #[error("Failed to parse snapshot identifier")]
    SnapshotParseError(#[from] SnapshotParseError),

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// A `SystemError` indicates a problem with the local configuration,
/// data directory or key material.
#[derive(Debug, Error)]
pub enum SystemError {
    /// A configuration file already exists on this machine.
    #[error("Agent is already initialized")]
    ConfigExists,
    /// No configuration file exists on this machine.
    #[error("Agent is not initialized")]
    ConfigUninit,
    /// The permissions on the configuration file or keyfile are insecure.
    #[error("Insecure permissions on {0:?} (limit access to the owner!)")]
    InsecurePerms(PathBuf),
    /// The keyfile has an unexpected size and cannot be used.
    #[error("Keyfile {0:?} is truncated or corrupt")]
    BadKeyfile(PathBuf),

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// A `toml::ser::Error` TOML serialization error occured.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    /// A `toml::de::Error` TOML deserialization error occured.
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

/// A `LineageError` indicates a violation of the archive lineage rules
/// or a failure of the underlying store.
#[derive(Debug, Error)]
pub enum LineageError {
    /// A committed archive with the same subvolume and timestamp already exists.
    #[error("Archive \"{0}\" is already committed")]
    Duplicate(ArchiveId),
    /// An incremental archive names a parent that is not committed.
    #[error("Parent \"{0}\" of incremental archive is not committed")]
    OrphanIncremental(ArchiveId),
    /// An incremental archive does not precede its parent in time.
    #[error("Archive \"{0}\" does not succeed its parent in time")]
    ParentNotOlder(ArchiveId),
    /// An incremental archive is missing its parent timestamp.
    #[error("Incremental archive \"{0}\" has no parent timestamp")]
    MissingParentTimestamp(ArchiveId),

    /// No committed archive exists for the requested subvolume and timestamp.
    #[error("No committed archive \"{0}\" exists")]
    NoSuchArchive(ArchiveId),
    /// The parent chain of an archive cannot be resolved back to a full archive.
    #[error("Broken parent chain at \"{0}\"")]
    BrokenChain(ArchiveId),
    /// No run with the requested identifier exists.
    #[error("No run with id {0} exists")]
    NoSuchRun(i64),

    /// A failure of the underlying SQLite store.
    #[error("Lineage store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A `RemoteError` indicates a failure on the connection
/// to the archival host or in a remote file operation.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// None of the resolved addresses of the archival host accepted a connection.
    #[error("No remote address accepted the connection")]
    NoAddrs,
    /// The remote object store does not contain the requested object.
    #[error("No remote object at \"{0}\"")]
    NoSuchObject(String),

    /// An SSH transport or SFTP protocol error occured.
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),
    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// A `PipelineError` indicates a failure of a single archive transfer.
/// It is fatal for that archive but not for the run as a whole.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// An incremental transfer was requested without a parent archive.
    #[error("Incremental transfer of \"{0}\" has no parent")]
    MissingParent(String),
    /// The final remote path already exists and must not be overwritten.
    #[error("Remote object \"{0}\" already exists")]
    RemoteConflict(String),
    /// The transfer was cancelled cooperatively.
    #[error("Transfer cancelled")]
    Cancelled,
    /// A pipeline stage terminated because its neighbor stage went away.
    /// The root cause is reported by the stage that failed first.
    #[error("Pipeline stage channel closed")]
    ChannelClosed,
    /// The remote object failed post-transfer verification.
    #[error("Remote object \"{0}\" failed verification")]
    VerifyFailed(String),

    /// The snapshot serialization stream failed.
    #[error("Snapshot stream error: {0}")]
    Snapshot(#[from] SnapshotError),
    /// A remote channel operation failed.
    #[error("Remote channel error: {0}")]
    Remote(#[from] RemoteError),
    /// Recording the transfer in the lineage store failed.
    #[error("Lineage error: {0}")]
    Lineage(#[from] LineageError),
    /// The encryption or decryption of stream data failed.
    #[error("Encryption or decryption failure")]
    ChaCha20Poly1305(#[from] chacha20poly1305::Error),
    /// A remote object name does not follow the archive naming scheme.
    #[error("Failed to parse archive name")]
    ArchiveParseError(#[from] ArchiveParseError),

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// An `EngineError` indicates a failure of the run controller
/// or of restore orchestration.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Another run is still active.
    #[error("Another run is already active")]
    AlreadyRunning,
    /// The requested subvolume is not configured.
    #[error("Subvolume \"{0}\" is not configured")]
    UnknownSubvolume(String),
    /// A run was requested without any subvolumes to process.
    #[error("No subvolumes selected")]
    NoSubvolumes,

    /// A local configuration or key material problem.
    #[error("Local system error: {0}")]
    System(#[from] SystemError),
    /// The archival host is unreachable or rejected the session.
    #[error("Remote channel error: {0}")]
    Remote(#[from] RemoteError),
    /// The lineage store failed or an invariant was violated.
    #[error("Lineage error: {0}")]
    Lineage(#[from] LineageError),
    /// A snapshot operation failed.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    /// An archive transfer failed.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// A `ControlError` indicates a failure on the local control socket.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The daemon reported an error executing the request.
    #[error("Daemon error: {0}")]
    Daemon(String),
    /// The daemon sent a response that does not match the request.
    #[error("Unexpected response to control request")]
    UnexpectedResponse,

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    /// A bincode (de)serialization error occured.
    #[error("Bincode (de)serialization error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),
}

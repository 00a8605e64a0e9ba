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

use crate::{SnapshotError, SnapshotParseError};

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

/// The timestamp format used in snapshot and archive names.
pub const TIMESTAMP_FMT: &str = "%Y%m%d-%H%M%S";

/// A `Snapshot` uniquely identifies a read-only point-in-time image
/// of a subvolume via the subvolume name and capture timestamp (UTC).
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    subvol: String,
    taken: NaiveDateTime,
}

impl Snapshot {
    /// Constructs a new `Snapshot` identifier from its parts.
    pub fn new(subvol: String, taken: NaiveDateTime) -> Self {
        Self { subvol, taken }
    }

    /// Returns a `Snapshot` of the subvolume captured at the current time,
    /// truncated to second precision.
    pub fn now(subvol: String) -> Self {
        let taken = Utc::now()
            .naive_utc()
            .with_nanosecond(0)
            .expect("zero nanoseconds is always in range");

        Self { subvol, taken }
    }

    /// Returns the name of the subvolume the `Snapshot` represents.
    pub fn subvol(&self) -> &str {
        &self.subvol
    }

    /// Returns the timestamp of when the `Snapshot` was taken.
    pub fn taken(&self) -> NaiveDateTime {
        self.taken
    }

    /// Converts the `Snapshot` to its local storage location,
    /// i.e. a member of the configured snapshot directory.
    pub fn local_path(&self, snapshot_dir: &Path) -> PathBuf {
        snapshot_dir.join(self.to_string())
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.subvol, self.taken.format(TIMESTAMP_FMT))
    }
}

impl TryFrom<&str> for Snapshot {
    type Error = SnapshotParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        // The timestamp is the fixed-width tail of the name. The subvolume
        // name may itself contain dashes, so splitting on dashes is unsound.
        const TS_LEN: usize = "00000000-000000".len();

        if value.len() < TS_LEN + 2 {
            return Err(SnapshotParseError::TooShort(value.to_string()));
        }

        let (head, ts) = value.split_at(value.len() - TS_LEN);
        let subvol = head
            .strip_suffix('-')
            .ok_or_else(|| SnapshotParseError::MissingSeparator(value.to_string()))?;

        Ok(Self {
            subvol: subvol.to_string(),
            taken: NaiveDateTime::parse_from_str(ts, TIMESTAMP_FMT)?,
        })
    }
}

impl TryFrom<&Path> for Snapshot {
    type Error = SnapshotParseError;

    fn try_from(value: &Path) -> Result<Self, Self::Error> {
        Self::try_from(
            value
                .file_name()
                .ok_or(SnapshotParseError::NoFileName)?
                .to_str()
                .ok_or(SnapshotParseError::InvalidUnicode)?,
        )
    }
}

/// A `SnapshotSource` provides the copy-on-write snapshot primitives
/// of the client filesystem. Narrow by design so that tests
/// can substitute a deterministic in-memory implementation.
pub trait SnapshotSource: Send + Sync {
    /// Creates a new read-only snapshot of the subvolume rooted at `source_path`.
    fn create(&self, subvol: &str, source_path: &Path) -> Result<Snapshot, SnapshotError>;

    /// Returns all local snapshots of the specified subvolume,
    /// ordered by timestamp descending.
    fn list(&self, subvol: &str) -> Result<Vec<Snapshot>, SnapshotError>;

    /// Deletes the specified snapshot from local storage.
    fn delete(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;

    /// Returns the serialized send stream of a snapshot,
    /// relative to `parent` if one is provided.
    ///
    /// The stream is finite and non-restartable.
    fn send_stream(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
    ) -> Result<Box<dyn Read + Send>, SnapshotError>;
}

/// A `BtrfsSnapshots` manages read-only btrfs snapshots
/// below a single snapshot directory.
pub struct BtrfsSnapshots {
    snapshot_dir: PathBuf,
}

impl BtrfsSnapshots {
    /// Returns a new manager operating below the provided snapshot directory.
    pub fn new(snapshot_dir: PathBuf) -> Self {
        Self { snapshot_dir }
    }

    /// Returns the local path of the specified snapshot.
    pub fn path_of(&self, snapshot: &Snapshot) -> PathBuf {
        snapshot.local_path(&self.snapshot_dir)
    }
}

impl SnapshotSource for BtrfsSnapshots {
    fn create(&self, subvol: &str, source_path: &Path) -> Result<Snapshot, SnapshotError> {
        if !source_path.exists() {
            return Err(SnapshotError::SourceMissing(source_path.to_path_buf()));
        }

        let snapshot = Snapshot::now(subvol.to_string());
        let dst = self.path_of(&snapshot);

        if dst.exists() {
            return Err(SnapshotError::SnapshotExists(snapshot));
        }

        if !Command::new("btrfs")
            .arg("subvolume")
            .arg("snapshot")
            .arg("-r")
            .arg(source_path)
            .arg(dst)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?
            .wait()?
            .success()
        {
            return Err(SnapshotError::BtrfsCmd);
        }

        Ok(snapshot)
    }

    fn list(&self, subvol: &str) -> Result<Vec<Snapshot>, SnapshotError> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.snapshot_dir)? {
            let snapshot = Snapshot::try_from(&*entry?.path())?;

            if snapshot.subvol() == subvol {
                snapshots.push(snapshot);
            }
        }

        snapshots.sort_by_key(|snapshot| std::cmp::Reverse(snapshot.taken()));
        Ok(snapshots)
    }

    fn delete(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if !Command::new("btrfs")
            .arg("subvolume")
            .arg("delete")
            .arg(self.path_of(snapshot))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?
            .wait()?
            .success()
        {
            return Err(SnapshotError::BtrfsCmd);
        }

        Ok(())
    }

    fn send_stream(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
    ) -> Result<Box<dyn Read + Send>, SnapshotError> {
        let src = self.path_of(snapshot);
        if !src.exists() {
            return Err(SnapshotError::NoSuchSnapshot(snapshot.clone()));
        }

        if let Some(parent) = parent {
            if !self.path_of(parent).exists() {
                return Err(SnapshotError::NoSuchSnapshot(parent.clone()));
            }
        }

        let mut cmd = Command::new("btrfs");
        let cmd = cmd.arg("send").arg("--compressed-data");
        let cmd = if let Some(parent) = parent {
            cmd.arg("-p").arg(self.path_of(parent))
        } else {
            cmd
        }
        .arg(src)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

        Ok(Box::new(
            cmd.stdout.ok_or(SnapshotError::NoBtrfsOutput)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_name_roundtrip() {
        let taken = NaiveDate::from_ymd_opt(2026, 8, 1)
            .unwrap()
            .and_hms_opt(4, 30, 0)
            .unwrap();
        let snapshot = Snapshot::new("root".to_string(), taken);

        assert_eq!(snapshot.to_string(), "root-20260801-043000");
        assert_eq!(Snapshot::try_from("root-20260801-043000").unwrap(), snapshot);
    }

    #[test]
    fn snapshot_name_with_dashes() {
        let snapshot = Snapshot::try_from("var-log-20260801-043000").unwrap();

        assert_eq!(snapshot.subvol(), "var-log");
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(Snapshot::try_from("root").is_err());
        assert!(Snapshot::try_from("root_20260801-043000").is_err());
        assert!(Snapshot::try_from("root-20260801-0430zz").is_err());
    }
}

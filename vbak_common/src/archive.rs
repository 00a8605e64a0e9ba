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

use crate::snapshot::TIMESTAMP_FMT;
use crate::stream::CompressAlgo;
use crate::ArchiveParseError;

use std::fmt;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

/// File name extension of the encrypted archive format.
pub const CRYPT_EXT: &str = "vbk";

/// Name of the liveness marker file below the client's remote directory.
pub const VERIFICATION_FILE: &str = ".verification";

/// Whether an archive holds a complete subvolume stream
/// or one relative to a parent snapshot.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    /// A self-contained stream of the whole subvolume.
    Full,
    /// A stream relative to a parent snapshot.
    Incremental,
}

impl ArchiveKind {
    /// Returns the remote directory name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An `ArchiveId` uniquely identifies an archive of one client
/// via the subvolume name and snapshot timestamp.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct ArchiveId {
    /// The subvolume the archive captures.
    pub subvol: String,
    /// The timestamp of the captured snapshot (UTC, second precision).
    pub taken: NaiveDateTime,
}

impl ArchiveId {
    /// Constructs a new `ArchiveId` from its parts.
    pub fn new(subvol: String, taken: NaiveDateTime) -> Self {
        Self { subvol, taken }
    }

    /// Returns the month bucket (`YYYYMM`) the archive belongs to.
    pub fn month_bucket(&self) -> String {
        self.taken.format("%Y%m").to_string()
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.subvol, self.taken.format(TIMESTAMP_FMT))
    }
}

/// An `ArchiveName` is the parsed form of a remote archive file name.
/// It round-trips through [`fmt::Display`] and [`TryFrom<&str>`]
/// and determines the archive's location in the remote namespace.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ArchiveName {
    /// The subvolume the archive captures.
    pub subvol: String,
    /// The timestamp of the captured snapshot (UTC, second precision).
    pub taken: NaiveDateTime,
    /// The parent snapshot timestamp for incremental archives.
    pub parent: Option<NaiveDateTime>,
    /// The compression algorithm recorded in the name.
    pub compress: CompressAlgo,
}

impl ArchiveName {
    /// Returns the archive kind implied by the presence of a parent.
    pub fn kind(&self) -> ArchiveKind {
        match self.parent {
            Some(_) => ArchiveKind::Incremental,
            None => ArchiveKind::Full,
        }
    }

    /// Returns the identifier of the archive.
    pub fn id(&self) -> ArchiveId {
        ArchiveId::new(self.subvol.clone(), self.taken)
    }

    /// Returns the month bucket (`YYYYMM`) the archive belongs to.
    pub fn month_bucket(&self) -> String {
        self.id().month_bucket()
    }

    /// Converts the `ArchiveName` to its full remote storage location
    /// below the client's directory on the archival host:
    /// `<base_path>/<client_id>/<YYYYMM>/<kind>/<file name>`.
    pub fn remote_path(&self, base_path: &str, client_id: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            client_root(base_path, client_id),
            self.month_bucket(),
            self.kind(),
            self
        )
    }
}

impl fmt::Display for ArchiveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}",
            self.subvol,
            self.taken.format(TIMESTAMP_FMT)
        )?;

        if let Some(parent) = self.parent {
            write!(f, "__from_{}", parent.format(TIMESTAMP_FMT))?;
        }

        write!(f, ".{}.{}", self.compress.extension(), CRYPT_EXT)
    }
}

impl TryFrom<&str> for ArchiveName {
    type Error = ArchiveParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let stem = value
            .strip_suffix(&format!(".{}", CRYPT_EXT))
            .ok_or_else(|| ArchiveParseError::UnknownExtension(value.to_string()))?;

        let (stem, ext) = stem
            .rsplit_once('.')
            .ok_or_else(|| ArchiveParseError::UnknownExtension(value.to_string()))?;
        let compress = CompressAlgo::from_extension(ext)
            .ok_or_else(|| ArchiveParseError::UnknownExtension(value.to_string()))?;

        let (head, parent) = match stem.split_once("__from_") {
            Some((head, parent)) => (
                head,
                Some(NaiveDateTime::parse_from_str(parent, TIMESTAMP_FMT)?),
            ),
            None => (stem, None),
        };

        let (subvol, taken) = head
            .rsplit_once('_')
            .ok_or_else(|| ArchiveParseError::Incomplete(value.to_string()))?;
        if subvol.is_empty() {
            return Err(ArchiveParseError::Incomplete(value.to_string()));
        }

        Ok(Self {
            subvol: subvol.to_string(),
            taken: NaiveDateTime::parse_from_str(taken, TIMESTAMP_FMT)?,
            parent,
            compress,
        })
    }
}

/// Returns the client's root directory in the remote namespace.
pub fn client_root(base_path: &str, client_id: &str) -> String {
    format!("{}/{}", base_path.trim_end_matches('/'), client_id)
}

/// Returns the remote location of the client's liveness marker file.
pub fn verification_path(base_path: &str, client_id: &str) -> String {
    format!("{}/{}", client_root(base_path, client_id), VERIFICATION_FILE)
}

/// Returns the remote directory holding archives of one kind in one month.
pub fn kind_dir(base_path: &str, client_id: &str, month: &str, kind: ArchiveKind) -> String {
    format!("{}/{}/{}", client_root(base_path, client_id), month, kind)
}

/// Returns the remote directory of one month bucket.
pub fn month_dir(base_path: &str, client_id: &str, month: &str) -> String {
    format!("{}/{}", client_root(base_path, client_id), month)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FMT).unwrap()
    }

    #[test]
    fn full_name_roundtrip() {
        let name = ArchiveName {
            subvol: "root".to_string(),
            taken: ts("20260801-043000"),
            parent: None,
            compress: CompressAlgo::Zstd,
        };

        assert_eq!(name.to_string(), "root_20260801-043000.zst.vbk");
        assert_eq!(ArchiveName::try_from("root_20260801-043000.zst.vbk").unwrap(), name);
        assert_eq!(name.kind(), ArchiveKind::Full);
    }

    #[test]
    fn incremental_name_roundtrip() {
        let name = ArchiveName {
            subvol: "home".to_string(),
            taken: ts("20260802-043000"),
            parent: Some(ts("20260801-043000")),
            compress: CompressAlgo::Gzip,
        };

        assert_eq!(
            name.to_string(),
            "home_20260802-043000__from_20260801-043000.gz.vbk"
        );
        assert_eq!(ArchiveName::try_from(name.to_string().as_str()).unwrap(), name);
        assert_eq!(name.kind(), ArchiveKind::Incremental);
    }

    #[test]
    fn remote_path_layout() {
        let name = ArchiveName {
            subvol: "root".to_string(),
            taken: ts("20260801-043000"),
            parent: None,
            compress: CompressAlgo::Zstd,
        };

        assert_eq!(
            name.remote_path("/srv/backups", "talos"),
            "/srv/backups/talos/202608/full/root_20260801-043000.zst.vbk"
        );
        assert_eq!(
            verification_path("/srv/backups", "talos"),
            "/srv/backups/talos/.verification"
        );
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(ArchiveName::try_from("root_20260801-043000").is_err());
        assert!(ArchiveName::try_from("root_20260801-043000.xz.vbk").is_err());
        assert!(ArchiveName::try_from("_20260801-043000.zst.vbk").is_err());
    }
}

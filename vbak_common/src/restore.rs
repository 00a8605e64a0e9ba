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

use crate::archive::{ArchiveId, ArchiveName};
use crate::lineage::{LineageRecord, LineageStore};
use crate::remote::RemoteChannel;
use crate::stream::{DecompressWriter, DecryptWriter, CHUNKSIZE};
use crate::{EngineError, LineageError, PipelineError, SnapshotError};

use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};

/// A `RestoreDescriptor` summarizes a completed restore.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RestoreDescriptor {
    /// The restored subvolume.
    pub subvol: String,
    /// The directory the chain was received into.
    pub target: PathBuf,
    /// The identifiers of the applied chain, full archive first.
    pub chain: Vec<ArchiveId>,
    /// The total encrypted bytes fetched from the archival host.
    pub bytes_fetched: u64,
}

/// Fetches one archive and writes its decrypted, decompressed
/// send stream into `sink`, returning the encrypted byte count.
pub fn restore_archive<W: Write>(
    remote: &dyn RemoteChannel,
    record: &LineageRecord,
    key_material: &[u8],
    sink: W,
) -> Result<u64, PipelineError> {
    let file_name = record
        .remote_path
        .rsplit_once('/')
        .map(|(_, name)| name)
        .unwrap_or(&record.remote_path);
    let name = ArchiveName::try_from(file_name)?;

    let mut reader = remote.open_read(&record.remote_path)?;

    let decompressor = DecompressWriter::new(name.compress, sink)?;
    let mut decryptor = DecryptWriter::new(decompressor, key_material.to_vec());

    let bytes_fetched = io::copy(&mut reader, &mut decryptor)?;
    decryptor.close()?;

    Ok(bytes_fetched)
}

/// A `Restorer` applies the inverse pipeline: it resolves the committed
/// chain of a subvolume and receives it link by link into a target
/// directory, reconstructing the subvolume tree.
pub struct Restorer<'a> {
    pub store: &'a LineageStore,
    pub remote: &'a dyn RemoteChannel,
    pub key_material: &'a [u8],
}

impl Restorer<'_> {
    /// Resolves the chain ending at the selected archive:
    /// the latest committed one, or the one at an explicit timestamp.
    ///
    /// Fails if any link of the chain is no longer committed;
    /// a partially reapable chain is never applied partially.
    pub fn plan(
        &self,
        subvol: &str,
        at: Option<NaiveDateTime>,
    ) -> Result<Vec<LineageRecord>, LineageError> {
        let target = match at {
            Some(taken) => taken,
            None => {
                self.store
                    .latest_committed(subvol)?
                    .ok_or_else(|| {
                        LineageError::NoSuchArchive(ArchiveId::new(
                            subvol.to_string(),
                            NaiveDateTime::MIN,
                        ))
                    })?
                    .taken
            }
        };

        self.store.chain_to(subvol, target)
    }

    /// Receives the chain into the target directory via the native
    /// receive primitive, one child process per link.
    pub fn restore_to_dir(
        &self,
        chain: &[LineageRecord],
        target: &Path,
    ) -> Result<RestoreDescriptor, EngineError> {
        let mut bytes_fetched = 0;

        for record in chain {
            info!("restoring {} into {}", record.id(), target.display());

            let mut child = Command::new("btrfs")
                .arg("receive")
                .arg(target)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(SnapshotError::IoError)?;

            let stdin = child.stdin.take().ok_or(SnapshotError::NoBtrfsInput)?;

            let result = restore_archive(
                self.remote,
                record,
                self.key_material,
                BufWriter::with_capacity(2 * CHUNKSIZE, stdin),
            );

            match result {
                Ok(bytes) => {
                    bytes_fetched += bytes;

                    if !child.wait().map_err(SnapshotError::IoError)?.success() {
                        return Err(SnapshotError::BtrfsCmd.into());
                    }
                }
                Err(e) => {
                    child.kill().ok();
                    child.wait().ok();
                    return Err(e.into());
                }
            }
        }

        Ok(RestoreDescriptor {
            subvol: chain
                .first()
                .map(|record| record.subvol.clone())
                .unwrap_or_default(),
            target: target.to_path_buf(),
            chain: chain.iter().map(LineageRecord::id).collect(),
            bytes_fetched,
        })
    }
}

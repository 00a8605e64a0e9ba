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

use crate::archive::{month_dir, ArchiveKind};
use crate::config::AgentConfig;
use crate::lineage::LineageStore;
use crate::remote::RemoteChannel;
use crate::snapshot::SnapshotSource;
use crate::EngineError;

use std::collections::HashSet;

use chrono::prelude::*;
use chrono::{Duration, Months};
use log::{info, warn};

/// A `Reaper` enforces snapshot and archive retention on both ends.
///
/// Reaping is best-effort and idempotent: failures are logged and never
/// fail the run that triggered them, and deletions always respect the
/// parent relationships of committed archives.
pub struct Reaper<'a> {
    pub config: &'a AgentConfig,
    pub store: &'a LineageStore,
    pub snapshots: &'a dyn SnapshotSource,
    pub remote: &'a dyn RemoteChannel,
}

impl Reaper<'_> {
    /// Runs the local snapshot pass and the remote archive pass.
    pub fn reap(&self, now_utc: NaiveDateTime) {
        if let Err(e) = self.reap_local(now_utc) {
            warn!("local snapshot retention failed: {}", e);
        }

        if let Err(e) = self.reap_remote(now_utc) {
            warn!("remote archive retention failed: {}", e);
        }
    }

    /// Deletes local snapshots older than `local_snapshot_days`,
    /// keeping every snapshot still needed as an incremental base.
    fn reap_local(&self, now_utc: NaiveDateTime) -> Result<(), EngineError> {
        let max_age = Duration::days(self.config.local_snapshot_days.into());

        for subvol in &self.config.subvolumes {
            let pinned = self.pinned_timestamps(&subvol.name)?;

            for snapshot in self.snapshots.list(&subvol.name)? {
                if now_utc - snapshot.taken() <= max_age {
                    continue;
                }

                if pinned.contains(&snapshot.taken()) {
                    info!("keeping expired snapshot {}, still an incremental base", snapshot);
                    continue;
                }

                info!("deleting expired snapshot {}", snapshot);
                self.snapshots.delete(&snapshot)?;
            }
        }

        Ok(())
    }

    /// Returns the snapshot timestamps of a subvolume that must survive:
    /// parents of committed archives with no fresher full archive,
    /// and the most recent committed archive itself
    /// (the base of the next incremental).
    fn pinned_timestamps(&self, subvol: &str) -> Result<HashSet<NaiveDateTime>, EngineError> {
        let mut pinned = HashSet::new();

        let last_full_taken = self
            .store
            .latest_full(subvol)?
            .map(|record| record.taken);

        for record in self.store.records_of(subvol)? {
            if let Some(parent_taken) = record.parent_taken {
                let released = matches!(last_full_taken, Some(full) if full > parent_taken);
                if !released {
                    pinned.insert(parent_taken);
                }
            }
        }

        if let Some(latest) = self.store.latest_committed(subvol)? {
            pinned.insert(latest.taken);
        }

        Ok(pinned)
    }

    /// Deletes expired month buckets and stale incrementals
    /// on the archival host, updating the lineage store to match.
    fn reap_remote(&self, now_utc: NaiveDateTime) -> Result<(), EngineError> {
        let cutoff_month = now_utc
            .date()
            .checked_sub_months(Months::new(self.config.months_to_keep))
            .map(|date| date.format("%Y%m").to_string());

        for month in self.store.months()? {
            let expired = matches!(&cutoff_month, Some(cutoff) if month < *cutoff);
            if !expired {
                continue;
            }

            if self.store.month_has_external_dependents(&month)? {
                warn!(
                    "keeping expired month bucket {}, later archives depend on it",
                    month
                );
                continue;
            }

            info!("deleting expired month bucket {}", month);
            self.remote.delete_dir(&month_dir(
                &self.config.remote_base_path,
                &self.config.client_id,
                &month,
            ))?;
            self.store.remove_month(&month)?;
        }

        let max_age = Duration::days(self.config.daily_incremental_days.into());

        for subvol in &self.config.subvolumes {
            // Newest first, so a fully expired chain tail
            // can be released link by link.
            for record in self.store.records_of(&subvol.name)?.into_iter().rev() {
                if record.kind != ArchiveKind::Incremental {
                    continue;
                }
                if now_utc - record.taken <= max_age {
                    continue;
                }

                if self.store.dependents(&record.subvol, record.taken)? > 0 {
                    info!(
                        "keeping expired incremental {}, later archives depend on it",
                        record.id()
                    );
                    continue;
                }

                info!("deleting expired incremental {}", record.id());
                self.remote.delete(&record.remote_path)?;
                self.store.remove(&record.subvol, record.taken)?;
            }
        }

        Ok(())
    }
}

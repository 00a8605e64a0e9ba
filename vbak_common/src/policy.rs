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
use crate::config::AgentConfig;
use crate::lineage::{LineageRecord, LineageStore};
use crate::snapshot::Snapshot;
use crate::LineageError;

use chrono::prelude::*;
use chrono::Duration;
use log::{info, warn};

/// A `Decision` is the per-subvolume result of run planning:
/// the archive kind and, for incrementals, the parent to stream against.
#[derive(Clone, Debug)]
pub struct Decision {
    /// The kind of archive to produce.
    pub kind: ArchiveKind,
    /// The committed archive the new one is relative to.
    /// Present iff `kind` is incremental.
    pub parent: Option<LineageRecord>,
    /// Whether an incremental was wanted but a full became necessary
    /// because the parent's local snapshot is gone.
    pub downgraded: bool,
}

impl Decision {
    fn full() -> Self {
        Self {
            kind: ArchiveKind::Full,
            parent: None,
            downgraded: false,
        }
    }
}

/// Decides whether the next archive of a subvolume is full or incremental
/// and selects the parent, independently per subvolume.
///
/// `local_snapshots` are the subvolume's snapshots currently on disk;
/// an incremental is only possible while the parent snapshot survives
/// locally, otherwise the decision silently falls back to a full archive.
///
/// The first-of-month trigger is evaluated against `today_local`,
/// the age checks against `now_utc`.
pub fn decide(
    config: &AgentConfig,
    store: &LineageStore,
    local_snapshots: &[Snapshot],
    subvol: &str,
    force_full: bool,
    now_utc: NaiveDateTime,
    today_local: NaiveDate,
) -> Result<Decision, LineageError> {
    if force_full {
        info!("{}: full archive forced by request", subvol);
        return Ok(Decision::full());
    }

    if today_local.day() == 1 {
        info!("{}: full archive due to first of month", subvol);
        return Ok(Decision::full());
    }

    let last_full = match store.latest_full(subvol)? {
        Some(last_full) => last_full,
        None => {
            info!("{}: no committed full archive yet", subvol);
            return Ok(Decision::full());
        }
    };

    if now_utc - last_full.taken > Duration::days(config.full_interval_days.into()) {
        info!(
            "{}: last full archive {} is older than {} days",
            subvol, last_full.taken, config.full_interval_days
        );
        return Ok(Decision::full());
    }

    if store.chain_length(subvol)? >= config.daily_incremental_days {
        info!(
            "{}: incremental chain reached {} links",
            subvol, config.daily_incremental_days
        );
        return Ok(Decision::full());
    }

    let parent = match store.find_parent_candidate(subvol, ArchiveKind::Incremental)? {
        Some(parent) => parent,
        None => return Ok(Decision::full()),
    };

    // A relative stream needs the parent snapshot on disk.
    let parent_snapshot_present = local_snapshots
        .iter()
        .any(|snapshot| snapshot.subvol() == subvol && snapshot.taken() == parent.taken);

    if !parent_snapshot_present {
        warn!(
            "{}: local snapshot of parent {} is gone, falling back to a full archive",
            subvol, parent.taken
        );
        return Ok(Decision {
            kind: ArchiveKind::Full,
            parent: None,
            downgraded: true,
        });
    }

    Ok(Decision {
        kind: ArchiveKind::Incremental,
        parent: Some(parent),
        downgraded: false,
    })
}

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

use crate::archive::{ArchiveId, ArchiveKind};
use crate::snapshot::TIMESTAMP_FMT;
use crate::LineageError;

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use chrono::prelude::*;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// A `LineageRecord` is the durable description of one committed archive.
///
/// The set of all records of a subvolume forms a forest: full archives
/// are roots, incremental archives point at their parent snapshot.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LineageRecord {
    /// The subvolume the archive captures.
    pub subvol: String,
    /// The timestamp of the captured snapshot (UTC, second precision).
    pub taken: NaiveDateTime,
    /// Whether the archive is full or incremental.
    pub kind: ArchiveKind,
    /// The parent snapshot timestamp, present iff the archive is incremental.
    pub parent_taken: Option<NaiveDateTime>,
    /// The final location of the archive on the archival host.
    pub remote_path: String,
    /// The size of the encrypted archive in bytes.
    pub bytes_written: u64,
    /// The hex-encoded SHA-256 digest of the encrypted archive.
    pub digest: String,
}

impl LineageRecord {
    /// Returns the identifier of the archive.
    pub fn id(&self) -> ArchiveId {
        ArchiveId::new(self.subvol.clone(), self.taken)
    }

    /// Returns the month bucket (`YYYYMM`) the archive belongs to.
    pub fn month_bucket(&self) -> String {
        self.id().month_bucket()
    }
}

/// The outcome of a run, terminal or not.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// The run is created but has not started processing subvolumes.
    Pending,
    /// The run is processing subvolumes.
    Running,
    /// Every subvolume was archived successfully.
    Success,
    /// Some subvolumes were archived successfully, some failed.
    Partial,
    /// No subvolume was archived successfully.
    Failed,
    /// The run was cancelled cooperatively.
    Cancelled,
}

impl RunOutcome {
    /// Reports whether the outcome is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The recorded outcome of one subvolume within a run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunItem {
    /// The subvolume this item describes.
    pub subvol: String,
    /// The outcome of archiving this subvolume.
    pub outcome: RunOutcome,
    /// The error message if the subvolume failed.
    pub error: Option<String>,
    /// The snapshot timestamp that was archived, if any.
    pub taken: Option<NaiveDateTime>,
}

/// A `Run` is the recorded history of a single engine invocation
/// across all configured subvolumes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// The identifier of the run.
    pub id: i64,
    /// When the run was created.
    pub started_at: NaiveDateTime,
    /// When the run reached a terminal outcome.
    pub finished_at: Option<NaiveDateTime>,
    /// The requested mode of the run.
    pub mode: ArchiveKind,
    /// The rolled-up outcome across all subvolumes.
    pub outcome: RunOutcome,
    /// The run-level error message, if any.
    pub error: Option<String>,
    /// Per-subvolume outcomes.
    pub items: Vec<RunItem>,
}

/// A `LineageStore` is the durable, transactional record
/// of every committed archive and every run.
///
/// Writes are serialized through an internal lock and are synchronously
/// committed, so a record that has been returned is on disk.
pub struct LineageStore {
    conn: Mutex<Connection>,
}

impl LineageStore {
    /// Opens or creates the store at the provided location.
    pub fn open(path: &Path) -> Result<Self, LineageError> {
        Self::init(Connection::open(path)?)
    }

    /// Opens a store that lives in memory only.
    pub fn open_in_memory() -> Result<Self, LineageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LineageError> {
        // journal_mode reports the resulting mode as a row.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots_sent (
                id INTEGER PRIMARY KEY,
                subvol TEXT NOT NULL,
                taken TEXT NOT NULL,
                kind TEXT NOT NULL,
                parent_taken TEXT,
                remote_path TEXT NOT NULL,
                bytes_written INTEGER NOT NULL,
                digest TEXT NOT NULL,
                UNIQUE (subvol, taken)
            );
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                mode TEXT NOT NULL,
                outcome TEXT NOT NULL,
                error TEXT
            );
            CREATE TABLE IF NOT EXISTS run_items (
                run_id INTEGER NOT NULL REFERENCES runs (id),
                subvol TEXT NOT NULL,
                outcome TEXT NOT NULL,
                error TEXT,
                taken TEXT,
                PRIMARY KEY (run_id, subvol)
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Commits an archive record. This is the linearization point
    /// of an archive becoming visible to future runs and restores.
    ///
    /// Rejects duplicates by `(subvol, taken)` and incremental records
    /// whose parent is not already committed or does not precede them.
    pub fn record_commit(&self, record: &LineageRecord) -> Result<(), LineageError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let duplicate: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM snapshots_sent WHERE subvol = ?1 AND taken = ?2)",
            params![record.subvol, ts_to_db(record.taken)],
            |row| row.get(0),
        )?;
        if duplicate {
            return Err(LineageError::Duplicate(record.id()));
        }

        match record.kind {
            ArchiveKind::Incremental => {
                let parent_taken = record
                    .parent_taken
                    .ok_or_else(|| LineageError::MissingParentTimestamp(record.id()))?;

                if parent_taken >= record.taken {
                    return Err(LineageError::ParentNotOlder(record.id()));
                }

                let parent_committed: bool = tx.query_row(
                    "SELECT EXISTS (SELECT 1 FROM snapshots_sent WHERE subvol = ?1 AND taken = ?2)",
                    params![record.subvol, ts_to_db(parent_taken)],
                    |row| row.get(0),
                )?;
                if !parent_committed {
                    return Err(LineageError::OrphanIncremental(ArchiveId::new(
                        record.subvol.clone(),
                        parent_taken,
                    )));
                }
            }
            ArchiveKind::Full => {}
        }

        tx.execute(
            "INSERT INTO snapshots_sent
                (subvol, taken, kind, parent_taken, remote_path, bytes_written, digest)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.subvol,
                ts_to_db(record.taken),
                record.kind.as_str(),
                record.parent_taken.map(ts_to_db),
                record.remote_path,
                record.bytes_written,
                record.digest,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Returns the committed record of `(subvol, taken)`, if any.
    pub fn get(&self, subvol: &str, taken: NaiveDateTime) -> Result<Option<LineageRecord>, LineageError> {
        let conn = self.conn.lock().unwrap();

        Ok(conn
            .query_row(
                &format!("{} WHERE subvol = ?1 AND taken = ?2", SELECT_RECORD),
                params![subvol, ts_to_db(taken)],
                record_from_row,
            )
            .optional()?)
    }

    /// Returns the most recent committed archive of any kind
    /// for the subvolume.
    pub fn latest_committed(&self, subvol: &str) -> Result<Option<LineageRecord>, LineageError> {
        let conn = self.conn.lock().unwrap();

        Ok(conn
            .query_row(
                &format!(
                    "{} WHERE subvol = ?1 ORDER BY taken DESC LIMIT 1",
                    SELECT_RECORD
                ),
                params![subvol],
                record_from_row,
            )
            .optional()?)
    }

    /// Returns the most recent committed full archive for the subvolume.
    pub fn latest_full(&self, subvol: &str) -> Result<Option<LineageRecord>, LineageError> {
        let conn = self.conn.lock().unwrap();

        Ok(conn
            .query_row(
                &format!(
                    "{} WHERE subvol = ?1 AND kind = 'full' ORDER BY taken DESC LIMIT 1",
                    SELECT_RECORD
                ),
                params![subvol],
                record_from_row,
            )
            .optional()?)
    }

    /// Returns the archive to base a new transfer on, or `None`
    /// if the transfer is to be self-contained.
    pub fn find_parent_candidate(
        &self,
        subvol: &str,
        kind: ArchiveKind,
    ) -> Result<Option<LineageRecord>, LineageError> {
        match kind {
            ArchiveKind::Full => Ok(None),
            ArchiveKind::Incremental => self.latest_committed(subvol),
        }
    }

    /// Returns the number of committed incrementals
    /// since the most recent committed full archive of the subvolume.
    pub fn chain_length(&self, subvol: &str) -> Result<u32, LineageError> {
        let last_full = self.latest_full(subvol)?;
        let conn = self.conn.lock().unwrap();

        let count = match last_full {
            Some(full) => conn.query_row(
                "SELECT COUNT(*) FROM snapshots_sent
                 WHERE subvol = ?1 AND kind = 'incremental' AND taken > ?2",
                params![subvol, ts_to_db(full.taken)],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM snapshots_sent WHERE subvol = ?1 AND kind = 'incremental'",
                params![subvol],
                |row| row.get(0),
            )?,
        };

        Ok(count)
    }

    /// Returns the number of committed incrementals
    /// that name `(subvol, taken)` as their parent.
    pub fn dependents(&self, subvol: &str, taken: NaiveDateTime) -> Result<u32, LineageError> {
        let conn = self.conn.lock().unwrap();

        Ok(conn.query_row(
            "SELECT COUNT(*) FROM snapshots_sent WHERE subvol = ?1 AND parent_taken = ?2",
            params![subvol, ts_to_db(taken)],
            |row| row.get(0),
        )?)
    }

    /// Returns all committed records of the subvolume,
    /// ordered by timestamp ascending.
    pub fn records_of(&self, subvol: &str) -> Result<Vec<LineageRecord>, LineageError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt =
            conn.prepare(&format!("{} WHERE subvol = ?1 ORDER BY taken ASC", SELECT_RECORD))?;
        let records = stmt
            .query_map(params![subvol], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Resolves the restore chain ending at `(subvol, taken)`:
    /// the full archive first, then every incremental up to the target.
    ///
    /// Fails if any link of the chain is no longer committed.
    pub fn chain_to(
        &self,
        subvol: &str,
        taken: NaiveDateTime,
    ) -> Result<Vec<LineageRecord>, LineageError> {
        let mut chain = Vec::new();

        let mut cursor = self
            .get(subvol, taken)?
            .ok_or_else(|| LineageError::NoSuchArchive(ArchiveId::new(subvol.to_string(), taken)))?;

        loop {
            chain.push(cursor.clone());

            match cursor.kind {
                ArchiveKind::Full => break,
                ArchiveKind::Incremental => {
                    let parent_taken = cursor
                        .parent_taken
                        .ok_or_else(|| LineageError::MissingParentTimestamp(cursor.id()))?;

                    cursor = self
                        .get(subvol, parent_taken)?
                        .ok_or_else(|| LineageError::BrokenChain(cursor.id()))?;
                }
            }
        }

        chain.reverse();
        Ok(chain)
    }

    /// Removes the record of `(subvol, taken)`.
    ///
    /// Refuses to remove a record that a committed incremental
    /// still depends on as its parent.
    pub fn remove(&self, subvol: &str, taken: NaiveDateTime) -> Result<(), LineageError> {
        if self.dependents(subvol, taken)? > 0 {
            return Err(LineageError::BrokenChain(ArchiveId::new(
                subvol.to_string(),
                taken,
            )));
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM snapshots_sent WHERE subvol = ?1 AND taken = ?2",
            params![subvol, ts_to_db(taken)],
        )?;

        Ok(())
    }

    /// Returns all month buckets with committed archives,
    /// ordered descending.
    pub fn months(&self) -> Result<Vec<String>, LineageError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT DISTINCT substr(taken, 1, 6) FROM snapshots_sent
             ORDER BY substr(taken, 1, 6) DESC",
        )?;
        let months = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(months)
    }

    /// Returns all committed records of one month bucket,
    /// ordered by timestamp ascending.
    pub fn records_of_month(&self, month: &str) -> Result<Vec<LineageRecord>, LineageError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(&format!(
            "{} WHERE substr(taken, 1, 6) = ?1 ORDER BY taken ASC",
            SELECT_RECORD
        ))?;
        let records = stmt
            .query_map(params![month], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Reports whether any committed archive outside the month bucket
    /// depends on an archive inside it as its parent.
    pub fn month_has_external_dependents(&self, month: &str) -> Result<bool, LineageError> {
        let conn = self.conn.lock().unwrap();

        Ok(conn.query_row(
            "SELECT EXISTS (
                SELECT 1 FROM snapshots_sent AS child
                JOIN snapshots_sent AS parent
                  ON parent.subvol = child.subvol AND parent.taken = child.parent_taken
                WHERE substr(parent.taken, 1, 6) = ?1
                  AND substr(child.taken, 1, 6) <> ?1
            )",
            params![month],
            |row| row.get(0),
        )?)
    }

    /// Removes every record of one month bucket.
    pub fn remove_month(&self, month: &str) -> Result<usize, LineageError> {
        let conn = self.conn.lock().unwrap();

        Ok(conn.execute(
            "DELETE FROM snapshots_sent WHERE substr(taken, 1, 6) = ?1",
            params![month],
        )?)
    }

    /// Creates a new run record in the `Pending` outcome,
    /// returning its identifier.
    pub fn create_run(&self, mode: ArchiveKind) -> Result<i64, LineageError> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO runs (started_at, mode, outcome) VALUES (?1, ?2, ?3)",
            params![ts_to_db(now()), mode.as_str(), RunOutcome::Pending.as_str()],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Updates the outcome of a run, stamping the finish time
    /// once the outcome is terminal.
    pub fn mark_run(
        &self,
        run_id: i64,
        outcome: RunOutcome,
        error: Option<&str>,
    ) -> Result<(), LineageError> {
        let finished_at = outcome.is_terminal().then(|| ts_to_db(now()));

        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE runs SET outcome = ?2, error = ?3, finished_at = ?4 WHERE id = ?1",
            params![run_id, outcome.as_str(), error, finished_at],
        )?;

        if updated == 0 {
            return Err(LineageError::NoSuchRun(run_id));
        }

        Ok(())
    }

    /// Records the outcome of one subvolume within a run.
    pub fn set_run_item(&self, run_id: i64, item: &RunItem) -> Result<(), LineageError> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO run_items (run_id, subvol, outcome, error, taken)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (run_id, subvol) DO UPDATE
             SET outcome = ?3, error = ?4, taken = ?5",
            params![
                run_id,
                item.subvol,
                item.outcome.as_str(),
                item.error,
                item.taken.map(ts_to_db),
            ],
        )?;

        Ok(())
    }

    /// Returns the run with the provided identifier.
    pub fn get_run(&self, run_id: i64) -> Result<Run, LineageError> {
        let conn = self.conn.lock().unwrap();

        let run = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_RUN),
                params![run_id],
                run_from_row,
            )
            .optional()?
            .ok_or(LineageError::NoSuchRun(run_id))?;

        Self::with_items(&conn, run)
    }

    /// Returns the history of runs, newest first,
    /// optionally filtered by outcome.
    pub fn list_runs(
        &self,
        limit: u32,
        offset: u32,
        filter: Option<RunOutcome>,
    ) -> Result<Vec<Run>, LineageError> {
        let conn = self.conn.lock().unwrap();

        let runs = match filter {
            Some(outcome) => {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE outcome = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
                    SELECT_RUN
                ))?;
                let runs = stmt
                    .query_map(params![outcome.as_str(), limit, offset], run_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                runs
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{} ORDER BY id DESC LIMIT ?1 OFFSET ?2",
                    SELECT_RUN
                ))?;
                let runs = stmt
                    .query_map(params![limit, offset], run_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                runs
            }
        };

        runs.into_iter()
            .map(|run| Self::with_items(&conn, run))
            .collect()
    }

    fn with_items(conn: &Connection, mut run: Run) -> Result<Run, LineageError> {
        let mut stmt = conn.prepare(
            "SELECT subvol, outcome, error, taken FROM run_items
             WHERE run_id = ?1 ORDER BY subvol ASC",
        )?;

        run.items = stmt
            .query_map(params![run.id], |row| {
                Ok(RunItem {
                    subvol: row.get(0)?,
                    outcome: outcome_from_db(row.get::<_, String>(1)?)?,
                    error: row.get(2)?,
                    taken: row
                        .get::<_, Option<String>>(3)?
                        .map(ts_from_db)
                        .transpose()?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(run)
    }
}

const SELECT_RECORD: &str = "SELECT subvol, taken, kind, parent_taken, remote_path, \
                             bytes_written, digest FROM snapshots_sent";
const SELECT_RUN: &str =
    "SELECT id, started_at, finished_at, mode, outcome, error FROM runs";

fn now() -> NaiveDateTime {
    Utc::now()
        .naive_utc()
        .with_nanosecond(0)
        .expect("zero nanoseconds is always in range")
}

fn ts_to_db(taken: NaiveDateTime) -> String {
    taken.format(TIMESTAMP_FMT).to_string()
}

fn ts_from_db(value: String) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&value, TIMESTAMP_FMT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn kind_from_db(value: String) -> rusqlite::Result<ArchiveKind> {
    match value.as_str() {
        "full" => Ok(ArchiveKind::Full),
        "incremental" => Ok(ArchiveKind::Incremental),
        _ => Err(rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown archive kind \"{}\"", value).into(),
        )),
    }
}

fn outcome_from_db(value: String) -> rusqlite::Result<RunOutcome> {
    RunOutcome::from_str(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown run outcome \"{}\"", value).into(),
        )
    })
}

fn record_from_row(row: &Row) -> rusqlite::Result<LineageRecord> {
    Ok(LineageRecord {
        subvol: row.get(0)?,
        taken: ts_from_db(row.get::<_, String>(1)?)?,
        kind: kind_from_db(row.get::<_, String>(2)?)?,
        parent_taken: row
            .get::<_, Option<String>>(3)?
            .map(ts_from_db)
            .transpose()?,
        remote_path: row.get(4)?,
        bytes_written: row.get(5)?,
        digest: row.get(6)?,
    })
}

fn run_from_row(row: &Row) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        started_at: ts_from_db(row.get::<_, String>(1)?)?,
        finished_at: row
            .get::<_, Option<String>>(2)?
            .map(ts_from_db)
            .transpose()?,
        mode: kind_from_db(row.get::<_, String>(3)?)?,
        outcome: outcome_from_db(row.get::<_, String>(4)?)?,
        error: row.get(5)?,
        items: Vec::new(),
    })
}

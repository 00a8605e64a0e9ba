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

use crate::archive::{verification_path, ArchiveKind};
use crate::config::{AgentConfig, SubvolumeConfig};
use crate::control::{ArchiveListing, RunDescriptor, StatusReport};
use crate::lineage::{LineageStore, Run, RunItem, RunOutcome};
use crate::pipeline::{CancelToken, Pipeline, Progress, Stage};
use crate::policy;
use crate::remote::{Connect, RemoteChannel, SshConnect};
use crate::restore::{RestoreDescriptor, Restorer};
use crate::retention::Reaper;
use crate::snapshot::{BtrfsSnapshots, Snapshot, SnapshotSource};
use crate::system;
use crate::{EngineError, PipelineError, SnapshotError};

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::prelude::*;
use log::{info, warn};

/// The time source of the controller: the current UTC time and the
/// local calendar date the run planning is evaluated against.
pub type Clock = Arc<dyn Fn() -> (NaiveDateTime, NaiveDate) + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| (Utc::now().naive_utc(), Local::now().date_naive()))
}

/// The `RunController` is the process-wide owner of run state.
///
/// It enforces that at most one run is active, spawns the worker thread
/// driving the pipeline across subvolumes, and answers the control plane.
/// It is created once at process start and lives until process exit.
pub struct RunController {
    inner: Arc<Inner>,
    current: Mutex<Option<CurrentRun>>,
}

/// The collaborators shared with run worker threads.
struct Inner {
    config: AgentConfig,
    store: Arc<LineageStore>,
    snapshots: Arc<dyn SnapshotSource>,
    connect: Arc<dyn Connect>,
    key_material: Vec<u8>,
    clock: Clock,
}

struct CurrentRun {
    run_id: i64,
    started_at: NaiveDateTime,
    mode: ArchiveKind,
    outcome: Arc<Mutex<RunOutcome>>,
    cancel: CancelToken,
    progress: Arc<Progress>,
    handle: Option<JoinHandle<()>>,
}

impl CurrentRun {
    fn outcome(&self) -> RunOutcome {
        *self.outcome.lock().unwrap()
    }

    fn is_terminal(&self) -> bool {
        self.outcome().is_terminal()
    }

    fn descriptor(&self) -> RunDescriptor {
        RunDescriptor {
            run_id: self.run_id,
            started_at: self.started_at,
            mode: self.mode,
            outcome: self.outcome(),
        }
    }
}

impl RunController {
    /// Constructs the controller with its production collaborators:
    /// the on-disk lineage store, btrfs snapshots, SSH transport
    /// and the keyfile below the data directory.
    pub fn new(config: AgentConfig) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(LineageStore::open(&system::lineage_db_path(&config.data_dir))?);
        let snapshots = Arc::new(BtrfsSnapshots::new(config.snapshot_dir.clone()));
        let connect = Arc::new(SshConnect::new(config.clone()));
        let key_material =
            system::load_or_generate_keyfile(&system::keyfile_path(&config.data_dir))?;

        Ok(Self::with_parts(config, store, snapshots, connect, key_material))
    }

    /// Constructs the controller from explicit collaborators.
    pub fn with_parts(
        config: AgentConfig,
        store: Arc<LineageStore>,
        snapshots: Arc<dyn SnapshotSource>,
        connect: Arc<dyn Connect>,
        key_material: Vec<u8>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                snapshots,
                connect,
                key_material,
                clock: system_clock(),
            }),
            current: Mutex::new(None),
        }
    }

    /// Replaces the time source, for deterministic run planning in tests.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("the time source can only be replaced before the controller is shared")
            .clock = clock;

        self
    }

    /// Starts a new run across the selected subvolumes.
    ///
    /// Preconditions (snapshot sources present, archival host reachable)
    /// are checked synchronously; the run itself proceeds on a worker
    /// thread. Fails with [`EngineError::AlreadyRunning`] while another
    /// run is not terminal.
    pub fn start(
        &self,
        mode: Option<ArchiveKind>,
        force_full: bool,
        subvolumes: &[String],
    ) -> Result<RunDescriptor, EngineError> {
        let force_full = force_full || mode == Some(ArchiveKind::Full);

        let mut current = self.current.lock().unwrap();
        if let Some(cur) = &*current {
            if !cur.is_terminal() {
                return Err(EngineError::AlreadyRunning);
            }
        }

        let selected = self.select_subvolumes(subvolumes)?;

        for subvol in &selected {
            if !subvol.source_path.exists() {
                return Err(SnapshotError::SourceMissing(subvol.source_path.clone()).into());
            }
        }

        // Surface an unreachable archival host before the run exists.
        let remote = self.inner.connect.connect()?;

        let mode = if force_full {
            ArchiveKind::Full
        } else {
            ArchiveKind::Incremental
        };
        let run_id = self.inner.store.create_run(mode)?;

        let cancel = CancelToken::new();
        let progress = Arc::new(Progress::new());
        let outcome = Arc::new(Mutex::new(RunOutcome::Pending));
        let started_at = Utc::now()
            .naive_utc()
            .with_nanosecond(0)
            .expect("zero nanoseconds is always in range");

        let handle = {
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            let progress = Arc::clone(&progress);
            let outcome = Arc::clone(&outcome);

            thread::spawn(move || {
                inner.execute_run(run_id, force_full, selected, remote, cancel, progress, outcome)
            })
        };

        let run = CurrentRun {
            run_id,
            started_at,
            mode,
            outcome,
            cancel,
            progress,
            handle: Some(handle),
        };
        let descriptor = run.descriptor();
        *current = Some(run);

        info!("run {} started", run_id);
        Ok(descriptor)
    }

    fn select_subvolumes(
        &self,
        subvolumes: &[String],
    ) -> Result<Vec<SubvolumeConfig>, EngineError> {
        let config = &self.inner.config;

        let selected: Vec<SubvolumeConfig> = if subvolumes.is_empty() {
            config.subvolumes.clone()
        } else {
            for name in subvolumes {
                if config.subvolume(name).is_none() {
                    return Err(EngineError::UnknownSubvolume(name.clone()));
                }
            }

            // Keep the stable configuration order, not the request order.
            config
                .subvolumes
                .iter()
                .filter(|subvol| subvolumes.contains(&subvol.name))
                .cloned()
                .collect()
        };

        if selected.is_empty() {
            return Err(EngineError::NoSubvolumes);
        }

        Ok(selected)
    }

    /// Signals cooperative cancellation to the active run.
    /// A cancel without an active run is a no-op.
    pub fn cancel(&self) {
        let current = self.current.lock().unwrap();

        if let Some(cur) = &*current {
            if !cur.is_terminal() {
                info!("run {}: cancellation requested", cur.run_id);
                cur.cancel.cancel();
            }
        }
    }

    /// Returns the active or most recent run with its latest
    /// progress sample, or `None` if no run happened yet.
    pub fn status(&self) -> Option<StatusReport> {
        let current = self.current.lock().unwrap();

        current.as_ref().map(|cur| StatusReport {
            descriptor: cur.descriptor(),
            progress: (!cur.is_terminal()).then(|| cur.progress.sample()),
        })
    }

    /// Blocks until the active run (if any) reaches a terminal outcome
    /// and returns it.
    pub fn wait(&self) -> Option<RunOutcome> {
        let handle = {
            let mut current = self.current.lock().unwrap();
            current.as_mut().and_then(|cur| cur.handle.take())
        };

        if let Some(handle) = handle {
            handle.join().ok();
        }

        let current = self.current.lock().unwrap();
        current.as_ref().map(CurrentRun::outcome)
    }

    /// Pages through the run history.
    pub fn list_runs(
        &self,
        limit: u32,
        offset: u32,
        filter: Option<RunOutcome>,
    ) -> Result<Vec<Run>, EngineError> {
        Ok(self.inner.store.list_runs(limit, offset, filter)?)
    }

    /// Lists archive months, or the committed archives of one month.
    pub fn browse_archives(&self, month: Option<String>) -> Result<ArchiveListing, EngineError> {
        match month {
            Some(month) => Ok(ArchiveListing::Entries(
                self.inner.store.records_of_month(&month)?,
            )),
            None => Ok(ArchiveListing::Months(self.inner.store.months()?)),
        }
    }

    /// Runs the retention reaper outside a run.
    ///
    /// Refused while a run is active to keep the remote channel
    /// exclusive to the run's pipeline.
    pub fn prune(&self) -> Result<(), EngineError> {
        {
            let current = self.current.lock().unwrap();
            if let Some(cur) = &*current {
                if !cur.is_terminal() {
                    return Err(EngineError::AlreadyRunning);
                }
            }
        }

        let remote = self.inner.connect.connect()?;

        let (now_utc, _) = (self.inner.clock)();
        Reaper {
            config: &self.inner.config,
            store: &self.inner.store,
            snapshots: &*self.inner.snapshots,
            remote: &*remote,
        }
        .reap(now_utc);

        Ok(())
    }

    /// Restores a subvolume chain into a target directory.
    ///
    /// Refused while a run is active; the chain must be fully committed
    /// or the restore fails without applying anything.
    pub fn restore(
        &self,
        subvol: &str,
        at: Option<NaiveDateTime>,
        target: &Path,
    ) -> Result<RestoreDescriptor, EngineError> {
        {
            let current = self.current.lock().unwrap();
            if let Some(cur) = &*current {
                if !cur.is_terminal() {
                    return Err(EngineError::AlreadyRunning);
                }
            }
        }

        let remote = self.inner.connect.connect()?;
        let restorer = Restorer {
            store: &self.inner.store,
            remote: &*remote,
            key_material: &self.inner.key_material,
        };

        let chain = restorer.plan(subvol, at)?;
        restorer.restore_to_dir(&chain, target)
    }
}

impl Inner {
    /// The worker body of one run.
    #[allow(clippy::too_many_arguments)]
    fn execute_run(
        &self,
        run_id: i64,
        force_full: bool,
        selected: Vec<SubvolumeConfig>,
        remote: Box<dyn RemoteChannel>,
        cancel: CancelToken,
        progress: Arc<Progress>,
        outcome_slot: Arc<Mutex<RunOutcome>>,
    ) {
        *outcome_slot.lock().unwrap() = RunOutcome::Running;
        if let Err(e) = self.store.mark_run(run_id, RunOutcome::Running, None) {
            warn!("run {}: cannot mark running: {}", run_id, e);
        }

        let pipeline = Pipeline {
            snapshots: &*self.snapshots,
            remote: &*remote,
            store: &self.store,
            key_material: &self.key_material,
            compress: self.config.compress_algo,
            compress_level: self.config.compress_level,
            base_path: &self.config.remote_base_path,
            client_id: &self.config.client_id,
        };

        let mut successes = 0;
        let mut failures = 0;
        let mut cancelled = false;
        let mut first_error: Option<String> = None;

        for subvol in &selected {
            if cancel.is_cancelled() {
                cancelled = true;
            }
            if cancelled {
                self.record_item(run_id, &subvol.name, RunOutcome::Cancelled, None, None);
                continue;
            }

            progress.begin(&subvol.name, Stage::Snapshot);

            match self.archive_subvolume(&pipeline, subvol, force_full, &cancel, &progress) {
                Ok(taken) => {
                    successes += 1;
                    self.record_item(run_id, &subvol.name, RunOutcome::Success, None, Some(taken));
                }
                Err(EngineError::Pipeline(PipelineError::Cancelled)) => {
                    cancelled = true;
                    self.record_item(run_id, &subvol.name, RunOutcome::Cancelled, None, None);
                }
                Err(e) => {
                    warn!("run {}: {} failed: {}", run_id, subvol.name, e);

                    failures += 1;
                    let message = e.to_string();
                    self.record_item(
                        run_id,
                        &subvol.name,
                        RunOutcome::Failed,
                        Some(message.clone()),
                        None,
                    );
                    first_error.get_or_insert(message);
                }
            }
        }

        let outcome = if cancelled {
            RunOutcome::Cancelled
        } else if failures == 0 {
            RunOutcome::Success
        } else if successes > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Failed
        };

        if outcome == RunOutcome::Success {
            self.write_verification(&*remote);

            let (now_utc, _) = (self.clock)();
            Reaper {
                config: &self.config,
                store: &self.store,
                snapshots: &*self.snapshots,
                remote: &*remote,
            }
            .reap(now_utc);
        }

        if let Err(e) = self.store.mark_run(run_id, outcome, first_error.as_deref()) {
            warn!("run {}: cannot mark {}: {}", run_id, outcome, e);
        }

        *outcome_slot.lock().unwrap() = outcome;
        info!("run {} finished: {}", run_id, outcome);
    }

    /// Plans and ships one subvolume, returning the archived
    /// snapshot timestamp.
    fn archive_subvolume(
        &self,
        pipeline: &Pipeline,
        subvol: &SubvolumeConfig,
        force_full: bool,
        cancel: &CancelToken,
        progress: &Progress,
    ) -> Result<NaiveDateTime, EngineError> {
        let local_snapshots = self.snapshots.list(&subvol.name)?;

        let (now_utc, today_local) = (self.clock)();
        let decision = policy::decide(
            &self.config,
            &self.store,
            &local_snapshots,
            &subvol.name,
            force_full,
            now_utc,
            today_local,
        )?;

        let parent_snapshot = decision
            .parent
            .as_ref()
            .map(|parent| Snapshot::new(subvol.name.clone(), parent.taken));

        let snapshot = self.snapshots.create(&subvol.name, &subvol.source_path)?;

        let record = pipeline.ship(
            decision.kind,
            &snapshot,
            parent_snapshot.as_ref(),
            cancel,
            progress,
        )?;

        Ok(record.taken)
    }

    fn record_item(
        &self,
        run_id: i64,
        subvol: &str,
        outcome: RunOutcome,
        error: Option<String>,
        taken: Option<NaiveDateTime>,
    ) {
        let item = RunItem {
            subvol: subvol.to_string(),
            outcome,
            error,
            taken,
        };

        if let Err(e) = self.store.set_run_item(run_id, &item) {
            warn!("run {}: cannot record item for {}: {}", run_id, subvol, e);
        }
    }

    /// Rewrites the remote liveness marker after a successful run.
    fn write_verification(&self, remote: &dyn RemoteChannel) {
        let path = verification_path(&self.config.remote_base_path, &self.config.client_id);
        let marker = format!(
            "{} {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            self.config.client_id
        );

        if let Err(e) = remote.put_file(&path, marker.as_bytes()) {
            warn!("cannot rewrite {}: {}", path, e);
        }
    }
}

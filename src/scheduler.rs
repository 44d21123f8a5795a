//! The admission, dispatch, and completion engine.
//!
//! One mutex serializes every mutation of folders, jobs, and queue mode, so
//! admission passes, completion handling, and control calls observe each
//! other as strictly ordered. Anything that can block — spawning, process
//! table reads, log and state-file I/O — happens outside the lock: state is
//! taken and marked first, the side effect runs after release, and failures
//! re-enter to commit.

use chrono::Local;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::logsink;
use crate::model::{Folder, FolderStatus, JobStatus, QueueCounts, Settings, Snapshot};
use crate::process_ctl;
use crate::store::StateStore;
use crate::supervisor::{self, LaunchSpec};

/// Notifications published to subscribed observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An admission pass found nothing running and nothing queued while the
    /// queue was running; the queue is now paused. At most once per
    /// start/pause cycle.
    QueueFinished,
    /// Some job or folder changed; observers should re-read via `observe`.
    StateChanged,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    total_cores: u32,
    log_root: PathBuf,
    store: StateStore,
    state: Mutex<State>,
    subscribers: Mutex<Vec<Sender<Event>>>,
}

struct State {
    snapshot: Snapshot,
    queue_running: bool,
    /// Re-entrancy guard for admission; recursive entry is a no-op.
    admission_active: bool,
    /// Root PID per running job, owned here for cancellation only.
    running_pids: HashMap<String, u32>,
    cancel_requested: HashSet<String>,
    restart_requested: HashSet<String>,
}

/// What `cancel_job`/`restart_job` decided under the lock; the kill itself
/// runs after release.
enum CancelAction {
    KillTree(Option<u32>),
    Finalized,
    Noop,
}

impl Scheduler {
    /// Load the persisted snapshot and build a paused scheduler around it.
    pub fn new(total_cores: u32, log_root: impl Into<PathBuf>, store: StateStore) -> Self {
        let snapshot = store.load();
        Scheduler {
            inner: Arc::new(Inner {
                total_cores: total_cores.max(1),
                log_root: log_root.into(),
                store,
                state: Mutex::new(State {
                    snapshot,
                    queue_running: false,
                    admission_active: false,
                    running_pids: HashMap::new(),
                    cancel_requested: HashSet::new(),
                    restart_requested: HashSet::new(),
                }),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn total_cores(&self) -> u32 {
        self.inner.total_cores
    }

    /// Register an observer channel. Dead receivers are pruned on emit.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn emit(&self, event: Event) {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event).is_ok());
    }

    fn lock_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Run a closure over the snapshot under the scheduler lock. The control
    /// surface uses this for insertion, removal, and reordering; status and
    /// run-field mutation stays in this module.
    pub(crate) fn with_snapshot_mut<T>(&self, f: impl FnOnce(&mut Snapshot) -> T) -> T {
        self.lock_state(|s| f(&mut s.snapshot))
    }

    /// Clone the current snapshot for read-only observers.
    pub fn snapshot(&self) -> Snapshot {
        self.lock_state(|s| s.snapshot.clone())
    }

    pub fn settings(&self) -> Settings {
        self.lock_state(|s| s.snapshot.settings)
    }

    /// Replace settings and re-run admission (a smaller budget never evicts
    /// running jobs; a retry flag change applies from the next completion).
    pub fn set_settings(&self, settings: Settings) {
        self.lock_state(|s| s.snapshot.settings = settings);
        self.persist();
        self.emit(Event::StateChanged);
        self.try_start_jobs();
    }

    /// Save the snapshot, best-effort.
    pub fn persist(&self) {
        let snapshot = self.snapshot();
        self.inner.store.save(&snapshot);
    }

    /// Tell observers the snapshot changed through a control mutation.
    pub(crate) fn notify_changed(&self) {
        self.emit(Event::StateChanged);
    }

    /// Core usage plus per-status tallies.
    pub fn observe(&self) -> QueueCounts {
        self.lock_state(|s| {
            let mut counts = QueueCounts {
                total_cores: self.inner.total_cores,
                used_cores: 0,
                available_cores: 0,
                queued: 0,
                running: 0,
                completed: 0,
                failed: 0,
                cancelled: 0,
            };
            for job in s.snapshot.folders.iter().flat_map(|f| &f.jobs) {
                match job.status {
                    JobStatus::Queued => counts.queued += 1,
                    JobStatus::Running => {
                        counts.running += 1;
                        counts.used_cores += job.required_cores;
                    }
                    JobStatus::Completed => counts.completed += 1,
                    JobStatus::Failed => counts.failed += 1,
                    JobStatus::Cancelled => counts.cancelled += 1,
                }
            }
            counts.available_cores = self.inner.total_cores.saturating_sub(counts.used_cores);
            counts
        })
    }

    pub fn is_queue_running(&self) -> bool {
        self.lock_state(|s| s.queue_running)
    }

    /// Permit admission passes and immediately run one.
    pub fn start_queue(&self) {
        self.lock_state(|s| s.queue_running = true);
        info!("queue started");
        self.try_start_jobs();
    }

    /// Stop admitting new jobs. Running jobs are unaffected.
    pub fn pause_queue(&self) {
        self.lock_state(|s| s.queue_running = false);
        info!("queue paused");
    }

    /// One admission pass: parallel across folders, strictly sequential
    /// within a folder, bounded by the physical-core budget.
    pub fn try_start_jobs(&self) {
        let (specs, finished) = self.lock_state(|s| {
            if !s.queue_running || s.admission_active {
                return (Vec::new(), false);
            }
            s.admission_active = true;

            let available = available_cores(self.inner.total_cores, &s.snapshot.folders);
            let chosen = plan_admission(&s.snapshot.folders, available);
            let show_console = s.snapshot.settings.show_console_window;
            let mut specs = Vec::with_capacity(chosen.len());
            for job_id in chosen {
                if let Some(spec) = self.mark_started(s, &job_id, show_console) {
                    specs.push(spec);
                }
            }

            let any_running = s
                .snapshot
                .folders
                .iter()
                .flat_map(|f| &f.jobs)
                .any(|j| j.status == JobStatus::Running);
            let any_queued = s
                .snapshot
                .folders
                .iter()
                .flat_map(|f| &f.jobs)
                .any(|j| j.status == JobStatus::Queued);
            let finished = !any_running && !any_queued;
            if finished {
                s.queue_running = false;
            }

            s.admission_active = false;
            (specs, finished)
        });

        if finished {
            info!("queue finished");
            self.emit(Event::QueueFinished);
            return;
        }
        if specs.is_empty() {
            return;
        }

        for spec in &specs {
            let job = self.lock_state(|s| {
                s.snapshot.find_job(&spec.job_id).map(|(_, j)| j.clone())
            });
            if let Some(job) = job {
                logsink::write_header(&spec.log_path, &job);
            }
        }

        for spec in specs {
            let job_id = spec.job_id.clone();
            let log_path = spec.log_path.clone();
            match supervisor::launch(spec, self.clone()) {
                Ok(pid) => self.lock_state(|s| {
                    // The child may already have exited and been handled, or a
                    // follow-up run may have registered its own pid; track this
                    // pid only while the job is running and untracked.
                    let still_running = s
                        .snapshot
                        .find_job(&job_id)
                        .is_some_and(|(_, j)| j.status == JobStatus::Running);
                    if still_running {
                        s.running_pids.entry(job_id.clone()).or_insert(pid);
                    }
                }),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "spawn failed");
                    logsink::append_line(&log_path, &format!("failed to start script: {e:#}"));
                    self.fail_spawn(&job_id);
                }
            }
        }

        self.persist();
        self.emit(Event::StateChanged);
    }

    /// Transition one queued job to Running and build its launch spec.
    /// Runs under the scheduler lock.
    fn mark_started(&self, s: &mut State, job_id: &str, show_console: bool) -> Option<LaunchSpec> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let folder = s
            .snapshot
            .folders
            .iter_mut()
            .find(|f| f.jobs.iter().any(|j| j.id == job_id))?;
        let folder_name = folder.name.clone();
        let job = folder.job_mut(job_id)?;

        let log_path = self.inner.log_root.join(format!(
            "{stamp}_{}_{}_{}.log",
            sanitize(&folder_name),
            sanitize(&job.name),
            job.id,
        ));
        job.status = JobStatus::Running;
        job.started_at = Some(Local::now());
        job.ended_at = None;
        job.exit_code = None;
        job.log_path = Some(log_path.clone());
        let spec = LaunchSpec {
            job_id: job.id.clone(),
            bat_path: job.bat_path.clone(),
            log_path,
            show_console,
        };
        folder.recompute_status();
        Some(spec)
    }

    /// Commit a spawn failure: the job goes straight to Failed and another
    /// admission pass runs for the freed budget.
    fn fail_spawn(&self, job_id: &str) {
        self.lock_state(|s| {
            s.running_pids.remove(job_id);
            if let Some(folder) = s
                .snapshot
                .folders
                .iter_mut()
                .find(|f| f.jobs.iter().any(|j| j.id == job_id))
            {
                if let Some(job) = folder.job_mut(job_id) {
                    job.status = JobStatus::Failed;
                    job.ended_at = Some(Local::now());
                    job.exit_code = None;
                }
                folder.recompute_status();
            }
        });
        self.persist();
        self.emit(Event::StateChanged);
        self.try_start_jobs();
    }

    /// Completion entry point, called by the supervisor after the root
    /// process exited and its descendants drained.
    pub fn handle_exit(&self, job_id: &str, exit_code: Option<i32>) {
        let outcome = self.lock_state(|s| {
            s.running_pids.remove(job_id);
            let restart = s.restart_requested.remove(job_id);
            let cancel = s.cancel_requested.remove(job_id);
            let auto_retry = s.snapshot.settings.auto_retry_failed_jobs;

            let folder = s
                .snapshot
                .folders
                .iter_mut()
                .find(|f| f.jobs.iter().any(|j| j.id == job_id))?;
            let job = folder.job_mut(job_id)?;

            job.ended_at = Some(Local::now());
            job.exit_code = exit_code;
            let log_path = job.log_path.clone();
            let footer_job = job.clone();

            let label = if restart {
                job.reset_to_queued();
                job.retry_count = 0;
                "Restarted"
            } else if cancel {
                job.status = JobStatus::Cancelled;
                "Cancelled"
            } else if exit_code == Some(0) {
                job.status = JobStatus::Completed;
                "Completed"
            } else if auto_retry && job.retry_count < 1 {
                job.retry_count += 1;
                job.reset_to_queued();
                "Failed (auto retry)"
            } else {
                job.status = JobStatus::Failed;
                "Failed"
            };

            folder.recompute_status();
            let completed_folder =
                (folder.status == FolderStatus::Completed).then(|| folder.clone());
            Some((log_path, footer_job, label, completed_folder))
        });

        let Some((log_path, footer_job, label, completed_folder)) = outcome else {
            debug!(job_id, "exit reported for unknown job");
            return;
        };
        info!(job_id, ?exit_code, outcome = label, "job finished");

        if let Some(path) = &log_path {
            logsink::append_footer(path, &footer_job, label);
        }
        if let Some(folder) = completed_folder {
            logsink::write_folder_summary(&folder);
        }

        self.persist();
        self.emit(Event::StateChanged);
        self.try_start_jobs();
    }

    /// Cancel a job. Running jobs get their whole process tree killed and
    /// are finalized by the completion path; queued jobs are cancelled in
    /// place; terminal jobs are untouched.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let action = self.lock_state(|s| {
            let Some(folder) = s
                .snapshot
                .folders
                .iter_mut()
                .find(|f| f.jobs.iter().any(|j| j.id == job_id))
            else {
                return CancelAction::Noop;
            };
            let Some(job) = folder.job_mut(job_id) else {
                return CancelAction::Noop;
            };
            match job.status {
                JobStatus::Running => {
                    s.cancel_requested.insert(job_id.to_string());
                    CancelAction::KillTree(s.running_pids.get(job_id).copied())
                }
                JobStatus::Queued => {
                    job.status = JobStatus::Cancelled;
                    job.ended_at = Some(Local::now());
                    folder.recompute_status();
                    CancelAction::Finalized
                }
                _ => CancelAction::Noop,
            }
        });

        match action {
            CancelAction::KillTree(pid) => {
                info!(job_id, ?pid, "cancel requested, killing process tree");
                if let Some(pid) = pid {
                    process_ctl::kill_tree(pid);
                }
                true
            }
            CancelAction::Finalized => {
                info!(job_id, "queued job cancelled");
                self.persist();
                self.emit(Event::StateChanged);
                true
            }
            CancelAction::Noop => false,
        }
    }

    /// Restart a job. A running job is killed and re-queued by the
    /// completion path; anything else is reset to the queue directly.
    /// Either way its retry budget starts over.
    pub fn restart_job(&self, job_id: &str) -> bool {
        let action = self.lock_state(|s| {
            let Some(folder) = s
                .snapshot
                .folders
                .iter_mut()
                .find(|f| f.jobs.iter().any(|j| j.id == job_id))
            else {
                return CancelAction::Noop;
            };
            let Some(job) = folder.job_mut(job_id) else {
                return CancelAction::Noop;
            };
            match job.status {
                JobStatus::Running => {
                    s.restart_requested.insert(job_id.to_string());
                    CancelAction::KillTree(s.running_pids.get(job_id).copied())
                }
                _ => {
                    job.reset_to_queued();
                    job.retry_count = 0;
                    folder.recompute_status();
                    CancelAction::Finalized
                }
            }
        });

        match action {
            CancelAction::KillTree(pid) => {
                info!(job_id, ?pid, "restart requested, killing process tree");
                if let Some(pid) = pid {
                    process_ctl::kill_tree(pid);
                }
                true
            }
            CancelAction::Finalized => {
                info!(job_id, "job reset to queue");
                self.persist();
                self.emit(Event::StateChanged);
                self.try_start_jobs();
                true
            }
            CancelAction::Noop => false,
        }
    }

    /// Force-kill every tracked child tree and save. In-flight jobs are
    /// persisted as they are and re-queued by normalization on next load.
    pub fn shutdown(&self) {
        let pids: Vec<u32> = self.lock_state(|s| {
            s.queue_running = false;
            s.running_pids.values().copied().collect()
        });
        for pid in pids {
            process_ctl::kill_tree(pid);
        }
        self.persist();
    }
}

/// Budget remaining after the running jobs' reservations.
fn available_cores(total: u32, folders: &[Folder]) -> u32 {
    let used: u32 = folders
        .iter()
        .flat_map(|f| &f.jobs)
        .filter(|j| j.status == JobStatus::Running)
        .map(|j| j.required_cores)
        .sum();
    total.saturating_sub(used)
}

/// Choose which jobs to start, in folder order, against `available` cores.
///
/// Per folder: skip when a member is already running (sequential within a
/// folder), skip when a member has failed or been cancelled (dead folder),
/// take the first queued job only if everything before it completed, and
/// only if it fits the remaining budget — a folder whose head does not fit
/// is passed over so a smaller job elsewhere may still start.
fn plan_admission(folders: &[Folder], mut available: u32) -> Vec<String> {
    let mut chosen = Vec::new();
    for folder in folders {
        if folder.jobs.iter().any(|j| j.status == JobStatus::Running) {
            continue;
        }
        if folder
            .jobs
            .iter()
            .any(|j| matches!(j.status, JobStatus::Failed | JobStatus::Cancelled))
        {
            debug!(folder = %folder.name, "skipping folder with failed or cancelled job");
            continue;
        }
        let Some(next_idx) = folder.jobs.iter().position(|j| j.status == JobStatus::Queued)
        else {
            continue;
        };
        if folder.jobs[..next_idx]
            .iter()
            .any(|j| j.status != JobStatus::Completed)
        {
            continue;
        }
        let next = &folder.jobs[next_idx];
        if next.required_cores > available {
            debug!(
                folder = %folder.name,
                job = %next.name,
                required = next.required_cores,
                available,
                "job does not fit the remaining budget"
            );
            continue;
        }
        available -= next.required_cores;
        chosen.push(next.id.clone());
    }
    chosen
}

/// Replace characters that cannot appear in file names.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

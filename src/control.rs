//! The synchronous mutation surface a front-end drives.
//!
//! Insertion, removal, and reordering of folders and jobs live here; status
//! and run-field mutation belongs to the scheduler. Every mutation is
//! followed by a best-effort save. Out-of-range or unknown-id calls are
//! no-ops reported through the return value, never errors.
//!
//! A folder containing a Failed or Cancelled job is skipped by admission
//! while the rest of the queue keeps running; starting the queue never
//! revives such a folder until the offending job is restarted.

use std::path::Path;
use tracing::{info, warn};

use crate::inspect;
use crate::model::{Folder, Job, JobStatus, QueueCounts, Snapshot};
use crate::scheduler::Scheduler;

/// Scripts enrolled from a folder, in execution order. Missing ones are
/// skipped.
pub const KNOWN_SCRIPTS: [&str; 5] = [
    "mesh.bat",
    "decompose.bat",
    "solve.bat",
    "reconstruct.bat",
    "save_results.bat",
];

/// Files whose presence marks a folder as already processed.
const COMPLETED_MARKERS: [&str; 2] = ["batch_runner_summary.log", "save_results.log"];

pub struct Controller {
    scheduler: Scheduler,
}

impl Controller {
    pub fn new(scheduler: Scheduler) -> Self {
        Controller { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Enroll a folder: wrap every known script present into jobs, in the
    /// fixed order. Returns the enrolled folder, or `None` when the path is
    /// already enrolled, already processed, or holds no known scripts.
    pub fn add_folder(&self, path: &Path) -> Option<Folder> {
        if self.is_enrolled(path) {
            warn!(path = %path.display(), "folder already enrolled");
            return None;
        }
        if COMPLETED_MARKERS.iter().any(|m| path.join(m).is_file()) {
            warn!(path = %path.display(), "folder already processed, refusing");
            return None;
        }

        let mut folder = Folder::new(path);
        for script in KNOWN_SCRIPTS {
            let script_path = path.join(script);
            if script_path.is_file() {
                let cores = inspect::required_cores(&script_path);
                folder.jobs.push(Job::new(script_path, cores));
            }
        }
        if folder.jobs.is_empty() {
            warn!(path = %path.display(), "no known scripts found");
            return None;
        }

        info!(path = %path.display(), jobs = folder.jobs.len(), "folder enrolled");
        let added = folder.clone();
        self.scheduler
            .with_snapshot_mut(|snap| snap.folders.push(folder));
        self.after_mutation();
        self.scheduler.try_start_jobs();
        Some(added)
    }

    /// Wrap a single script in a synthetic one-job folder.
    pub fn add_job(&self, script: &Path) -> Option<Folder> {
        if !script.is_file() {
            warn!(path = %script.display(), "script not found");
            return None;
        }
        let parent = script.parent().unwrap_or(Path::new("."));
        let cores = inspect::required_cores(script);
        let mut folder = Folder::new(parent);
        folder.name = crate::model::display_name(script);
        folder.jobs.push(Job::new(script, cores));

        info!(path = %script.display(), "script enrolled");
        let added = folder.clone();
        self.scheduler
            .with_snapshot_mut(|snap| snap.folders.push(folder));
        self.after_mutation();
        self.scheduler.try_start_jobs();
        Some(added)
    }

    /// Cancel any running job in the folder, then drop it from the queue.
    pub fn remove_folder(&self, folder_id: &str) -> bool {
        let running: Option<Vec<String>> = self.scheduler.with_snapshot_mut(|snap| {
            snap.folders.iter().find(|f| f.id == folder_id).map(|f| {
                f.jobs
                    .iter()
                    .filter(|j| j.status == JobStatus::Running)
                    .map(|j| j.id.clone())
                    .collect()
            })
        });
        let Some(running) = running else {
            return false;
        };
        for job_id in running {
            self.scheduler.cancel_job(&job_id);
        }

        self.scheduler
            .with_snapshot_mut(|snap| snap.folders.retain(|f| f.id != folder_id));
        info!(folder_id, "folder removed");
        self.after_mutation();
        self.scheduler.try_start_jobs();
        true
    }

    /// Move a folder within the top-level sequence.
    pub fn reorder_folders(&self, from: usize, to: usize) -> bool {
        let moved = self.scheduler.with_snapshot_mut(|snap| {
            let len = snap.folders.len();
            if from >= len || to >= len {
                return false;
            }
            let folder = snap.folders.remove(from);
            snap.folders.insert(to, folder);
            true
        });
        if moved {
            self.after_mutation();
        }
        moved
    }

    /// Move a job within its folder's list.
    pub fn reorder_jobs(&self, folder_id: &str, from: usize, to: usize) -> bool {
        let moved = self.scheduler.with_snapshot_mut(|snap| {
            let Some(folder) = snap.folders.iter_mut().find(|f| f.id == folder_id) else {
                return false;
            };
            let len = folder.jobs.len();
            if from >= len || to >= len {
                return false;
            }
            let job = folder.jobs.remove(from);
            folder.jobs.insert(to, job);
            true
        });
        if moved {
            self.after_mutation();
        }
        moved
    }

    pub fn cancel_job(&self, job_id: &str) -> bool {
        let done = self.scheduler.cancel_job(job_id);
        if done {
            self.scheduler.persist();
        }
        done
    }

    pub fn restart_job(&self, job_id: &str) -> bool {
        let done = self.scheduler.restart_job(job_id);
        if done {
            self.scheduler.persist();
        }
        done
    }

    pub fn start_queue(&self) {
        self.scheduler.start_queue();
    }

    pub fn pause_queue(&self) {
        self.scheduler.pause_queue();
    }

    /// Core usage plus an immutable snapshot for diffing front-ends.
    pub fn observe(&self) -> (QueueCounts, Snapshot) {
        (self.scheduler.observe(), self.scheduler.snapshot())
    }

    fn is_enrolled(&self, path: &Path) -> bool {
        let needle = path.to_string_lossy().to_lowercase();
        self.scheduler.with_snapshot_mut(|snap| {
            snap.folders
                .iter()
                .any(|f| f.path.to_string_lossy().to_lowercase() == needle)
        })
    }

    fn after_mutation(&self) {
        self.scheduler.persist();
        self.scheduler.notify_changed();
    }
}

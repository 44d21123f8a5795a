//! Data model: jobs, folders, settings, and the persisted snapshot.
//!
//! Field names and enum values serialize exactly as they appear in
//! `batchrunner_state.json` (PascalCase keys, symbolic status names).
//! Unknown fields are ignored on load; absent fields take defaults.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lifecycle state of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
        }
    }

    /// Completed, Failed, and Cancelled are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Aggregate state of a folder, derived from its member jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FolderStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl FolderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderStatus::Queued => "Queued",
            FolderStatus::Running => "Running",
            FolderStatus::Completed => "Completed",
            FolderStatus::Failed => "Failed",
            FolderStatus::Cancelled => "Cancelled",
        }
    }
}

/// A single script invocation.
///
/// Persisted structure:
/// ```json
/// { "Id": "...", "Name": "...", "BatPath": "...",
///   "RequiredCores": 2, "Status": "Queued",
///   "AddedAt": "...", "StartedAt": null, "EndedAt": null,
///   "ExitCode": null, "LogPath": null, "RetryCount": 0 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub bat_path: PathBuf,
    pub required_cores: u32,
    pub status: JobStatus,
    pub added_at: DateTime<Local>,
    /// Set when the job starts; cleared on reset/restart.
    pub started_at: Option<DateTime<Local>>,
    /// Set on every terminal transition; also set when a queued job is cancelled.
    pub ended_at: Option<DateTime<Local>>,
    /// Present iff a process completed and its code was retrievable.
    pub exit_code: Option<i32>,
    /// Path to this run's log; set at launch, cleared on reset.
    pub log_path: Option<PathBuf>,
    /// Persists across auto-retries; reset only by a user-initiated restart.
    pub retry_count: u32,
}

impl Default for Job {
    fn default() -> Self {
        Job {
            id: String::new(),
            name: String::new(),
            bat_path: PathBuf::new(),
            required_cores: 1,
            status: JobStatus::Queued,
            added_at: Local::now(),
            started_at: None,
            ended_at: None,
            exit_code: None,
            log_path: None,
            retry_count: 0,
        }
    }
}

impl Job {
    /// Build a fresh queued job for a script path.
    pub fn new(bat_path: impl Into<PathBuf>, required_cores: u32) -> Self {
        let bat_path = bat_path.into();
        let name = display_name(&bat_path);
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            bat_path,
            required_cores: required_cores.max(1),
            ..Job::default()
        }
    }

    /// Clear run fields and return to the queue.
    pub fn reset_to_queued(&mut self) {
        self.status = JobStatus::Queued;
        self.started_at = None;
        self.ended_at = None;
        self.exit_code = None;
        self.log_path = None;
    }
}

/// Display label for a script: its file name, falling back to the full path.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// An ordered group of jobs sharing a working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub status: FolderStatus,
    /// UI hint; persisted but otherwise opaque.
    pub is_expanded: bool,
    pub jobs: Vec<Job>,
}

impl Default for Folder {
    fn default() -> Self {
        Folder {
            id: String::new(),
            name: String::new(),
            path: PathBuf::new(),
            status: FolderStatus::Queued,
            is_expanded: true,
            jobs: Vec::new(),
        }
    }
}

impl Folder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = display_name(&path);
        Folder {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            path,
            ..Folder::default()
        }
    }

    /// Recompute the derived aggregate status from member jobs.
    ///
    /// Running wins over everything; a folder whose jobs are all Completed is
    /// Completed; otherwise the most recently terminated job decides between
    /// Failed and Cancelled, and anything else (including a later recovery
    /// that re-queued work) reads as Queued.
    pub fn recompute_status(&mut self) {
        if self.jobs.iter().any(|j| j.status == JobStatus::Running) {
            self.status = FolderStatus::Running;
            return;
        }
        if !self.jobs.is_empty() && self.jobs.iter().all(|j| j.status == JobStatus::Completed) {
            self.status = FolderStatus::Completed;
            return;
        }
        let latest_terminal = self
            .jobs
            .iter()
            .filter(|j| j.status.is_terminal())
            .max_by_key(|j| j.ended_at);
        self.status = match latest_terminal.map(|j| j.status) {
            Some(JobStatus::Failed) => FolderStatus::Failed,
            Some(JobStatus::Cancelled) => FolderStatus::Cancelled,
            _ => FolderStatus::Queued,
        };
    }

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    pub fn job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }
}

/// User-tunable behavior, persisted alongside the folders.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    pub auto_retry_failed_jobs: bool,
    pub show_console_window: bool,
}

/// The whole persisted document: folders plus settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct Snapshot {
    pub folders: Vec<Folder>,
    pub settings: Settings,
}

impl Snapshot {
    pub fn find_job(&self, job_id: &str) -> Option<(&Folder, &Job)> {
        self.folders
            .iter()
            .find_map(|f| f.job(job_id).map(|j| (f, j)))
    }
}

/// Core usage and per-status tallies returned by `observe`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueCounts {
    pub total_cores: u32,
    pub used_cores: u32,
    pub available_cores: u32,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

//! Snapshot persistence: one JSON document holding folders, jobs, and
//! settings.
//!
//! Load never fails: an absent or unparsable file yields an empty snapshot
//! (the file is left in place for inspection). Save is best-effort and
//! synchronous; a failed write is traced, not propagated.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::inspect;
use crate::model::{display_name, JobStatus, Snapshot};

/// Default file name, written next to the executable.
pub const STATE_FILE_NAME: &str = "batchrunner_state.json";

/// Resolve the directory holding the state file and log root.
///
///   1. `--root` CLI flag
///   2. directory of the executable
///   3. current working directory
pub fn resolve_root(cli_root: Option<&str>) -> PathBuf {
    if let Some(root) = cli_root {
        return PathBuf::from(root);
    }
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StateStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and normalize the snapshot. Missing or corrupt files produce an
    /// empty snapshot; corrupt files are not deleted.
    pub fn load(&self) -> Snapshot {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(_) => {
                debug!(path = %self.path.display(), "no state file, starting empty");
                return Snapshot::default();
            }
        };
        let mut snapshot: Snapshot = match serde_json::from_slice(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state file unreadable, starting empty");
                return Snapshot::default();
            }
        };
        normalize(&mut snapshot);
        snapshot
    }

    /// Serialize the full snapshot as indented JSON, overwriting in place.
    pub fn save(&self, snapshot: &Snapshot) {
        let contents = match serde_json::to_string_pretty(snapshot) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "could not serialize state");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, contents) {
            warn!(path = %self.path.display(), error = %e, "could not save state");
        }
    }
}

/// Repair a freshly loaded snapshot so the scheduler's invariants hold.
///
/// Fills missing ids and names, re-derives core requirements for scripts that
/// still exist, and demotes any job recorded as Running: the process backing
/// it died with the previous host, so it re-enters the queue with its run
/// fields cleared. Idempotent.
pub fn normalize(snapshot: &mut Snapshot) {
    let mut seen_ids: HashSet<String> = HashSet::new();

    for folder in &mut snapshot.folders {
        if folder.id.is_empty() || !seen_ids.insert(folder.id.clone()) {
            folder.id = uuid::Uuid::new_v4().to_string();
            seen_ids.insert(folder.id.clone());
        }
        if folder.name.is_empty() {
            folder.name = display_name(&folder.path);
        }

        for job in &mut folder.jobs {
            if job.id.is_empty() || !seen_ids.insert(job.id.clone()) {
                job.id = uuid::Uuid::new_v4().to_string();
                seen_ids.insert(job.id.clone());
            }
            if job.name.is_empty() {
                job.name = display_name(&job.bat_path);
            }
            if job.bat_path.is_file() {
                job.required_cores = inspect::required_cores(&job.bat_path);
            } else {
                job.required_cores = job.required_cores.max(1);
            }
            if job.status == JobStatus::Running {
                job.reset_to_queued();
            }
        }

        folder.recompute_status();
    }
}

//! Per-run log files and folder summaries.
//!
//! Every writer here is best-effort: one attempt, failures traced and
//! swallowed. The child's own output lands between header and footer via the
//! supervisor's tee threads; this module only frames it.

use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::warn;

use crate::model::{Folder, Job};

const SEPARATOR: &str = "----------------------------------------";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Create the parent directory and write the run header.
pub fn write_header(path: &Path, job: &Job) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(path = %path.display(), error = %e, "could not create log directory");
            return;
        }
    }
    let started = job
        .started_at
        .map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| Local::now().format(TIME_FORMAT).to_string());
    let header = format!(
        "Started:  {}\nJob:      {}\nBatch:    {}\nCores:    {}\n{}\n",
        started,
        job.name,
        job.bat_path.display(),
        job.required_cores,
        SEPARATOR,
    );
    if let Err(e) = std::fs::write(path, header) {
        warn!(path = %path.display(), error = %e, "could not write log header");
    }
}

/// Append the run footer: ended-at, status label, exit code (or "unknown").
pub fn append_footer(path: &Path, job: &Job, status_label: &str) {
    let ended = job
        .ended_at
        .map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| Local::now().format(TIME_FORMAT).to_string());
    let exit = job
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let footer = format!("\nEnded:    {ended}\nStatus:   {status_label}\nExitCode: {exit}\n");
    append(path, &footer);
}

/// Append a timestamped free-form message.
pub fn append_line(path: &Path, message: &str) {
    let line = format!("[{}] {message}\n", Local::now().format(TIME_FORMAT));
    append(path, &line);
}

fn append(path: &Path, text: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(text.as_bytes()));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "could not append to log");
    }
}

/// Write `batch_runner_summary.log` into the folder's own directory.
///
/// Its presence marks the folder as done and blocks re-enrollment.
pub fn write_folder_summary(folder: &Folder) {
    let path = folder.path.join("batch_runner_summary.log");
    let mut body = format!(
        "Batch summary for {}\nFinished: {}\n{}\n",
        folder.name,
        Local::now().format(TIME_FORMAT),
        SEPARATOR,
    );
    for job in &folder.jobs {
        let elapsed = match (job.started_at, job.ended_at) {
            (Some(s), Some(e)) => format_elapsed(s, e),
            _ => "--:--:--".to_string(),
        };
        body.push_str(&format!(
            "{:<30} {:<10} start={} end={} elapsed={} exit={}\n",
            job.name,
            job.status.as_str(),
            job.started_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
            job.ended_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
            elapsed,
            job.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into()),
        ));
    }
    if let Err(e) = std::fs::write(&path, body) {
        warn!(path = %path.display(), error = %e, "could not write folder summary");
    }
}

fn format_elapsed(start: DateTime<Local>, end: DateTime<Local>) -> String {
    let secs = (end - start).num_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

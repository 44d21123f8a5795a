//! Per-job supervision: launch the script, tee its output into the run log,
//! wait for the root process to exit, drain its descendants, then report
//! back to the scheduler.
//!
//! The supervisor is the only holder of the OS child handle. It never
//! touches job or folder state; every observation funnels through
//! [`Scheduler::handle_exit`](crate::scheduler::Scheduler::handle_exit).

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::process_ctl::{NativeProcessControls, ProcessControls};
use crate::proctree;
use crate::scheduler::Scheduler;

/// Poll interval while waiting for a finished job's descendants to exit.
const DRAIN_POLL: Duration = Duration::from_secs(2);

/// Consecutive empty process-table reads required before the tree counts as
/// drained. A single empty snapshot can be a transient misread while a
/// grandchild is still alive.
const DRAIN_CONFIRMATIONS: u32 = 2;

/// Everything the supervisor needs to start one run. Produced by the
/// scheduler under its lock; consumed here outside it.
#[derive(Debug, Clone)]
pub(crate) struct LaunchSpec {
    pub job_id: String,
    pub bat_path: PathBuf,
    pub log_path: PathBuf,
    pub show_console: bool,
}

/// Spawn the child and its supervision threads. Returns the root PID so the
/// scheduler can register it for cancellation.
pub(crate) fn launch(spec: LaunchSpec, scheduler: Scheduler) -> Result<u32> {
    let working_dir = spec
        .bat_path
        .parent()
        .filter(|p| p.is_dir())
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok());

    let mut cmd = shell_command(&spec.bat_path, spec.show_console);
    if let Some(dir) = &working_dir {
        cmd.current_dir(dir);
    }
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {}", spec.bat_path.display()))?;

    let pid = child.id();
    NativeProcessControls.elevate(pid);
    info!(job_id = %spec.job_id, pid, script = %spec.bat_path.display(), "job started");

    // The run log was already opened with a header by the scheduler; the
    // child's merged output is appended verbatim between header and footer.
    let log = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_path)
    {
        Ok(f) => Some(Arc::new(Mutex::new(f))),
        Err(e) => {
            warn!(path = %spec.log_path.display(), error = %e, "run log unavailable, output discarded");
            None
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let t_stdout = stdout.map(|s| {
        let log = log.clone();
        std::thread::spawn(move || tee(s, log))
    });
    let t_stderr = stderr.map(|s| {
        let log = log.clone();
        std::thread::spawn(move || tee(s, log))
    });

    let job_id = spec.job_id;
    std::thread::spawn(move || {
        let exit_code = match child.wait() {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "wait on child failed");
                None
            }
        };
        if let Some(t) = t_stdout {
            let _ = t.join();
        }
        if let Some(t) = t_stderr {
            let _ = t.join();
        }

        drain_descendants(&job_id, pid);
        debug!(job_id = %job_id, ?exit_code, "root and descendants exited");
        scheduler.handle_exit(&job_id, exit_code);
    });

    Ok(pid)
}

/// The root process has exited; wait until every transitive child has too.
fn drain_descendants(job_id: &str, pid: u32) {
    await_drained(
        || {
            let remaining = proctree::descendants(pid);
            if !remaining.is_empty() {
                debug!(job_id = %job_id, remaining = remaining.len(), "waiting for descendants");
            }
            remaining.len()
        },
        DRAIN_POLL,
    );
}

/// Poll `remaining` until it reports zero [`DRAIN_CONFIRMATIONS`] times in a
/// row; a non-empty read resets the count. Returns the number of polls taken.
fn await_drained(mut remaining: impl FnMut() -> usize, interval: Duration) -> u32 {
    let mut empty_reads = 0;
    let mut polls = 0;
    loop {
        polls += 1;
        if remaining() == 0 {
            empty_reads += 1;
            if empty_reads >= DRAIN_CONFIRMATIONS {
                return polls;
            }
        } else {
            empty_reads = 0;
        }
        std::thread::sleep(interval);
    }
}

/// Copy raw bytes from a child pipe into the shared log file.
fn tee<R: Read>(mut stream: R, log: Option<Arc<Mutex<File>>>) {
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Some(log) = &log
                    && let Ok(mut f) = log.lock()
                {
                    let _ = f.write_all(&buf[..n]);
                }
            }
        }
    }
}

#[cfg(windows)]
fn shell_command(script: &Path, show_console: bool) -> Command {
    use std::os::windows::process::CommandExt;
    use windows::Win32::System::Threading::CREATE_NO_WINDOW;

    let mut cmd = Command::new("cmd.exe");
    cmd.arg("/C").arg("call").arg(script);
    if !show_console {
        cmd.creation_flags(CREATE_NO_WINDOW.0);
    }
    cmd
}

#[cfg(not(windows))]
fn shell_command(script: &Path, _show_console: bool) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg(script);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_needs_two_consecutive_empty_reads() {
        // A lone empty snapshot between live reads must not end the wait.
        let mut reads = [2usize, 0, 1, 0, 0].into_iter();
        let polls = await_drained(|| reads.next().unwrap_or(0), Duration::from_millis(1));
        assert_eq!(polls, 5);
    }

    #[test]
    fn drain_confirms_a_quiet_tree_on_the_second_read() {
        let polls = await_drained(|| 0, Duration::from_millis(1));
        assert_eq!(polls, 2);
    }

    #[test]
    fn drain_resets_the_count_on_a_live_read() {
        let mut reads = [0usize, 3, 0, 0].into_iter();
        let polls = await_drained(|| reads.next().unwrap_or(0), Duration::from_millis(1));
        assert_eq!(polls, 4);
    }
}

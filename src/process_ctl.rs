//! Best-effort process control: tree termination and priority elevation.

use tracing::debug;

use crate::proctree;

/// Force-terminate a process and every descendant it has spawned.
///
/// The root goes down first so it cannot replace children faster than they
/// are reaped; the descendant set was snapshotted beforehand. Every kill is
/// best-effort: already-exited processes are not an error.
pub fn kill_tree(root_pid: u32) {
    let kids = proctree::descendants(root_pid);
    debug!(root_pid, descendants = kids.len(), "terminating process tree");
    kill_one(root_pid);
    for pid in kids {
        kill_one(pid);
    }
}

#[cfg(unix)]
fn kill_one(pid: u32) {
    // SAFETY: kill(2) accepts any pid/signal combination.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: already gone.
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pid, error = %err, "kill failed");
        }
    }
}

#[cfg(windows)]
fn kill_one(pid: u32) {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    unsafe {
        match OpenProcess(PROCESS_TERMINATE, false, pid) {
            Ok(handle) => {
                if let Err(e) = TerminateProcess(handle, 1) {
                    debug!(pid, error = %e, "TerminateProcess failed");
                }
                let _ = CloseHandle(handle);
            }
            // Process already gone or inaccessible; nothing more to do.
            Err(e) => debug!(pid, error = %e, "OpenProcess failed"),
        }
    }
}

/// Capability seam for raising a child's scheduling priority. Platforms
/// without a sensible elevation are no-ops.
pub trait ProcessControls {
    /// Raise `pid` to an elevated priority class. Permission failures are
    /// ignored.
    fn elevate(&self, pid: u32);
}

/// The platform-native implementation used by the supervisor.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeProcessControls;

impl ProcessControls for NativeProcessControls {
    #[cfg(windows)]
    fn elevate(&self, pid: u32) {
        use windows::Win32::Foundation::CloseHandle;
        use windows::Win32::System::Threading::{
            OpenProcess, SetPriorityClass, ABOVE_NORMAL_PRIORITY_CLASS, PROCESS_SET_INFORMATION,
        };

        unsafe {
            if let Ok(handle) = OpenProcess(PROCESS_SET_INFORMATION, false, pid) {
                if let Err(e) = SetPriorityClass(handle, ABOVE_NORMAL_PRIORITY_CLASS) {
                    debug!(pid, error = %e, "priority elevation refused");
                }
                let _ = CloseHandle(handle);
            }
        }
    }

    #[cfg(not(windows))]
    fn elevate(&self, _pid: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_tree_tolerates_missing_root() {
        kill_tree(u32::MAX - 11);
    }

    #[test]
    fn elevate_is_best_effort() {
        NativeProcessControls.elevate(std::process::id());
    }

    #[cfg(unix)]
    #[test]
    fn kill_tree_stops_a_live_child() {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleeper");
        let pid = child.id();
        kill_tree(pid);
        // Reap; the child must have been signalled rather than run 30s.
        let mut child = child;
        let status = child.wait().expect("wait");
        assert!(!status.success());
    }
}

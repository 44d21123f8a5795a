//! Process-tree enumeration from a single OS process-table snapshot.

use std::collections::{HashMap, HashSet, VecDeque};
use sysinfo::{ProcessesToUpdate, System};

/// All transitive descendant PIDs of `root_pid`, excluding the root itself.
///
/// Takes one snapshot of the process table, builds a parent→children map,
/// and expands breadth-first. A missing or already-exited root simply has no
/// children in the snapshot and yields the empty set.
pub fn descendants(root_pid: u32) -> HashSet<u32> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }

    let mut found = HashSet::new();
    let mut frontier = VecDeque::from([root_pid]);
    while let Some(pid) = frontier.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if found.insert(kid) {
                    frontier.push_back(kid);
                }
            }
        }
    }
    found
}

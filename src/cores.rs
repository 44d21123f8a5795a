//! Physical core probe. Queried once at startup; the scheduler treats the
//! result as the fixed budget for the life of the process.

use sysinfo::{CpuRefreshKind, RefreshKind, System};

/// Total physical cores, falling back to the logical count when the
/// platform cannot report physical topology. Never less than 1.
pub fn total_physical_cores() -> u32 {
    if let Some(n) = System::physical_core_count() {
        return n.max(1) as u32;
    }
    let sys = System::new_with_specifics(
        RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing()),
    );
    (sys.cpus().len().max(1)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_reports_at_least_one_core() {
        assert!(total_physical_cores() >= 1);
    }
}

//! End-to-end scenarios: real children spawned through the platform shell,
//! temp roots, event-channel waits.
//!
//! Script bodies double as core declarations: the scanner picks up `-np N`
//! from an `echo` line that the shell happily executes.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use batch_runner::control::Controller;
use batch_runner::model::{FolderStatus, JobStatus, Settings, Snapshot};
use batch_runner::scheduler::{Event, Scheduler};
use batch_runner::store::{StateStore, STATE_FILE_NAME};

/// Owns an isolated temp root; dropping it cleans everything up.
struct Harness {
    tmp: tempfile::TempDir,
    controller: Controller,
}

impl Harness {
    fn new(cores: u32) -> Self {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let store = StateStore::new(tmp.path().join(STATE_FILE_NAME));
        let scheduler = Scheduler::new(cores, tmp.path().join("logs"), store);
        Harness {
            tmp,
            controller: Controller::new(scheduler),
        }
    }

    fn scheduler(&self) -> &Scheduler {
        self.controller.scheduler()
    }

    /// Write a case folder with the given known scripts.
    fn make_case(&self, name: &str, scripts: &[(&str, &str)]) -> PathBuf {
        let dir = self.tmp.path().join(name);
        std::fs::create_dir_all(&dir).expect("create case dir");
        for (script, body) in scripts {
            std::fs::write(dir.join(script), body).expect("write script");
        }
        dir
    }

    fn snapshot(&self) -> Snapshot {
        self.scheduler().snapshot()
    }

    fn job_status(&self, name: &str) -> Option<JobStatus> {
        self.snapshot()
            .folders
            .iter()
            .flat_map(|f| f.jobs.clone())
            .find(|j| j.name == name)
            .map(|j| j.status)
    }

    /// Poll until `pred` holds or the deadline passes.
    fn wait_until(&self, timeout: Duration, pred: impl Fn(&Snapshot) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if pred(&self.snapshot()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
    }

    /// All run-log contents under `logs/`, concatenated.
    fn all_logs(&self) -> String {
        let mut out = String::new();
        if let Ok(entries) = std::fs::read_dir(self.tmp.path().join("logs")) {
            for entry in entries.flatten() {
                if let Ok(text) = std::fs::read_to_string(entry.path()) {
                    out.push_str(&text);
                }
            }
        }
        out
    }
}

fn recv_queue_finished(rx: &std::sync::mpsc::Receiver<Event>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(Event::QueueFinished) => return true,
            Ok(Event::StateChanged) => continue,
            Err(_) => return false,
        }
    }
}

const QUICK_OK: &str = "echo solver -np 2\nexit 0\n";

// ── single job ────────────────────────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn single_small_job_runs_to_completion() {
    let h = Harness::new(4);
    let case = h.make_case("case", &[("solve.bat", QUICK_OK)]);
    h.controller.add_folder(&case).expect("folder accepted");

    let events = h.scheduler().subscribe();
    h.controller.start_queue();

    assert!(recv_queue_finished(&events, Duration::from_secs(30)));

    let snap = h.snapshot();
    let job = &snap.folders[0].jobs[0];
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.exit_code, Some(0));
    assert_eq!(job.required_cores, 2);
    assert!(job.started_at.is_some());
    assert!(job.ended_at >= job.started_at);
    assert_eq!(snap.folders[0].status, FolderStatus::Completed);

    // Cores released, queue paused, and the finish fired exactly once.
    let counts = h.scheduler().observe();
    assert_eq!(counts.used_cores, 0);
    assert!(!h.scheduler().is_queue_running());
    std::thread::sleep(Duration::from_millis(200));
    assert!(!recv_queue_finished(&events, Duration::from_millis(100)));

    // Run log is framed, and the folder summary marks the case done.
    let logs = h.all_logs();
    assert!(logs.contains("Started:"));
    assert!(logs.contains("Status:   Completed"));
    assert!(case.join("batch_runner_summary.log").is_file());
}

// ── parallel across folders ───────────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn folders_run_in_parallel_under_the_budget() {
    let slow = "echo solver -np 4\nsleep 3\n";
    let h = Harness::new(8);
    let a = h.make_case("a", &[("solve.bat", slow)]);
    let b = h.make_case("b", &[("solve.bat", slow)]);
    let c = h.make_case("c", &[("solve.bat", "echo solver -np 4\nexit 0\n")]);
    h.controller.add_folder(&a).unwrap();
    h.controller.add_folder(&b).unwrap();
    h.controller.add_folder(&c).unwrap();

    let events = h.scheduler().subscribe();
    h.controller.start_queue();

    // Both four-core jobs must be running at once; the third waits.
    assert!(h.wait_until(Duration::from_secs(10), |snap| {
        snap.folders[0].jobs[0].status == JobStatus::Running
            && snap.folders[1].jobs[0].status == JobStatus::Running
    }));
    let counts = h.scheduler().observe();
    assert_eq!(counts.used_cores, 8);
    assert_eq!(counts.available_cores, 0);
    assert_eq!(h.snapshot().folders[2].jobs[0].status, JobStatus::Queued);

    assert!(recv_queue_finished(&events, Duration::from_secs(60)));
    assert!(
        h.snapshot()
            .folders
            .iter()
            .all(|f| f.status == FolderStatus::Completed)
    );
}

// ── sequential within a folder ────────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn jobs_within_a_folder_run_one_at_a_time() {
    let h = Harness::new(4);
    let case = h.make_case(
        "case",
        &[
            ("mesh.bat", "echo mesh -np 2\nsleep 2\n"),
            ("solve.bat", QUICK_OK),
        ],
    );
    h.controller.add_folder(&case).unwrap();

    let events = h.scheduler().subscribe();
    h.controller.start_queue();

    // Two cores stay free while mesh runs, but solve must wait its turn.
    assert!(h.wait_until(Duration::from_secs(10), |snap| {
        snap.folders[0].jobs[0].status == JobStatus::Running
    }));
    assert_eq!(h.job_status("solve.bat"), Some(JobStatus::Queued));
    assert!(h.scheduler().observe().available_cores >= 2);

    assert!(recv_queue_finished(&events, Duration::from_secs(60)));
    let snap = h.snapshot();
    let mesh = snap.folders[0].jobs[0].clone();
    let solve = snap.folders[0].jobs[1].clone();
    assert_eq!(mesh.status, JobStatus::Completed);
    assert_eq!(solve.status, JobStatus::Completed);
    assert!(solve.started_at >= mesh.ended_at);
}

// ── over-commit denial ────────────────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn oversized_job_is_never_admitted() {
    let h = Harness::new(2);
    let case = h.make_case("case", &[("solve.bat", "echo solver -np 4\nexit 0\n")]);
    h.controller.add_folder(&case).unwrap();

    let events = h.scheduler().subscribe();
    h.controller.start_queue();

    assert!(!recv_queue_finished(&events, Duration::from_secs(2)));
    assert_eq!(h.job_status("solve.bat"), Some(JobStatus::Queued));
    assert_eq!(h.scheduler().observe().running, 0);
    assert!(h.scheduler().is_queue_running());

    h.controller.pause_queue();
}

// ── auto-retry ────────────────────────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn failed_job_is_retried_once_then_left_failed() {
    let h = Harness::new(4);
    let settings = Settings {
        auto_retry_failed_jobs: true,
        ..Settings::default()
    };
    h.scheduler().set_settings(settings);

    let case = h.make_case("case", &[("solve.bat", "echo solver -np 2\nexit 3\n")]);
    h.controller.add_folder(&case).unwrap();

    let events = h.scheduler().subscribe();
    h.controller.start_queue();

    assert!(recv_queue_finished(&events, Duration::from_secs(30)));
    let snap = h.snapshot();
    let job = &snap.folders[0].jobs[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.exit_code, Some(3));

    // First run's footer records the retry, the second the final failure.
    let logs = h.all_logs();
    assert!(logs.contains("Status:   Failed (auto retry)"));
    assert!(logs.contains("Status:   Failed\n"));
}

// ── restart of a running job ──────────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn restarting_a_running_job_requeues_it() {
    let h = Harness::new(4);
    let case = h.make_case("case", &[("solve.bat", "echo solver -np 2\nsleep 30\n")]);
    h.controller.add_folder(&case).unwrap();

    let events = h.scheduler().subscribe();
    h.controller.start_queue();

    assert!(h.wait_until(Duration::from_secs(10), |snap| {
        snap.folders[0].jobs[0].status == JobStatus::Running
    }));
    let job_id = h.snapshot().folders[0].jobs[0].id.clone();
    assert!(h.controller.restart_job(&job_id));

    // The killed run is closed out as Restarted, then admission re-elects it.
    let deadline = Instant::now() + Duration::from_secs(20);
    while !h.all_logs().contains("Status:   Restarted") {
        assert!(Instant::now() < deadline, "no Restarted footer seen");
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(h.wait_until(Duration::from_secs(10), |snap| {
        snap.folders[0].jobs[0].status == JobStatus::Running
    }));
    assert_eq!(h.snapshot().folders[0].jobs[0].retry_count, 0);

    // Wind the test down: cancel the fresh run.
    assert!(h.controller.cancel_job(&job_id));
    assert!(recv_queue_finished(&events, Duration::from_secs(30)));
    let job = &h.snapshot().folders[0].jobs[0];
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.ended_at.is_some());
}

// ── cancellation of a queued job ──────────────────────────────────────────────

#[test]
fn cancelling_a_queued_job_is_immediate() {
    let h = Harness::new(4);
    let case = h.make_case("case", &[("solve.bat", QUICK_OK)]);
    h.controller.add_folder(&case).unwrap();

    let job_id = h.snapshot().folders[0].jobs[0].id.clone();
    assert!(h.controller.cancel_job(&job_id));

    let snap = h.snapshot();
    let job = &snap.folders[0].jobs[0];
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.started_at.is_none());
    assert!(job.ended_at.is_some());
    assert_eq!(snap.folders[0].status, FolderStatus::Cancelled);

    // Terminal jobs are left alone.
    assert!(!h.controller.cancel_job(&job_id));
}

// ── crash recovery ────────────────────────────────────────────────────────────

#[test]
fn running_jobs_in_a_loaded_snapshot_are_requeued() {
    let tmp = tempfile::tempdir().unwrap();
    let state_path = tmp.path().join(STATE_FILE_NAME);

    // A snapshot persisted mid-flight: one job still marked Running.
    let raw = serde_json::json!({
        "Folders": [{
            "Id": "f-1", "Name": "case", "Path": "/work/case",
            "Status": "Running", "IsExpanded": true,
            "Jobs": [{
                "Id": "j-1", "Name": "solve.bat", "BatPath": "/work/case/solve.bat",
                "RequiredCores": 4, "Status": "Running",
                "AddedAt": "2026-07-30T08:00:00+00:00",
                "StartedAt": "2026-07-30T08:05:00+00:00",
                "EndedAt": null, "ExitCode": null,
                "LogPath": "/tmp/old.log", "RetryCount": 0
            }]
        }],
        "Settings": { "AutoRetryFailedJobs": false, "ShowConsoleWindow": false }
    });
    std::fs::write(&state_path, serde_json::to_string_pretty(&raw).unwrap()).unwrap();

    let scheduler = Scheduler::new(8, tmp.path().join("logs"), StateStore::new(&state_path));
    let snap = scheduler.snapshot();
    let job = &snap.folders[0].jobs[0];
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.started_at.is_none());
    assert!(job.ended_at.is_none());
    assert!(job.exit_code.is_none());
    assert!(job.log_path.is_none());
    assert_eq!(snap.folders[0].status, FolderStatus::Queued);

    // Nothing is spawned until an admission pass elects the job.
    assert_eq!(scheduler.observe().running, 0);
    assert!(!scheduler.is_queue_running());
}

// ── failed folder is skipped, the rest continues ──────────────────────────────

#[cfg(unix)]
#[test]
fn failed_folder_does_not_block_other_folders() {
    let h = Harness::new(4);
    let bad = h.make_case(
        "bad",
        &[
            ("mesh.bat", "echo mesh -np 2\nexit 1\n"),
            ("solve.bat", QUICK_OK),
        ],
    );
    let good = h.make_case("good", &[("solve.bat", QUICK_OK)]);
    h.controller.add_folder(&bad).unwrap();
    h.controller.add_folder(&good).unwrap();

    let events = h.scheduler().subscribe();
    h.controller.start_queue();

    // The good folder completes even though the bad one died first in order.
    assert!(h.wait_until(Duration::from_secs(30), |snap| {
        snap.folders[1].status == FolderStatus::Completed
    }));
    assert!(h.wait_until(Duration::from_secs(10), |snap| {
        snap.folders[0].status == FolderStatus::Failed
    }));
    // solve.bat in the dead folder stays queued behind the failure, so the
    // queue never reports finished; it sits stalled until user action.
    assert!(!recv_queue_finished(&events, Duration::from_secs(1)));
    assert_eq!(h.job_status("solve.bat"), Some(JobStatus::Queued));
    h.controller.pause_queue();
}

// ── persistence across controller lifetimes ───────────────────────────────────

#[cfg(unix)]
#[test]
fn completed_queue_survives_a_reload() {
    let tmp = tempfile::tempdir().expect("create tempdir");
    let case = tmp.path().join("case");
    std::fs::create_dir_all(&case).unwrap();
    std::fs::write(case.join("solve.bat"), QUICK_OK).unwrap();

    {
        let store = StateStore::new(tmp.path().join(STATE_FILE_NAME));
        let scheduler = Scheduler::new(4, tmp.path().join("logs"), store);
        let controller = Controller::new(scheduler);
        controller.add_folder(&case).unwrap();
        let events = controller.scheduler().subscribe();
        controller.start_queue();
        assert!(recv_queue_finished(&events, Duration::from_secs(30)));
    }

    let store = StateStore::new(tmp.path().join(STATE_FILE_NAME));
    let scheduler = Scheduler::new(4, tmp.path().join("logs"), store);
    let snap = scheduler.snapshot();
    assert_eq!(snap.folders.len(), 1);
    assert_eq!(snap.folders[0].status, FolderStatus::Completed);
    assert_eq!(snap.folders[0].jobs[0].status, JobStatus::Completed);
}

// ── binary smoke tests ────────────────────────────────────────────────────────

/// Path to the compiled binary: walk up from the test executable's directory.
fn binary() -> PathBuf {
    let mut p = std::env::current_exe().expect("current exe");
    p.pop();
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("batch-runner");
    if cfg!(windows) {
        p.set_extension("exe");
    }
    p
}

fn run_cli(args: &[&str]) -> (bool, String) {
    let output = std::process::Command::new(binary())
        .args(args)
        .output()
        .expect("run binary");
    (
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).into_owned(),
    )
}

#[test]
fn cli_add_and_list_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let case = tmp.path().join("case");
    std::fs::create_dir_all(&case).unwrap();
    std::fs::write(case.join("solve.bat"), QUICK_OK).unwrap();
    let root = tmp.path().to_str().unwrap();

    let (ok, stdout) = run_cli(&["add", "--root", root, case.to_str().unwrap()]);
    assert!(ok, "add failed: {stdout}");
    let folder: serde_json::Value = serde_json::from_str(&stdout).expect("folder JSON");
    assert_eq!(folder["Jobs"].as_array().map(Vec::len), Some(1));

    let (ok, stdout) = run_cli(&["list", "--root", root]);
    assert!(ok, "list failed: {stdout}");
    let view: serde_json::Value = serde_json::from_str(&stdout).expect("view JSON");
    assert_eq!(view["Folders"].as_array().map(Vec::len), Some(1));
    assert_eq!(view["Folders"][0]["Jobs"][0]["Status"], "Queued");
}

#[cfg(unix)]
#[test]
fn cli_run_processes_the_queue() {
    let tmp = tempfile::tempdir().unwrap();
    let case = tmp.path().join("case");
    std::fs::create_dir_all(&case).unwrap();
    std::fs::write(case.join("solve.bat"), QUICK_OK).unwrap();
    let root = tmp.path().to_str().unwrap();

    let (ok, stdout) = run_cli(&[
        "run",
        "--root",
        root,
        "--cores",
        "4",
        case.to_str().unwrap(),
    ]);
    assert!(ok, "run failed: {stdout}");
    let view: serde_json::Value = serde_json::from_str(&stdout).expect("view JSON");
    assert_eq!(view["Folders"][0]["Status"], "Completed");
    assert_eq!(view["Cores"]["completed"], 1);
}

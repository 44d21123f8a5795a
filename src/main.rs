//! batch-runner — entry point
//!
//! Stdout carries the command results as JSON; tracing logs go to stderr.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use batch_runner::control::Controller;
use batch_runner::cores;
use batch_runner::scheduler::{Event, Scheduler};
use batch_runner::store::{resolve_root, StateStore, STATE_FILE_NAME};

#[derive(Debug, Parser)]
#[command(name = "batch-runner")]
#[command(about = "Single-host batch orchestrator for simulation scripts", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the queue and process it until nothing is left to run.
    Run {
        /// Override the state/log root directory.
        #[arg(long)]
        root: Option<String>,

        /// Override the physical-core budget.
        #[arg(long)]
        cores: Option<u32>,

        /// Re-queue a failed job once before giving up.
        #[arg(long)]
        auto_retry: bool,

        /// Show a console window for each child (Windows only).
        #[arg(long)]
        show_console: bool,

        /// Folders to enroll before starting.
        folders: Vec<String>,
    },

    /// Enroll a folder of known scripts without running it.
    Add {
        /// Override the state/log root directory.
        #[arg(long)]
        root: Option<String>,

        /// Folder to enroll.
        path: String,
    },

    /// Enroll a single script as a one-job folder.
    AddScript {
        /// Override the state/log root directory.
        #[arg(long)]
        root: Option<String>,

        /// Script to enroll.
        path: String,
    },

    /// Print core usage and the current queue as JSON.
    List {
        /// Override the state/log root directory.
        #[arg(long)]
        root: Option<String>,
    },

    /// Remove a folder from the queue.
    Remove {
        /// Override the state/log root directory.
        #[arg(long)]
        root: Option<String>,

        /// Folder ID.
        folder_id: String,
    },

    /// Cancel a job.
    Cancel {
        /// Override the state/log root directory.
        #[arg(long)]
        root: Option<String>,

        /// Job ID.
        job_id: String,
    },

    /// Reset a job to the queue.
    Restart {
        /// Override the state/log root directory.
        #[arg(long)]
        root: Option<String>,

        /// Job ID.
        job_id: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout remains JSON-only.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn build_controller(cli_root: Option<&str>, cores_override: Option<u32>) -> Controller {
    let root = resolve_root(cli_root);
    let store = StateStore::new(root.join(STATE_FILE_NAME));
    let total = cores_override.unwrap_or_else(cores::total_physical_cores);
    Controller::new(Scheduler::new(total, root.join("logs"), store))
}

fn print_view(controller: &Controller) {
    let (counts, snapshot) = controller.observe();
    let view = serde_json::json!({
        "Cores": counts,
        "Folders": snapshot.folders,
    });
    println!("{}", serde_json::to_string_pretty(&view).unwrap_or_default());
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            root,
            cores,
            auto_retry,
            show_console,
            folders,
        } => {
            let controller = build_controller(root.as_deref(), cores);
            let scheduler = controller.scheduler().clone();

            if auto_retry || show_console {
                let mut settings = scheduler.settings();
                settings.auto_retry_failed_jobs |= auto_retry;
                settings.show_console_window |= show_console;
                scheduler.set_settings(settings);
            }
            for path in &folders {
                if controller.add_folder(Path::new(path)).is_none() {
                    warn!(path = %path, "folder not enrolled");
                }
            }

            let events = scheduler.subscribe();
            controller.start_queue();

            let stalled = loop {
                match events.recv_timeout(Duration::from_millis(500)) {
                    Ok(Event::QueueFinished) => break false,
                    Ok(Event::StateChanged) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        let counts = scheduler.observe();
                        if scheduler.is_queue_running() && counts.running == 0 && counts.queued > 0
                        {
                            // Every queued head is either oversized for the
                            // budget or behind a failed/cancelled job.
                            warn!("queue stalled: nothing can be admitted");
                            scheduler.pause_queue();
                            break true;
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break false,
                }
            };

            scheduler.shutdown();
            print_view(&controller);

            let counts = scheduler.observe();
            if stalled || counts.failed > 0 || counts.cancelled > 0 {
                std::process::exit(1);
            }
        }

        Command::Add { root, path } => {
            let controller = build_controller(root.as_deref(), None);
            match controller.add_folder(Path::new(&path)) {
                Some(folder) => println!(
                    "{}",
                    serde_json::to_string_pretty(&folder).unwrap_or_default()
                ),
                None => {
                    eprintln!("folder not accepted: {path}");
                    std::process::exit(1);
                }
            }
        }

        Command::AddScript { root, path } => {
            let controller = build_controller(root.as_deref(), None);
            match controller.add_job(Path::new(&path)) {
                Some(folder) => println!(
                    "{}",
                    serde_json::to_string_pretty(&folder).unwrap_or_default()
                ),
                None => {
                    eprintln!("script not accepted: {path}");
                    std::process::exit(1);
                }
            }
        }

        Command::List { root } => {
            let controller = build_controller(root.as_deref(), None);
            print_view(&controller);
        }

        Command::Remove { root, folder_id } => {
            let controller = build_controller(root.as_deref(), None);
            if !controller.remove_folder(&folder_id) {
                eprintln!("no such folder: {folder_id}");
                std::process::exit(1);
            }
            print_view(&controller);
        }

        Command::Cancel { root, job_id } => {
            let controller = build_controller(root.as_deref(), None);
            if !controller.cancel_job(&job_id) {
                eprintln!("job not cancellable: {job_id}");
                std::process::exit(1);
            }
            print_view(&controller);
        }

        Command::Restart { root, job_id } => {
            let controller = build_controller(root.as_deref(), None);
            if !controller.restart_job(&job_id) {
                eprintln!("no such job: {job_id}");
                std::process::exit(1);
            }
            print_view(&controller);
        }
    }
    Ok(())
}

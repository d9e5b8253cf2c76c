mod config;
mod launcher;
mod run;
mod schedulers;
mod script;
mod status;

use clap::{ArgAction, Args, Parser, Subcommand};
use config::{ConfigErrors, LauncherConfig, RunFilter};
use launcher::Launcher;
use run::RunConfig;
use schedulers::{dry_run::DryRunScheduler, JobId, Scheduler, Schedulers};
use status::{JobState, Sacct};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Generate Slurm job scripts for project3 from a run table and submit them
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Run table to read
    #[arg(short, long, default_value = "runs.yaml", global = true)]
    config: PathBuf,

    /// Increase log verbosity, RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Selection {
    /// Only use runs with this job name, can be repeated
    #[arg(short, long = "run")]
    runs: Vec<String>,

    /// Only use runs of this profile, can be repeated
    #[arg(short, long = "profile")]
    profiles: Vec<String>,
}

impl From<Selection> for RunFilter {
    fn from(selection: Selection) -> Self {
        Self {
            names: selection.runs,
            profiles: selection.profiles,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the job scripts without submitting them
    Render {
        #[command(flatten)]
        selection: Selection,
    },
    /// Submit the selected runs, each one independently
    Submit {
        #[command(flatten)]
        selection: Selection,

        /// Write the scripts into this directory instead of calling the scheduler
        #[arg(long, value_name = "DIR")]
        dry_run: Option<PathBuf>,
    },
    /// Show the state of submitted jobs
    Status {
        /// Job ids as printed by `submit`
        #[arg(required = true)]
        ids: Vec<String>,

        /// Block until all jobs finished
        #[arg(short, long)]
        wait: bool,

        /// Seconds between two polls, overrides status.poll
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        poll: Option<u64>,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
    },
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path) -> Result<LauncherConfig, ConfigErrors> {
    let mut config = LauncherConfig::load(path)?;

    if config.preflight_checks() {
        error!("Found errors in {}, refusing to continue", path.display());
        return Err(ConfigErrors::Preflight);
    }

    Ok(config)
}

/// returns true if every run was submitted
fn submit<S: Scheduler>(launcher: Launcher<S>, runs: Vec<RunConfig>) -> bool {
    let total = runs.len();
    let results = launcher.submit_batch(runs);
    let failed = results.iter().filter(|result| result.is_err()).count();

    for id in results.iter().flatten() {
        println!("{id}");
    }

    info!("Submitted {}/{total} job(s)", total - failed);
    failed == 0
}

fn execute(cli: Cli) -> Result<bool, ConfigErrors> {
    match cli.command {
        Command::Render { selection } => {
            let config = load_config(&cli.config)?;
            let runs = config.resolve(&selection.into())?;
            let mut success = true;

            for run in runs {
                match script::render(&run, &config.script) {
                    Ok(script) => println!("{script}"),
                    Err(e) => {
                        error!("Failed to render {}: {e}", run.job_name);
                        success = false;
                    }
                }
            }

            Ok(success)
        }
        Command::Submit { selection, dry_run } => {
            let config = load_config(&cli.config)?;
            let runs = config.resolve(&selection.into())?;

            let scheduler = match dry_run {
                Some(dir) => Schedulers::DryRun(DryRunScheduler::new(dir)),
                None => config.scheduler()?,
            };

            Ok(submit(Launcher::new(scheduler, config.script), runs))
        }
        Command::Status {
            ids,
            wait,
            poll,
            timeout,
        } => {
            // a missing run table only means the sacct defaults are used
            let status = match LauncherConfig::load(&cli.config) {
                Ok(config) => config.status,
                Err(ConfigErrors::FileNotFound(_)) => Default::default(),
                Err(e) => return Err(e),
            };
            let mut sacct = Sacct::new(&status);
            if let Some(poll) = poll {
                sacct = sacct.with_poll(Duration::from_secs(poll));
            }
            let ids = ids.into_iter().map(JobId::new).collect::<Vec<_>>();

            let records = if wait {
                sacct.wait_for(&ids, Duration::from_secs(timeout))
            } else {
                sacct.query(&ids)
            };

            match records {
                Ok(records) => {
                    for record in &records {
                        println!(
                            "{}\t{}\t{}\t{}\t{}",
                            record.id, record.name, record.state, record.exit_code, record.elapsed
                        );
                    }

                    Ok(!records.iter().any(|record| {
                        record.state.is_terminal() && record.state != JobState::Completed
                    }))
                }
                Err(e) => {
                    error!("Failed to query job status: {e}");
                    Ok(false)
                }
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match execute(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

//! Job state lookup through `sacct`.
//!
//! Submission itself never waits on a job, this is only used by the `status` command.

use crate::{config::StatusConfig, schedulers::JobId};
use itertools::Itertools;
use serde::Deserialize;
use std::{
    fmt, io,
    path::PathBuf,
    process::Command,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const FORMAT: &str = "JobID,JobName,State,ExitCode,Elapsed";

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("sacct failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },
    #[error("Failed to read sacct output")]
    Decode(#[from] csv::Error),
    #[error("Jobs still running after {0:?}: {1}")]
    Timeout(Duration, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completing,
    Completed,
    Cancelled,
    Failed,
    Timeout,
    OutOfMemory,
    NodeFail,
    Unknown(String),
}

impl JobState {
    /// states such as `CANCELLED by 1234` only look at the first word
    pub fn parse(state: &str) -> Self {
        match state.split_whitespace().next().unwrap_or("") {
            "PENDING" | "REQUEUED" | "RESIZING" | "SUSPENDED" => Self::Pending,
            "RUNNING" => Self::Running,
            "COMPLETING" => Self::Completing,
            "COMPLETED" => Self::Completed,
            "CANCELLED" => Self::Cancelled,
            "FAILED" | "BOOT_FAIL" | "DEADLINE" => Self::Failed,
            "TIMEOUT" => Self::Timeout,
            "OUT_OF_MEMORY" => Self::OutOfMemory,
            "NODE_FAIL" => Self::NodeFail,
            other => Self::Unknown(other.to_owned()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running | Self::Completing)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::Completing => f.write_str("completing"),
            Self::Completed => f.write_str("completed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed => f.write_str("failed"),
            Self::Timeout => f.write_str("timeout"),
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::NodeFail => f.write_str("node failure"),
            Self::Unknown(state) => write!(f, "unknown ({state})"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SacctRow {
    job_id: String,
    job_name: String,
    state: String,
    exit_code: String,
    elapsed: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub exit_code: i32,
    pub elapsed: String,
}

impl From<SacctRow> for JobRecord {
    fn from(row: SacctRow) -> Self {
        Self {
            id: JobId::new(row.job_id),
            name: row.job_name,
            state: JobState::parse(&row.state),
            // `0:0` is exit code and signal
            exit_code: row
                .exit_code
                .split(':')
                .next()
                .and_then(|code| code.parse().ok())
                .unwrap_or(0),
            elapsed: row.elapsed,
        }
    }
}

/// Parse `sacct -P -n` output, one `|` separated record per line
pub fn parse_sacct(output: &[u8]) -> Result<Vec<JobRecord>, csv::Error> {
    csv::ReaderBuilder::new()
        .delimiter(b'|')
        .has_headers(false)
        .quoting(false)
        .flexible(false)
        .from_reader(output)
        .deserialize::<SacctRow>()
        .map(|row| row.map(JobRecord::from))
        .collect()
}

#[derive(Debug, Clone)]
pub struct Sacct {
    exec: PathBuf,
    args: Vec<String>,
    poll: Duration,
}

impl Sacct {
    pub fn new(config: &StatusConfig) -> Self {
        Self {
            exec: config.exec.clone(),
            args: config.args.clone(),
            // at least one second between two queries
            poll: Duration::from_secs(config.poll.max(1)),
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    #[instrument(skip(self), level = "debug")]
    pub fn query(&self, ids: &[JobId]) -> Result<Vec<JobRecord>, StatusError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let output = Command::new(&self.exec)
            .args(&self.args)
            .args(["-P", "-X", "-n", "-o", FORMAT, "-j"])
            .arg(ids.iter().join(","))
            .output()
            .map_err(|source| StatusError::Spawn {
                program: self.exec.to_string_lossy().into_owned(),
                source,
            })?;

        if !output.status.success() {
            return Err(StatusError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let records = parse_sacct(&output.stdout)?;
        for id in ids {
            if !records.iter().any(|record| &record.id == id) {
                warn!("sacct does not know job {id} yet");
            }
        }

        Ok(records)
    }

    /// Poll until every job reached a terminal state or `timeout` passed
    pub fn wait_for(&self, ids: &[JobId], timeout: Duration) -> Result<Vec<JobRecord>, StatusError> {
        let start = Instant::now();

        loop {
            let records = self.query(ids)?;
            let open = ids
                .iter()
                .filter(|id| {
                    records
                        .iter()
                        .find(|record| &record.id == *id)
                        .map_or(true, |record| !record.state.is_terminal())
                })
                .join(",");

            if open.is_empty() {
                info!("All {} job(s) finished", ids.len());
                return Ok(records);
            }
            if start.elapsed() >= timeout {
                return Err(StatusError::Timeout(timeout, open));
            }

            debug!("Waiting on {open}");
            thread::sleep(self.poll.min(timeout.saturating_sub(start.elapsed())));
        }
    }
}

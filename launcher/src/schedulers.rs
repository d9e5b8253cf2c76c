pub mod dry_run;
pub mod sbatch;

use crate::{
    config::{ConfigErrors, SchedulerConfig},
    script::JobDescription,
};
use serde::{Deserialize, Serialize};
use std::{fmt, io, time::Duration};
use thiserror::Error;

/// Opaque identifier handed out by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("Failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to talk to the submission process")]
    Io(#[from] io::Error),
    #[error("Scheduler did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Scheduler rejected the job ({status}): {stderr}")]
    Rejected { status: String, stderr: String },
    #[error("Unexpected scheduler output: {0:?}")]
    UnexpectedOutput(String),
}

/// Anything that can take a job description and put it into a queue
pub trait Scheduler {
    fn submit(&self, job: &JobDescription) -> Result<JobId, SubmissionError>;
}

#[derive(Debug)]
pub enum Schedulers {
    Sbatch(sbatch::SbatchScheduler),
    DryRun(dry_run::DryRunScheduler),
}

impl Schedulers {
    pub fn load(config: &SchedulerConfig) -> Result<Self, ConfigErrors> {
        match config.name.to_lowercase().as_str() {
            "sbatch" | "slurm" => Ok(Self::Sbatch(sbatch::SbatchScheduler::load(config)?)),
            "dry-run" | "dry_run" => Ok(Self::DryRun(dry_run::DryRunScheduler::load(config)?)),
            _ => Err(ConfigErrors::UnsupportedScheduler(config.name.clone())),
        }
    }
}

impl Scheduler for Schedulers {
    fn submit(&self, job: &JobDescription) -> Result<JobId, SubmissionError> {
        match self {
            Self::Sbatch(scheduler) => scheduler.submit(job),
            Self::DryRun(scheduler) => scheduler.submit(job),
        }
    }
}

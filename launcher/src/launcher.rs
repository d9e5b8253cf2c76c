use crate::{
    run::{ConfigurationError, RunConfig},
    schedulers::{JobId, Scheduler, SubmissionError},
    script::{JobDescription, ScriptTemplate},
};
use thiserror::Error;
use tracing::{error, info, instrument};

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Invalid run configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Submission failed: {0}")]
    Submission(#[from] SubmissionError),
}

/// Renders RunConfigs with a shared template and hands them to a scheduler
#[derive(Debug)]
pub struct Launcher<S> {
    scheduler: S,
    template: ScriptTemplate,
}

impl<S: Scheduler> Launcher<S> {
    pub fn new(scheduler: S, template: ScriptTemplate) -> Self {
        Self {
            scheduler,
            template,
        }
    }

    pub fn describe(&self, run: &RunConfig) -> Result<JobDescription, ConfigurationError> {
        JobDescription::new(run, &self.template)
    }

    /// Submit a single run, nothing is retried
    #[instrument(skip(self, run), fields(job = %run.job_name), level = "info")]
    pub fn submit(&self, run: RunConfig) -> Result<JobId, LaunchError> {
        let job = self.describe(&run)?;
        let id = self.scheduler.submit(&job)?;

        info!(
            id = %id,
            ranks = job.ntasks,
            nodes = job.nodes,
            "Submitted {}",
            job.job_name
        );

        Ok(id)
    }

    /// Submit every run on its own, a failure is reported in place and the next run is attempted
    pub fn submit_batch<I>(&self, runs: I) -> Vec<Result<JobId, LaunchError>>
    where
        I: IntoIterator<Item = RunConfig>,
    {
        runs.into_iter()
            .map(|run| {
                let name = run.job_name.clone();
                self.submit(run).map_err(|e| {
                    error!("Failed to submit {name}: {e}");
                    e
                })
            })
            .collect()
    }
}

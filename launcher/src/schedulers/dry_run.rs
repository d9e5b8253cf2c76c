use super::{JobId, Scheduler, SubmissionError};
use crate::{
    config::{ConfigErrors, SchedulerConfig},
    script::JobDescription,
};
use std::{
    fs, io,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{info, warn};

/// Writes every job into `<dir>/<job name>.sh` instead of queueing it
#[derive(Debug)]
pub struct DryRunScheduler {
    dir: PathBuf,
    submitted: AtomicU64,
}

impl DryRunScheduler {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            submitted: AtomicU64::new(0),
        }
    }

    pub fn load(config: &SchedulerConfig) -> Result<Self, ConfigErrors> {
        match config.parameter.get("dir") {
            Some(value) => match value.as_str() {
                Some(dir) => Ok(Self::new(PathBuf::from(dir))),
                None => {
                    warn!("scheduler.parameter.dir must be a path");
                    Err(ConfigErrors::InvalidParameter("dir".to_owned()))
                }
            },
            None => Ok(Self::new(PathBuf::from("jobscripts"))),
        }
    }
}

impl Scheduler for DryRunScheduler {
    fn submit(&self, job: &JobDescription) -> Result<JobId, SubmissionError> {
        if job.job_name.contains('/') {
            return Err(SubmissionError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' can not be used as a file name", job.job_name),
            )));
        }

        fs::create_dir_all(&self.dir)?;

        let path = self.dir.join(format!("{}.sh", job.job_name));
        fs::write(&path, job.to_string())?;

        let number = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        info!(path = ?path, "Wrote job script instead of submitting it");

        Ok(JobId::new(format!("dry-run-{number}")))
    }
}

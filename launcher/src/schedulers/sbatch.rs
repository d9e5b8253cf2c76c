use super::{JobId, Scheduler, SubmissionError};
use crate::{
    config::{ConfigErrors, SchedulerConfig},
    script::JobDescription,
};
use std::{
    io::{self, Read, Write},
    path::PathBuf,
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, error, instrument, trace, warn};
use wait_timeout::ChildExt;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Submits jobs by piping the rendered script into `sbatch --parsable`
#[derive(Debug, Clone)]
pub struct SbatchScheduler {
    pub exec: PathBuf,
    // extra arguments placed before `--parsable`
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl SbatchScheduler {
    pub fn load(config: &SchedulerConfig) -> Result<Self, ConfigErrors> {
        let exec = match config.parameter.get("exec") {
            Some(value) => match value.as_str() {
                Some(exec) => PathBuf::from(exec),
                None => {
                    warn!("scheduler.parameter.exec must be a string");
                    return Err(ConfigErrors::InvalidParameter("exec".to_owned()));
                }
            },
            None => PathBuf::from("sbatch"),
        };

        let timeout = Duration::from_millis(match config.parameter.get("timeout") {
            Some(value) => match value.as_u64() {
                Some(value) if value > 0 => value,
                _ => {
                    warn!("scheduler.parameter.timeout must be a positive number of milliseconds");
                    return Err(ConfigErrors::InvalidParameter("timeout".to_owned()));
                }
            },
            None => DEFAULT_TIMEOUT_MS,
        });

        let args = match config.parameter.get("args") {
            Some(value) => match serde_yaml::from_value::<Vec<String>>(value.clone()) {
                Ok(args) => args,
                Err(e) => {
                    warn!("scheduler.parameter.args must be a list of strings: {e}");
                    return Err(ConfigErrors::InvalidParameter("args".to_owned()));
                }
            },
            None => Vec::new(),
        };

        Ok(Self {
            exec,
            args,
            timeout,
        })
    }

    #[instrument(skip(self, job), fields(job = %job.job_name), level = "debug")]
    fn run(&self, job: &JobDescription) -> Result<JobId, SubmissionError> {
        let script = job.to_string();
        trace!("Submitting script:\n{script}");

        let mut handle = Command::new(&self.exec)
            .args(&self.args)
            .arg("--parsable")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SubmissionError::Spawn {
                program: self.exec.to_string_lossy().into_owned(),
                source,
            })?;

        // closing stdin marks the end of the script for sbatch
        let written = match handle.stdin.take() {
            Some(mut stdin) => match stdin.write_all(script.as_bytes()) {
                // sbatch quit before reading everything, its exit status tells why
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("sbatch closed stdin early");
                    Ok(())
                }
                other => other,
            },
            None => Ok(()),
        };

        debug!("Waiting on sbatch ({})", handle.id());
        let status = match written.and_then(|()| handle.wait_timeout(self.timeout)) {
            Ok(Some(status)) => status,
            Ok(None) => {
                error!("sbatch did not finish within {:?}, killing it", self.timeout);
                handle.kill()?;
                handle.wait()?;

                return Err(SubmissionError::Timeout(self.timeout));
            }
            Err(e) => {
                error!("Lost track of sbatch ({}): {e}, killing it", handle.id());
                // the child may already be gone, the original error is the one reported
                let _ = handle.kill();
                let _ = handle.wait();

                return Err(e.into());
            }
        };

        let mut stdout = String::new();
        if let Some(mut pipe) = handle.stdout.take() {
            pipe.read_to_string(&mut stdout)?;
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = handle.stderr.take() {
            pipe.read_to_string(&mut stderr)?;
        }

        if status.success() {
            parse_job_id(&stdout)
        } else {
            Err(SubmissionError::Rejected {
                status: status.to_string(),
                stderr: stderr.trim().to_owned(),
            })
        }
    }
}

impl Scheduler for SbatchScheduler {
    fn submit(&self, job: &JobDescription) -> Result<JobId, SubmissionError> {
        self.run(job)
    }
}

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`
pub fn parse_job_id(stdout: &str) -> Result<JobId, SubmissionError> {
    let line = stdout.lines().map(str::trim).rfind(|line| !line.is_empty());
    let id = line.and_then(|line| line.split(';').next()).unwrap_or("");

    if !id.is_empty() && id.bytes().all(|byte| byte.is_ascii_digit()) {
        Ok(JobId::new(id))
    } else {
        Err(SubmissionError::UnexpectedOutput(stdout.to_owned()))
    }
}

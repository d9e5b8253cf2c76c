use crate::run::{ConfigurationError, RunConfig, WallClock};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, path::PathBuf};

/// Everything shared by all generated scripts
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScriptTemplate {
    #[serde(default = "default_shell")]
    pub shell: String,
    // parallel launcher, called as `<launcher> -np <ranks> <binary> <args>`
    #[serde(default = "default_launcher")]
    pub launcher: String,
    #[serde(default = "default_binary")]
    pub binary: String,
    // environment modules loaded before the launch
    #[serde(default = "default_modules")]
    pub modules: Vec<String>,
    // emitted verbatim, `null` drops the directive
    #[serde(default = "default_requeue_flag")]
    pub requeue_flag: Option<String>,
}

impl Default for ScriptTemplate {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            launcher: default_launcher(),
            binary: default_binary(),
            modules: default_modules(),
            requeue_flag: default_requeue_flag(),
        }
    }
}

fn default_shell() -> String {
    "/bin/bash".to_owned()
}

fn default_launcher() -> String {
    "mpirun".to_owned()
}

fn default_binary() -> String {
    "./project3".to_owned()
}

fn default_modules() -> Vec<String> {
    vec!["openmpi".to_owned()]
}

fn default_requeue_flag() -> Option<String> {
    Some("--no-reque".to_owned())
}

/// The command line run inside the allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub launcher: String,
    pub ranks: u32,
    pub binary: String,
    pub args: Vec<String>,
    pub output: PathBuf,
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -np {} {}", self.launcher, self.ranks, self.binary)?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }

        write!(
            f,
            " >& {}",
            shell_quote(&self.output.to_string_lossy())
        )
    }
}

/// A single job as the scheduler sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescription {
    pub shell: String,
    pub account: String,
    pub job_name: String,
    pub nodes: u32,
    pub ntasks: u32,
    pub cpus_per_task: u32,
    pub ntasks_per_node: u32,
    pub time: WallClock,
    pub requeue_flag: Option<String>,
    pub qos: String,
    pub setup: Vec<String>,
    pub launch: LaunchCommand,
}

impl JobDescription {
    /// Validate `run` and combine it with the shared template
    pub fn new(run: &RunConfig, template: &ScriptTemplate) -> Result<Self, ConfigurationError> {
        run.validate()?;

        Ok(Self {
            shell: template.shell.clone(),
            account: run.account_id.clone(),
            job_name: run.job_name.clone(),
            nodes: run.node_count,
            ntasks: run.process_count,
            cpus_per_task: run.cpus_per_task,
            ntasks_per_node: run.ranks_per_node,
            time: run.wall_clock_limit,
            requeue_flag: template.requeue_flag.clone(),
            qos: run.qos.clone(),
            setup: template
                .modules
                .iter()
                .map(|module| format!("module load {module}"))
                .collect_vec(),
            launch: LaunchCommand {
                launcher: template.launcher.clone(),
                ranks: run.process_count,
                binary: template.binary.clone(),
                args: run.binary_args.clone(),
                output: run.output_path.clone(),
            },
        })
    }

    /// The `#SBATCH` directives in the order they appear in the script
    pub fn directives(&self) -> Vec<String> {
        let mut directives = vec![
            format!("--account={}", self.account),
            format!("--job-name={}", self.job_name),
            format!("--nodes={}", self.nodes),
            format!("--ntasks={}", self.ntasks),
            format!("--cpus-per-task={}", self.cpus_per_task),
            format!("--ntasks-per-node={}", self.ntasks_per_node),
            format!("--time={}", self.time),
        ];
        if let Some(flag) = &self.requeue_flag {
            directives.push(flag.clone());
        }
        directives.push(format!("--qos={}", self.qos));

        directives
    }
}

impl fmt::Display for JobDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "#!{}", self.shell)?;
        for directive in self.directives() {
            writeln!(f, "#SBATCH {directive}")?;
        }
        for line in &self.setup {
            writeln!(f, "{line}")?;
        }

        writeln!(f, "{}", self.launch)
    }
}

/// Validated script text for `run`, nothing is submitted
pub fn render(run: &RunConfig, template: &ScriptTemplate) -> Result<String, ConfigurationError> {
    JobDescription::new(run, template).map(|job| job.to_string())
}

/// single-quote a word for bash if it contains anything but plain characters
fn shell_quote(word: &str) -> Cow<'_, str> {
    let plain = |c: char| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c);

    if !word.is_empty() && word.chars().all(plain) {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}

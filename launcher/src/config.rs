use crate::{
    run::{default_job_name, default_output_path, RunConfig, WallClock},
    schedulers::Schedulers,
    script::ScriptTemplate,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Config could not be parsed")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("Scheduler {0} not supported")]
    UnsupportedScheduler(String),
    #[error("Scheduler parameter {0} is invalid")]
    InvalidParameter(String),
    #[error("Run {run} references unknown profile {profile}")]
    UnknownProfile { run: usize, profile: String },
    #[error("Selection matched no runs")]
    EmptySelection,
    #[error("Preflight checks failed")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LauncherConfig {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub script: ScriptTemplate,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub status: StatusConfig,
    // named groups of runs sharing time limit, naming and arguments
    pub profiles: BTreeMap<String, Profile>,
    pub runs: Vec<RunEntry>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(alias = "account_id")]
    pub account: String,
    #[serde(default = "default_qos")]
    pub qos: String,
    #[serde(default = "default_cpus_per_task")]
    pub cpus_per_task: u32,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            account: String::new(),
            qos: default_qos(),
            cpus_per_task: default_cpus_per_task(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    // Name of the selected scheduler, see Schedulers::load for the selection process
    #[serde(default = "default_scheduler")]
    pub name: String,
    // parameters for the scheduler, e.g. exec, args, timeout or dir
    #[serde(default)]
    pub parameter: BTreeMap<String, serde_yaml::Value>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_scheduler(),
            parameter: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StatusConfig {
    #[serde(default = "default_sacct")]
    pub exec: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    // seconds between two polls while waiting
    #[serde(default = "default_poll")]
    pub poll: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            exec: default_sacct(),
            args: Vec::new(),
            poll: default_poll(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub time: WallClock,
    pub job_prefix: String,
    pub output_prefix: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub qos: Option<String>,
    pub nodes: Option<u32>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunEntry {
    pub profile: String,
    #[serde(alias = "processes")]
    pub ranks: u32,
    pub nodes: Option<u32>,
    pub ranks_per_node: Option<u32>,
    pub time: Option<WallClock>,
    pub name: Option<String>,
    pub output: Option<PathBuf>,
    pub args: Option<Vec<String>>,
    pub qos: Option<String>,
    pub account: Option<String>,
    pub cpus_per_task: Option<u32>,
}

/// Which runs of the table to act on, empty means all of them
#[derive(Clone, Debug, Default)]
pub struct RunFilter {
    pub names: Vec<String>,
    pub profiles: Vec<String>,
}

impl RunFilter {
    fn matches(&self, profile: &str, run: &RunConfig) -> bool {
        let name_matches = self.names.is_empty()
            || self
                .names
                .iter()
                .any(|name| name.eq_ignore_ascii_case(&run.job_name));
        let profile_matches = self.profiles.is_empty()
            || self
                .profiles
                .iter()
                .any(|name| name.eq_ignore_ascii_case(profile));

        name_matches && profile_matches
    }
}

impl LauncherConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        if !path.is_file() {
            return Err(ConfigErrors::FileNotFound(path.to_path_buf()));
        }
        debug!(path = ?path, "Loading run table");

        Self::from_yaml(&fs::read_to_string(path)?)
    }

    pub fn from_yaml(input: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(input)?)
    }

    pub fn scheduler(&self) -> Result<Schedulers, ConfigErrors> {
        Schedulers::load(&self.scheduler)
    }

    /// Turn one table row into a RunConfig, the values are checked later on submission
    pub fn resolve_entry(&self, index: usize, entry: &RunEntry) -> Result<RunConfig, ConfigErrors> {
        let profile =
            self.profiles
                .get(&entry.profile)
                .ok_or_else(|| ConfigErrors::UnknownProfile {
                    run: index,
                    profile: entry.profile.clone(),
                })?;

        let nodes = entry.nodes.or(profile.nodes).unwrap_or(1);
        let ranks_per_node = entry.ranks_per_node.unwrap_or_else(|| {
            // an uneven split is left for validation to report
            if nodes == 0 {
                0
            } else {
                entry.ranks / nodes
            }
        });

        Ok(RunConfig {
            job_name: entry
                .name
                .clone()
                .unwrap_or_else(|| default_job_name(&profile.job_prefix, entry.ranks)),
            process_count: entry.ranks,
            node_count: nodes,
            ranks_per_node,
            cpus_per_task: entry.cpus_per_task.unwrap_or(self.defaults.cpus_per_task),
            wall_clock_limit: entry.time.unwrap_or(profile.time),
            qos: entry
                .qos
                .clone()
                .or_else(|| profile.qos.clone())
                .unwrap_or_else(|| self.defaults.qos.clone()),
            account_id: entry
                .account
                .clone()
                .unwrap_or_else(|| self.defaults.account.clone()),
            output_path: entry
                .output
                .clone()
                .unwrap_or_else(|| default_output_path(&profile.output_prefix, entry.ranks)),
            binary_args: entry.args.clone().unwrap_or_else(|| profile.args.clone()),
        })
    }

    /// Expand the table into RunConfigs, keeping the order of `runs`
    pub fn resolve(&self, filter: &RunFilter) -> Result<Vec<RunConfig>, ConfigErrors> {
        let mut resolved = Vec::new();

        for (index, entry) in self.runs.iter().enumerate() {
            let run = self.resolve_entry(index, entry)?;
            if filter.matches(&entry.profile, &run) {
                resolved.push(run);
            }
        }

        if resolved.is_empty() {
            Err(ConfigErrors::EmptySelection)
        } else {
            Ok(resolved)
        }
    }

    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.runs.is_empty() {
            error!("No run was defined, nothing to submit");
            contains_error = true;
        }

        if self.defaults.account.trim().is_empty() {
            warn!("defaults.account is empty, every run has to set its own account");
        }

        self.scheduler.name = self.scheduler.name.to_lowercase();
        if let Err(e) = Schedulers::load(&self.scheduler) {
            error!("scheduler ({}) could not be loaded: {e}", self.scheduler.name);
            contains_error = true;
        }

        if let Some(exec) = self
            .scheduler
            .parameter
            .get("exec")
            .and_then(|value| value.as_str())
            .filter(|exec| exec.contains('/'))
        {
            match check_executable(Path::new(exec)) {
                Ok(true) => {}
                Ok(false) => {
                    error!("scheduler.parameter.exec ({exec}) is not executable");
                    contains_error = true;
                }
                Err(e) => {
                    error!("Failed to check scheduler.parameter.exec ({exec}): {e}");
                    contains_error = true;
                }
            }
        }

        for (name, profile) in self.profiles.iter() {
            if profile.time.is_zero() {
                error!("profiles.{name}.time cannot be 0");
                contains_error = true;
            }
        }

        let known_profiles = self.profiles.keys().cloned().collect_vec();
        for (index, entry) in self.runs.iter().enumerate() {
            if known_profiles.binary_search(&entry.profile).is_err() {
                error!(
                    "runs.{index}.profile '{}' is not defined in profiles",
                    entry.profile
                );
                contains_error = true;
                continue;
            }

            match self.resolve_entry(index, entry).map(|run| (run.validate(), run)) {
                Ok((Ok(()), _)) => {}
                Ok((Err(e), run)) => {
                    error!("runs.{index} ({}) is invalid: {e}", run.job_name);
                    contains_error = true;
                }
                Err(e) => {
                    error!("runs.{index} could not be resolved: {e}");
                    contains_error = true;
                }
            }
        }

        let duplicates = self
            .runs
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| self.resolve_entry(index, entry).ok())
            .map(|run| run.job_name)
            .duplicates()
            .collect_vec();
        for name in duplicates {
            warn!("Job name {name} is used by more than one run");
        }

        contains_error
    }
}

fn default_qos() -> String {
    "debug".to_owned()
}

fn default_cpus_per_task() -> u32 {
    1
}

fn default_scheduler() -> String {
    "sbatch".to_owned()
}

fn default_sacct() -> PathBuf {
    PathBuf::from("sacct")
}

fn default_poll() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const RUNS: &str = include_str!("../../runs.yaml");

    const SMALL: &str = indoc! {"
        defaults:
          account: 193000-cf0001
        profiles:
          debug:
            time: 2min
            job_prefix: Debug
            output_prefix: out
            args: ['1']
          work:
            time: 20
            job_prefix: Work
            output_prefix: results
        runs:
          - { profile: debug, ranks: 4 }
          - { profile: work, ranks: 32, nodes: 2 }
          - { profile: work, ranks: 7 }
    "};

    #[test]
    fn resolve_small_table() {
        let config = LauncherConfig::from_yaml(SMALL).unwrap();
        let runs = config.resolve(&RunFilter::default()).unwrap();

        assert_eq!(runs.len(), 3);

        let debug = &runs[0];
        assert_eq!(debug.job_name, "Debug04P");
        assert_eq!(debug.process_count, 4);
        assert_eq!(debug.node_count, 1);
        assert_eq!(debug.ranks_per_node, 4);
        assert_eq!(debug.wall_clock_limit.to_string(), "00:02:00");
        assert_eq!(debug.qos, "debug");
        assert_eq!(debug.account_id, "193000-cf0001");
        assert_eq!(debug.output_path, PathBuf::from("out.04p"));
        assert_eq!(debug.binary_args, vec!["1".to_owned()]);

        let wide = &runs[1];
        assert_eq!(wide.job_name, "Work32P");
        assert_eq!((wide.process_count, wide.node_count, wide.ranks_per_node), (32, 2, 16));
        assert_eq!(wide.wall_clock_limit.to_string(), "00:20:00");
        assert_eq!(wide.output_path, PathBuf::from("results.32p"));
        assert!(wide.binary_args.is_empty());

        let odd = &runs[2];
        assert_eq!((odd.process_count, odd.node_count, odd.ranks_per_node), (7, 1, 7));
    }

    #[test]
    fn entry_overrides_profile() {
        let config = LauncherConfig::from_yaml(indoc! {"
            defaults: { account: acct, qos: normal, cpus_per_task: 2 }
            profiles:
              work: { time: 20, job_prefix: Work, output_prefix: results, qos: long }
            runs:
              - profile: work
                ranks: 8
                nodes: 2
                ranks_per_node: 4
                time: '1-00:00:00'
                name: custom
                output: logs/custom.txt
                args: ['--verbose']
                qos: short
                account: other
                cpus_per_task: 4
              - { profile: work, ranks: 2 }
        "})
        .unwrap();
        let runs = config.resolve(&RunFilter::default()).unwrap();

        assert_eq!(runs[0].job_name, "custom");
        assert_eq!(runs[0].ranks_per_node, 4);
        assert_eq!(runs[0].wall_clock_limit.to_string(), "1-00:00:00");
        assert_eq!(runs[0].output_path, PathBuf::from("logs/custom.txt"));
        assert_eq!(runs[0].binary_args, vec!["--verbose".to_owned()]);
        assert_eq!(runs[0].qos, "short");
        assert_eq!(runs[0].account_id, "other");
        assert_eq!(runs[0].cpus_per_task, 4);

        assert_eq!(runs[1].qos, "long");
        assert_eq!(runs[1].cpus_per_task, 2);
    }

    #[test]
    fn uneven_split_is_reported_by_validation() {
        let config = LauncherConfig::from_yaml(indoc! {"
            defaults: { account: acct }
            profiles: { work: { time: 20, job_prefix: Work, output_prefix: results } }
            runs: [ { profile: work, ranks: 5, nodes: 2 } ]
        "})
        .unwrap();
        let runs = config.resolve(&RunFilter::default()).unwrap();

        assert_eq!(runs[0].ranks_per_node, 2);
        assert!(runs[0].validate().is_err());
    }

    #[test]
    fn filter_by_name_and_profile() {
        let config = LauncherConfig::from_yaml(SMALL).unwrap();

        let by_name = config
            .resolve(&RunFilter {
                names: vec!["work32p".to_owned()],
                profiles: Vec::new(),
            })
            .unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].job_name, "Work32P");

        let by_profile = config
            .resolve(&RunFilter {
                names: Vec::new(),
                profiles: vec!["work".to_owned()],
            })
            .unwrap();
        assert_eq!(by_profile.len(), 2);

        assert!(matches!(
            config.resolve(&RunFilter {
                names: vec!["Debug04P".to_owned()],
                profiles: vec!["work".to_owned()],
            }),
            Err(ConfigErrors::EmptySelection)
        ));
    }

    #[test]
    fn unknown_profile() {
        let config = LauncherConfig::from_yaml(indoc! {"
            defaults: { account: acct }
            profiles: {}
            runs: [ { profile: missing, ranks: 2 } ]
        "})
        .unwrap();

        match config.resolve(&RunFilter::default()) {
            Err(ConfigErrors::UnknownProfile { run, profile }) => {
                assert_eq!(run, 0);
                assert_eq!(profile, "missing");
            }
            other => panic!("expected an unknown profile, got {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            LauncherConfig::from_yaml(indoc! {"
                profiles: {}
                runs: []
                partition: gpu
            "}),
            Err(ConfigErrors::InvalidYaml(_))
        ));
    }

    #[test]
    fn preflight_reports_problems() {
        let mut config = LauncherConfig::from_yaml(indoc! {"
            defaults: { account: acct }
            scheduler: { name: PBS }
            profiles: { work: { time: 20, job_prefix: Work, output_prefix: results } }
            runs:
              - { profile: work, ranks: 32, nodes: 2, ranks_per_node: 15 }
              - { profile: nope, ranks: 2 }
        "})
        .unwrap();

        assert!(config.preflight_checks());
        assert_eq!(config.scheduler.name, "pbs");
    }

    #[test]
    fn preflight_checks_scheduler_exec() {
        let dir = tempfile::tempdir().unwrap();
        let exec = dir.path().join("sbatch");
        std::fs::write(&exec, "#!/bin/sh\n").unwrap();

        let mut config = LauncherConfig::from_yaml(SMALL).unwrap();
        config.scheduler.parameter.insert(
            "exec".to_owned(),
            serde_yaml::Value::String(exec.to_string_lossy().into_owned()),
        );

        // written without the executable bit
        assert!(config.preflight_checks());

        config.scheduler.parameter.insert(
            "exec".to_owned(),
            serde_yaml::Value::String("/nonexistent/sbatch".to_owned()),
        );
        assert!(config.preflight_checks());
    }

    #[test]
    fn check_executable_missing_file() {
        assert!(matches!(
            check_executable(Path::new("/nonexistent/file")),
            Err(ConfigErrors::FileNotFound(_))
        ));
    }

    const JOB_SCRIPTS: [(&str, &str); 12] = [
        ("Debug02P", include_str!("../testdata/jobscripts/debug02.js")),
        ("Debug04P", include_str!("../testdata/jobscripts/debug04.js")),
        ("Debug05P", include_str!("../testdata/jobscripts/debug05.js")),
        ("Debug08P", include_str!("../testdata/jobscripts/debug08.js")),
        ("Debug12P", include_str!("../testdata/jobscripts/debug12.js")),
        ("Work02P", include_str!("../testdata/jobscripts/run02.js")),
        ("Work04P", include_str!("../testdata/jobscripts/run04.js")),
        ("Work05P", include_str!("../testdata/jobscripts/run05.js")),
        ("Work07P", include_str!("../testdata/jobscripts/run07.js")),
        ("Work08P", include_str!("../testdata/jobscripts/run08.js")),
        ("Work12P", include_str!("../testdata/jobscripts/run12.js")),
        ("Work16P", include_str!("../testdata/jobscripts/run16.js")),
    ];

    #[test]
    fn shipped_table_renders_hand_written_scripts() {
        let config = LauncherConfig::from_yaml(RUNS).unwrap();
        let runs = config.resolve(&RunFilter::default()).unwrap();

        for (name, expected) in JOB_SCRIPTS {
            let run = runs.iter().find(|run| run.job_name == name).unwrap();
            let rendered = crate::script::render(run, &config.script).unwrap();

            // the hand-written files end in blank lines
            assert_eq!(rendered.trim_end(), expected.trim_end(), "{name}");
        }

        // Work32P asks for the tasks it launches, not the 16 of its hand-written script
        let wide = runs.iter().find(|run| run.job_name == "Work32P").unwrap();
        let rendered = crate::script::render(wide, &config.script).unwrap();
        assert!(rendered.contains("#SBATCH --nodes=2\n#SBATCH --ntasks=32\n"));
        assert!(rendered.contains("#SBATCH --ntasks-per-node=16\n"));
        assert!(rendered.ends_with("mpirun -np 32 ./project3 >& results.32p\n"));
    }

    #[test]
    fn shipped_table_reproduces_job_scripts() {
        let mut config = LauncherConfig::from_yaml(RUNS).unwrap();
        assert!(!config.preflight_checks());

        let runs = config.resolve(&RunFilter::default()).unwrap();
        let names = runs.iter().map(|run| run.job_name.as_str()).collect_vec();

        assert_eq!(
            names,
            vec![
                "Debug02P", "Debug04P", "Debug05P", "Debug08P", "Debug12P", "Work02P", "Work04P",
                "Work05P", "Work07P", "Work08P", "Work12P", "Work16P", "Work32P",
            ]
        );

        for run in &runs {
            assert_eq!(run.account_id, "193000-cf0001");
            assert_eq!(run.qos, "debug");
            assert_eq!(run.cpus_per_task, 1);
            assert_eq!(run.validate(), Ok(()));

            if run.job_name.starts_with("Debug") {
                assert_eq!(run.wall_clock_limit.to_string(), "00:02:00");
                assert_eq!(run.binary_args, vec!["1".to_owned()]);
            } else {
                assert_eq!(run.wall_clock_limit.to_string(), "00:20:00");
                assert!(run.binary_args.is_empty());
            }
        }

        let wide = runs.last().unwrap();
        assert_eq!((wide.process_count, wide.node_count, wide.ranks_per_node), (32, 2, 16));
        assert_eq!(wide.output_path, PathBuf::from("results.32p"));
    }
}

use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};
use thiserror::Error;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("{field} must be at least 1")]
    ZeroCount { field: &'static str },
    #[error("wall clock limit must be longer than zero")]
    ZeroWallClock,
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },
    #[error("{nodes} node(s) x {ranks_per_node} rank(s) per node does not match {processes} processes")]
    UnbalancedSplit {
        processes: u32,
        nodes: u32,
        ranks_per_node: u32,
    },
    #[error("'{0}' is not a valid wall clock limit")]
    InvalidWallClock(String),
    #[error("{field} '{value}' must not contain whitespace, control characters or '/'")]
    InvalidCharacters { field: &'static str, value: String },
}

/// Maximum run time of a job, kept in whole seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawWallClock", into = "String")]
pub struct WallClock {
    seconds: u64,
}

// bare integers are minutes, like `sbatch --time=20`
#[derive(Deserialize)]
#[serde(untagged)]
enum RawWallClock {
    Minutes(u64),
    Text(String),
}

impl TryFrom<RawWallClock> for WallClock {
    type Error = ConfigurationError;

    fn try_from(raw: RawWallClock) -> Result<Self, Self::Error> {
        match raw {
            RawWallClock::Minutes(minutes) => Self::from_minutes(minutes),
            RawWallClock::Text(text) => text.parse(),
        }
    }
}

impl From<WallClock> for String {
    fn from(value: WallClock) -> Self {
        value.to_string()
    }
}

impl WallClock {
    pub const fn from_seconds(seconds: u64) -> Self {
        Self { seconds }
    }

    pub fn from_minutes(minutes: u64) -> Result<Self, ConfigurationError> {
        minutes
            .checked_mul(MINUTE)
            .map(Self::from_seconds)
            .ok_or_else(|| ConfigurationError::InvalidWallClock(minutes.to_string()))
    }

    pub const fn is_zero(&self) -> bool {
        self.seconds == 0
    }

    /// `days * DAY + hours * HOUR + minutes * MINUTE + seconds`, `None` on overflow
    fn sum(days: u64, hours: u64, minutes: u64, seconds: u64) -> Option<u64> {
        days.checked_mul(DAY)?
            .checked_add(hours.checked_mul(HOUR)?)?
            .checked_add(minutes.checked_mul(MINUTE)?)?
            .checked_add(seconds)
    }

    /// parse the slurm forms `MM`, `MM:SS`, `HH:MM:SS`, `D-HH`, `D-HH:MM` and `D-HH:MM:SS`
    fn parse_slurm(input: &str) -> Option<u64> {
        let field = |value: &str| -> Option<u64> {
            if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
                None
            } else {
                value.parse().ok()
            }
        };

        if let Some((days, rest)) = input.split_once('-') {
            let days = field(days)?;
            let parts = rest.split(':').map(field).collect::<Option<Vec<_>>>()?;
            let (hours, minutes, seconds) = match parts.as_slice() {
                [hours] => (*hours, 0, 0),
                [hours, minutes] => (*hours, *minutes, 0),
                [hours, minutes, seconds] => (*hours, *minutes, *seconds),
                _ => return None,
            };

            Self::sum(days, hours, minutes, seconds)
        } else {
            let parts = input.split(':').map(field).collect::<Option<Vec<_>>>()?;
            match parts.as_slice() {
                [minutes] => Self::sum(0, 0, *minutes, 0),
                [minutes, seconds] => Self::sum(0, 0, *minutes, *seconds),
                [hours, minutes, seconds] => Self::sum(0, *hours, *minutes, *seconds),
                _ => None,
            }
        }
    }

    /// parse shorthands such as `90s`, `2min`, `20m`, `1h` or `2d`
    fn parse_suffixed(input: &str) -> Option<u64> {
        let split = input.find(|c: char| !c.is_ascii_digit())?;
        let (value, unit) = input.split_at(split);
        let value: u64 = value.parse().ok()?;
        let scale = match unit.trim() {
            "s" | "sec" | "secs" => 1,
            "m" | "min" | "mins" => MINUTE,
            "h" | "hr" | "hrs" => HOUR,
            "d" | "day" | "days" => DAY,
            _ => return None,
        };

        value.checked_mul(scale)
    }
}

impl FromStr for WallClock {
    type Err = ConfigurationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();

        Self::parse_slurm(trimmed)
            .or_else(|| Self::parse_suffixed(trimmed))
            .map(Self::from_seconds)
            .ok_or_else(|| ConfigurationError::InvalidWallClock(input.to_owned()))
    }
}

impl fmt::Display for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days = self.seconds / DAY;
        let hours = (self.seconds % DAY) / HOUR;
        let minutes = (self.seconds % HOUR) / MINUTE;
        let seconds = self.seconds % MINUTE;

        if days > 0 {
            write!(f, "{days}-{hours:02}:{minutes:02}:{seconds:02}")
        } else {
            write!(f, "{hours:02}:{minutes:02}:{seconds:02}")
        }
    }
}

/// One row of the run table, fully resolved and ready to be turned into a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub job_name: String,
    pub process_count: u32,
    pub node_count: u32,
    pub ranks_per_node: u32,
    pub cpus_per_task: u32,
    pub wall_clock_limit: WallClock,
    pub qos: String,
    pub account_id: String,
    pub output_path: PathBuf,
    pub binary_args: Vec<String>,
}

impl RunConfig {
    /// check all fields, the requested values are never adjusted
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (field, value) in [
            ("process count", self.process_count),
            ("node count", self.node_count),
            ("ranks per node", self.ranks_per_node),
            ("cpus per task", self.cpus_per_task),
        ] {
            if value == 0 {
                return Err(ConfigurationError::ZeroCount { field });
            }
        }

        if self.wall_clock_limit.is_zero() {
            return Err(ConfigurationError::ZeroWallClock);
        }

        for (field, value) in [
            ("job name", self.job_name.as_str()),
            ("account", self.account_id.as_str()),
            ("qos", self.qos.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigurationError::EmptyField { field });
            }
            // each of these ends up inside a single `#SBATCH` line, the job name also in a file name
            if value
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || c == '/')
            {
                return Err(ConfigurationError::InvalidCharacters {
                    field,
                    value: value.to_owned(),
                });
            }
        }

        if self.output_path.as_os_str().is_empty() {
            return Err(ConfigurationError::EmptyField {
                field: "output path",
            });
        }

        if self.node_count.checked_mul(self.ranks_per_node) != Some(self.process_count) {
            return Err(ConfigurationError::UnbalancedSplit {
                processes: self.process_count,
                nodes: self.node_count,
                ranks_per_node: self.ranks_per_node,
            });
        }

        Ok(())
    }
}

/// `Debug` + 4 -> `Debug04P`
pub fn default_job_name(prefix: &str, ranks: u32) -> String {
    format!("{prefix}{ranks:02}P")
}

/// `out` + 4 -> `out.04p`
pub fn default_output_path(prefix: &str, ranks: u32) -> PathBuf {
    PathBuf::from(format!("{prefix}.{ranks:02}p"))
}

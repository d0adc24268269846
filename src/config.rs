use crate::{cgroup::CGROUP_DIR, classify::DEFAULT_CRASH_THRESHOLD, vm::RFB_PORT_BASE};

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    /// Launch command template, `%p` display port, `%c` counter, `%h` host.
    pub qemu: String,
    /// Number of instances per round.
    pub instances: usize,
    /// Display port of instance 0.
    pub base_port: u16,
    pub host: String,
    pub settle: Duration,
    pub disable_cgroup: bool,
    pub cgroup_dir: PathBuf,
    pub rounds: Rounds,
    pub threshold: usize,
    pub out_dir: PathBuf,
    pub viewer: Option<String>,
    pub connect_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            qemu: String::new(),
            instances: 1,
            base_port: 77,
            host: "localhost".to_string(),
            settle: Duration::from_secs(0),
            disable_cgroup: false,
            cgroup_dir: PathBuf::from(CGROUP_DIR),
            rounds: Rounds::Times(1),
            threshold: DEFAULT_CRASH_THRESHOLD,
            out_dir: PathBuf::from("/tmp"),
            viewer: None,
            connect_timeout: Some(Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("empty launch command")]
    EmptyCommand,
    #[error("instance count should be at least 1")]
    NoInstance,
    #[error("crash threshold should be at least 1")]
    ZeroThreshold,
    #[error("ports of {n} instances from display {base} exceed 65535")]
    PortRange { base: u16, n: usize },
    #[error("output directory {0} does not exist")]
    OutDir(PathBuf),
}

impl Config {
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.qemu.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        if self.instances == 0 {
            return Err(ConfigError::NoInstance);
        }
        if self.threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        let last = RFB_PORT_BASE as usize + self.base_port as usize + self.instances - 1;
        if last > u16::MAX as usize {
            return Err(ConfigError::PortRange {
                base: self.base_port,
                n: self.instances,
            });
        }
        if !self.out_dir.is_dir() {
            return Err(ConfigError::OutDir(self.out_dir.clone()));
        }
        Ok(())
    }
}

/// How many rounds to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounds {
    Times(u64),
    Forever,
}

impl Rounds {
    /// `0` runs once, negative forever, positive that many times.
    pub fn from_count(n: i64) -> Self {
        if n < 0 {
            Rounds::Forever
        } else {
            Rounds::Times(std::cmp::max(n, 1) as u64)
        }
    }

    /// Rounds left after one more finished, `None` when done.
    pub fn after_one(self) -> Option<Self> {
        match self {
            Rounds::Forever => Some(Rounds::Forever),
            Rounds::Times(n) if n > 1 => Some(Rounds::Times(n - 1)),
            Rounds::Times(_) => None,
        }
    }
}

/// Duration in the `<unsigned integer><unit>` format, unit is one of
/// `ms`, `msec`, `sec`, `min`, `hour`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settle(pub Duration);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot parse duration '{0}', expected <number><ms|msec|sec|min|hour>")]
pub struct ParseDurationError(String);

impl FromStr for Settle {
    type Err = ParseDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseDurationError(s.to_string());
        let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(err)?;
        let (num, unit) = s.split_at(split);
        let n = num.parse::<u64>().map_err(|_| err())?;
        let dur = match unit {
            "ms" | "msec" => Duration::from_millis(n),
            "sec" => Duration::from_secs(n),
            "min" => Duration::from_secs(n.checked_mul(60).ok_or_else(err)?),
            "hour" => Duration::from_secs(n.checked_mul(60 * 60).ok_or_else(err)?),
            _ => return Err(err()),
        };
        Ok(Settle(dur))
    }
}

impl fmt::Display for Settle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0.as_millis())
    }
}

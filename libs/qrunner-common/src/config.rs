// Run configuration shared by the runner and its tests
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ISOLATED_PREFIX: &str = "hw";

/// How much failure detail is written to the output sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureDisplay {
    #[default]
    First,
    All,
}

/// What happens when a unit has no score descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingDescriptor {
    #[default]
    Abort,
    Zero,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Global wall-clock budget for the whole run
    pub timeout_secs: u64,
    /// Worker pool size; `None` means an unbounded (cached) pool
    pub workers: Option<usize>,
    /// Group names under this prefix are loaded fresh for every run
    pub isolated_prefix: String,
    /// Directories searched before the shared resolver
    pub classpath: Vec<PathBuf>,
    pub failure_display: FailureDisplay,
    pub parallel_groups: bool,
    pub parallel_units: bool,
    pub missing_descriptor: MissingDescriptor,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            workers: None,
            isolated_prefix: DEFAULT_ISOLATED_PREFIX.to_string(),
            classpath: Vec::new(),
            failure_display: FailureDisplay::First,
            parallel_groups: true,
            parallel_units: false,
            missing_descriptor: MissingDescriptor::Abort,
        }
    }
}

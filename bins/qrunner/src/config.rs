// Layered run configuration: defaults < JSON file < environment < command line
use anyhow::{bail, Context, Result};
use qrunner_common::config::RunnerConfig;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config/qrunner.json";

pub const ENV_TIMEOUT_SECS: &str = "QRUNNER_TIMEOUT_SECS";
pub const ENV_WORKERS: &str = "QRUNNER_WORKERS";
pub const ENV_ISOLATED_PREFIX: &str = "QRUNNER_ISOLATED_PREFIX";

/// Load a configuration file; fields it omits keep their defaults
pub fn load_file(config_path: &Path) -> Result<RunnerConfig> {
    if !config_path.exists() {
        bail!("Runner config file not found: {}", config_path.display());
    }

    let content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;

    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", config_path.display()))
}

/// Defaults, then the explicit file (or `config/qrunner.json` when present), then the process environment
pub fn load_layered(explicit: Option<&Path>) -> Result<RunnerConfig> {
    let mut config = match explicit {
        Some(path) => load_file(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => load_file(Path::new(DEFAULT_CONFIG_PATH))?,
        None => RunnerConfig::default(),
    };
    apply_env(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

pub fn apply_env(config: &mut RunnerConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(value) = lookup(ENV_TIMEOUT_SECS) {
        config.timeout_secs = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {}", ENV_TIMEOUT_SECS, value))?;
    }
    if let Some(value) = lookup(ENV_WORKERS) {
        let workers: usize = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {}", ENV_WORKERS, value))?;
        // 0 selects the unbounded pool
        config.workers = (workers > 0).then_some(workers);
    }
    if let Some(value) = lookup(ENV_ISOLATED_PREFIX) {
        config.isolated_prefix = value;
    }
    Ok(())
}

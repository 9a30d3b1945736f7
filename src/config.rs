use crate::params::{DEFAULT_PREFIX, DEFAULT_SEPARATOR};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resource-limiting supervisor wrapped around the solver, runsolver style:
/// `<path> -M <mb> -W <secs> <solver command…>`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub path: PathBuf,
    /// Extra wall-clock seconds granted before our own timer kills the
    /// supervisor, so that it gets to report first.
    pub grace_secs: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("runsolver"),
            grace_secs: 5.0,
        }
    }
}

/// Settings of the solver wrapper. Every field has a default, so a JSON file
/// only needs the fields it changes.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct WrapperConfig {
    pub prefix: String,
    pub separator: String,
    /// Decode `_AT_`-style escapes in parameter tokens.
    pub decode_escapes: bool,
    pub normalize_instance: bool,
    /// Arguments placed between the solver binary and the instance path.
    pub solver_args: Vec<String>,
    /// e.g. `--seed={seed}`.
    pub seed_arg: Option<String>,
    pub portfolio_file_flag: String,
    pub portfolio_threads_flag: String,
    pub memory_limit_mb: Option<u64>,
    pub min_cutoff_secs: f64,
    pub supervisor: Option<SupervisorConfig>,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_owned(),
            separator: DEFAULT_SEPARATOR.to_owned(),
            decode_escapes: false,
            normalize_instance: true,
            solver_args: Vec::new(),
            seed_arg: None,
            portfolio_file_flag: "-p".to_owned(),
            portfolio_threads_flag: "-t".to_owned(),
            memory_limit_mb: Some(1000),
            min_cutoff_secs: 0.01,
            supervisor: None,
        }
    }
}

impl WrapperConfig {
    /// Defaults, overlaid by the JSON file at `path` (if any), then by the
    /// `SATWRAP_SUPERVISOR` and `SATWRAP_MEM_LIMIT` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = var("SATWRAP_SUPERVISOR").filter(|s| !s.is_empty()) {
            let supervisor = self.supervisor.get_or_insert_with(SupervisorConfig::default);
            supervisor.path = PathBuf::from(path);
        }
        if let Some(mb) = var("SATWRAP_MEM_LIMIT").filter(|s| !s.is_empty()) {
            let mb = mb
                .parse()
                .with_context(|| format!("SATWRAP_MEM_LIMIT is not a number: {}", mb))?;
            self.memory_limit_mb = Some(mb);
        }
        Ok(())
    }

    /// Timer floor. Values that do not fit a `Duration` disable it.
    pub fn min_cutoff(&self) -> Duration {
        Duration::try_from_secs_f64(self.min_cutoff_secs.max(0.0)).unwrap_or(Duration::ZERO)
    }

    /// Renders `seed_arg` for `seed`.
    pub fn seed_arg(&self, seed: i64) -> Option<String> {
        self.seed_arg
            .as_ref()
            .map(|template| template.replace("{seed}", &seed.to_string()))
    }
}

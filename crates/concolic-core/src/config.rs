//! Run and project configuration.
//!
//! `RunConfig` holds the knobs of one scheduler run (CLI flags land here);
//! `ProjectConfig` describes the target and is read from `concolic.toml` in
//! the project directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use concolic_explore::oracle::OracleConfig;
use concolic_explore::queue::DEFAULT_HISTORY_WINDOW;
use concolic_explore::selection::SelectionPolicy;
use concolic_sandbox::config::SandboxConfig;
use concolic_sandbox::harness::{ArgvHarness, Harness, ScriptHarness, TraceStream};
use serde::{Deserialize, Serialize};

/// Name of the project file inside a project directory.
pub const PROJECT_FILE: &str = "concolic.toml";

/// Placeholder in harness arguments replaced by the project directory path.
pub const PROJECT_PLACEHOLDER: &str = "{project}";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid project file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Termination budgets. At least one of `rounds`, `plateau_slot_secs`
/// or `overall_timeout_secs` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunLimits {
    /// Rounds to run in this session.
    pub rounds: Option<u64>,
    /// Stop once the ledger has not grown for this long.
    pub plateau_slot_secs: Option<u64>,
    /// Hard wall-clock cap for the whole session.
    pub overall_timeout_secs: Option<u64>,
    /// Stop once cumulative oracle cost reaches this many units.
    pub max_cost: Option<f64>,
}

impl RunLimits {
    pub fn plateau_slot(&self) -> Option<Duration> {
        self.plateau_slot_secs.map(Duration::from_secs)
    }

    pub fn overall_timeout(&self) -> Option<Duration> {
        self.overall_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            rounds: Some(10),
            plateau_slot_secs: None,
            overall_timeout_secs: None,
            max_cost: None,
        }
    }
}

/// Configuration for one scheduler run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Expansions per round.
    pub parallel_num: usize,
    pub selection: SelectionPolicy,
    /// Seed for every deterministic choice the scheduler makes.
    pub rng_seed: u64,
    pub limits: RunLimits,
    pub sandbox: SandboxConfig,
    pub oracle: OracleConfig,
    /// Prior candidate inputs remembered per seed.
    pub history_window: usize,
}

impl RunConfig {
    /// Reject configurations that cannot run or cannot terminate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel_num == 0 {
            return Err(ConfigError::Invalid("parallel_num must be at least 1".into()));
        }
        let limits = &self.limits;
        if limits.rounds.is_none()
            && limits.plateau_slot_secs.is_none()
            && limits.overall_timeout_secs.is_none()
        {
            return Err(ConfigError::Invalid(
                "no termination condition: set rounds, plateau slot or overall timeout".into(),
            ));
        }
        if limits.rounds == Some(0) {
            return Err(ConfigError::Invalid("rounds must be at least 1".into()));
        }
        if let Some(max_cost) = limits.max_cost {
            if !(max_cost.is_finite() && max_cost > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "max_cost must be a positive number, got {max_cost}"
                )));
            }
        }
        if self.sandbox.timeout_ms == 0 {
            return Err(ConfigError::Invalid("sandbox timeout must be positive".into()));
        }
        Ok(())
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallel_num: 4,
            selection: SelectionPolicy::Random,
            rng_seed: 42,
            limits: RunLimits::default(),
            sandbox: SandboxConfig::default(),
            oracle: OracleConfig::default(),
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

/// How the target is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HarnessConfig {
    /// Run `program` directly with `prefix_args` before the input's arguments.
    Argv {
        program: PathBuf,
        #[serde(default)]
        prefix_args: Vec<String>,
    },
    /// Hand the serialized input to a launcher script.
    Script {
        script: PathBuf,
        #[serde(default)]
        interpreter: Option<String>,
    },
}

/// Contents of `concolic.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub harness: HarnessConfig,
    /// Stream carrying instrumentation markers.
    #[serde(default)]
    pub trace_stream: TraceStream,
    /// Directory of instrumented sources, scanned for the marker catalog.
    #[serde(default)]
    pub source_dir: Option<PathBuf>,
    /// Treat any non-zero exit as a crash, not only signal deaths and
    /// sanitizer reports.
    #[serde(default)]
    pub crash_on_nonzero_exit: bool,
    /// Working directory of the target. Unset, every execution runs in its
    /// own scratch directory, where input files are written.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl ProjectConfig {
    /// Read `concolic.toml` from `project_dir`, resolving relative paths
    /// against that directory.
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let path = project_dir.join(PROJECT_FILE);
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut config: ProjectConfig =
            toml::from_str(&text).map_err(|source| ConfigError::Toml { path, source })?;
        config.resolve_paths(project_dir);
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        match &mut self.harness {
            HarnessConfig::Argv { program, .. } => {
                // Bare names (`python3`) are looked up on PATH.
                if program.components().count() > 1 {
                    resolve(program);
                }
            }
            HarnessConfig::Script { script, .. } => resolve(script),
        }
        if let Some(dir) = self.source_dir.as_mut() {
            resolve(dir);
        }
        if let Some(dir) = self.working_dir.as_mut() {
            resolve(dir);
        }
    }

    /// `{project}` in prefix arguments expands to `project_dir`.
    pub fn build_harness(&self, project_dir: &Path) -> Arc<dyn Harness> {
        let project = project_dir.to_string_lossy();
        match &self.harness {
            HarnessConfig::Argv {
                program,
                prefix_args,
            } => Arc::new(ArgvHarness {
                program: program.clone(),
                prefix_args: prefix_args
                    .iter()
                    .map(|arg| arg.replace(PROJECT_PLACEHOLDER, &project))
                    .collect(),
                cwd: self.working_dir.clone(),
                trace_stream: self.trace_stream,
            }),
            HarnessConfig::Script {
                script,
                interpreter,
            } => Arc::new(ScriptHarness {
                script: script.clone(),
                interpreter: interpreter.clone(),
                cwd: self.working_dir.clone(),
                trace_stream: self.trace_stream,
            }),
        }
    }
}

//! Replay a finished run against a coverage-instrumented build.
//!
//! Cases are re-executed in the order they were committed (`elapsed_ms`,
//! then id) and one CSV row is written per case:
//!
//! ```text
//! elapsed_ms,id,cost,crashes,hangs,markers_seen[,l_per,l_abs,b_per,b_abs,target_reached]
//! ```
//!
//! The bracketed columns appear only with a coverage script. The script is
//! run as `bash <script>` for totals and `bash <script> <file> <line> <text>`
//! for one line, from the project directory; both print
//! `l_per,l_abs,b_per,b_abs,hits`.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use concolic_explore::testcase::{CaseStatus, Cost, TargetLines, TestCase};
use concolic_sandbox::{Sandbox, SandboxConfig, SandboxError};
use concolic_trace::{parse_bytes, MarkerId};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::scheduler::Target;
use crate::store::{RunStore, StoreError};

/// Default per-case execution timeout for replay.
pub const DEFAULT_REPLAY_TIMEOUT_SECS: u64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Run store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Coverage script failed: {0}")]
    Coverage(String),

    #[error("Cannot write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One line of coverage-script output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageSample {
    pub line_percent: f64,
    pub lines: u64,
    pub branch_percent: f64,
    pub branches: u64,
    /// Hit count of the queried line; meaningless for totals.
    pub hits: u64,
}

impl CoverageSample {
    pub fn parse(output: &str) -> Result<Self, ReplayError> {
        let line = output
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .ok_or_else(|| ReplayError::Coverage("no output".into()))?;
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 5 {
            return Err(ReplayError::Coverage(format!(
                "expected 5 comma-separated fields, got `{line}`"
            )));
        }
        let num = |s: &str| -> Result<f64, ReplayError> {
            s.parse::<f64>()
                .map_err(|_| ReplayError::Coverage(format!("`{s}` is not a number in `{line}`")))
        };
        Ok(Self {
            line_percent: num(fields[0])?,
            lines: num(fields[1])? as u64,
            branch_percent: num(fields[2])?,
            branches: num(fields[3])? as u64,
            hits: num(fields[4])? as u64,
        })
    }
}

/// Wraps the project's coverage script.
#[derive(Debug, Clone)]
pub struct CoverageScript {
    script: PathBuf,
    project_dir: PathBuf,
}

impl CoverageScript {
    pub fn new(script: impl Into<PathBuf>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            project_dir: project_dir.into(),
        }
    }

    pub async fn totals(&self) -> Result<CoverageSample, ReplayError> {
        self.invoke(&[]).await
    }

    /// Hit count of one source line. Paths under the project directory are
    /// passed relative to it.
    pub async fn line_hits(&self, file: &str, line: u32, text: &str) -> Result<u64, ReplayError> {
        let path = Path::new(file);
        let file = path
            .strip_prefix(&self.project_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        let sample = self
            .invoke(&[file, line.to_string(), text.trim().to_string()])
            .await?;
        Ok(sample.hits)
    }

    async fn invoke(&self, args: &[String]) -> Result<CoverageSample, ReplayError> {
        debug!(script = %self.script.display(), ?args, "running coverage script");
        let output = Command::new("bash")
            .arg(&self.script)
            .args(args)
            .current_dir(&self.project_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ReplayError::Coverage(format!("cannot run bash: {e}")))?;
        if !output.status.success() {
            return Err(ReplayError::Coverage(format!(
                "{} exited with {}: {}",
                self.script.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        CoverageSample::parse(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Replay settings.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub output: PathBuf,
    pub coverage_script: Option<PathBuf>,
    pub timeout: Duration,
}

impl ReplayOptions {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            coverage_script: None,
            timeout: Duration::from_secs(DEFAULT_REPLAY_TIMEOUT_SECS),
        }
    }
}

/// Totals after a replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub rows: usize,
    pub executed: usize,
    pub crashes: u64,
    pub hangs: u64,
    pub markers_seen: usize,
    pub cost: Cost,
    /// Cases whose replayed crash or hang status differs from the recorded one.
    pub mismatches: Vec<u64>,
    pub crash_or_hang_ids: Vec<u64>,
    /// Final coverage totals, when a coverage script was given.
    pub coverage: Option<CoverageSample>,
}

/// Re-execute every case of the run in `store` and write the CSV time series.
pub async fn replay(
    store: &RunStore,
    target: &Target,
    project_dir: &Path,
    options: &ReplayOptions,
) -> Result<ReplaySummary, ReplayError> {
    let mut cases: Vec<TestCase> = store
        .load_cases()?
        .into_iter()
        .filter(|c| c.status.is_terminal())
        .collect();
    cases.sort_by_key(|c| (c.elapsed_ms, c.id));
    info!(cases = cases.len(), run = %store.dir().display(), "replay started");

    let sandbox = Sandbox::new(&SandboxConfig {
        timeout_ms: u64::try_from(options.timeout.as_millis()).unwrap_or(u64::MAX),
        ..SandboxConfig::default()
    });
    let coverage = options
        .coverage_script
        .as_ref()
        .map(|script| CoverageScript::new(script, project_dir));

    let out_err = |source| ReplayError::Output {
        path: options.output.clone(),
        source,
    };
    let mut out = BufWriter::new(File::create(&options.output).map_err(out_err)?);
    let mut header = String::from("elapsed_ms,id,cost,crashes,hangs,markers_seen");
    if coverage.is_some() {
        header.push_str(",l_per,l_abs,b_per,b_abs,target_reached");
    }
    writeln!(out, "{header}").map_err(out_err)?;

    let mut summary = ReplaySummary::default();
    let mut seen: BTreeSet<MarkerId> = BTreeSet::new();

    for case in &cases {
        summary.cost += case.cost;
        let mut target_reached = case.is_seed();
        let mut before = Vec::new();

        if case.status != CaseStatus::OracleFailed {
            if let (Some(cov), Some(lines)) = (&coverage, case.target.as_ref()) {
                if !case.is_seed() {
                    before = target_hits(cov, lines).await?;
                }
            }

            match sandbox.execute(target.harness.as_ref(), &case.input).await {
                Ok(outcome) => {
                    summary.executed += 1;
                    seen.extend(parse_bytes(&outcome.trace_text, outcome.trace_is_partial()).signature);

                    let crashed = target.crash_reason(&outcome).is_some();
                    let hung = outcome.timed_out;
                    let was_crash = case.status == CaseStatus::Crashed;
                    let was_hang = case.status == CaseStatus::TimedOut;
                    if crashed != was_crash || hung != was_hang {
                        warn!(
                            case_id = %case.id,
                            recorded = case.status.as_str(),
                            crashed,
                            hung,
                            "replayed status differs from the recorded one"
                        );
                        summary.mismatches.push(case.id.0);
                    }
                    if crashed || was_crash {
                        summary.crashes += 1;
                    }
                    if hung || was_hang {
                        summary.hangs += 1;
                    }
                    if crashed || hung || was_crash || was_hang {
                        summary.crash_or_hang_ids.push(case.id.0);
                    }
                }
                Err(SandboxError::Harness(err)) => {
                    error!(case_id = %case.id, error = %err, "case cannot be replayed");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut row = format!(
            "{},{},{},{},{},{}",
            case.elapsed_ms,
            case.id.0,
            summary.cost.units,
            summary.crashes,
            summary.hangs,
            seen.len()
        );
        if let Some(cov) = &coverage {
            let totals = cov.totals().await?;
            if !before.is_empty() {
                if let Some(lines) = case.target.as_ref() {
                    let after = target_hits(cov, lines).await?;
                    target_reached = after.iter().zip(&before).any(|(a, b)| a > b);
                }
            }
            row.push_str(&format!(
                ",{},{},{},{},{}",
                totals.line_percent,
                totals.lines,
                totals.branch_percent,
                totals.branches,
                target_reached
            ));
            summary.coverage = Some(totals);
        }
        writeln!(out, "{row}").map_err(out_err)?;
        summary.rows += 1;
        debug!(case_id = %case.id, status = case.status.as_str(), "case replayed");
    }

    out.flush().map_err(out_err)?;
    summary.markers_seen = seen.len();
    info!(
        rows = summary.rows,
        crashes = summary.crashes,
        hangs = summary.hangs,
        markers = summary.markers_seen,
        output = %options.output.display(),
        "replay finished"
    );
    if !summary.crash_or_hang_ids.is_empty() {
        info!(ids = ?summary.crash_or_hang_ids, "crashing or hanging cases");
    }
    Ok(summary)
}

/// Hit counts for every non-blank target line, in order.
async fn target_hits(cov: &CoverageScript, lines: &TargetLines) -> Result<Vec<u64>, ReplayError> {
    let mut hits = Vec::new();
    for (line, text) in lines.lines() {
        hits.push(cov.line_hits(&lines.file, line, text).await?);
    }
    Ok(hits)
}

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use concolic_core::store::RunStore;
use concolic_core::{ProjectConfig, RoundScheduler, RunConfig, RunSummary, Target};
use concolic_explore::oracle::CommandOracle;
use concolic_explore::testcase::TestInput;
use serde_json::Value;
use tracing::{info, warn};

use crate::RunArgs;

/// Written to the run directory when a session ends.
pub const SUMMARY_FILE: &str = "summary.json";

pub async fn execute(args: RunArgs) -> Result<ExitCode> {
    let project_dir = args.project_dir.clone();
    let project = ProjectConfig::load(&project_dir)?;
    let target = Target::from_project(&project, &project_dir)?;

    let oracle = CommandOracle::from_command_line(&args.oracle_cmd)
        .context("--oracle-cmd needs a program")?;
    let oracle = Arc::new(oracle);

    let scheduler = match &args.resume {
        Some(run_dir) => {
            let store = RunStore::open(run_dir)?;
            let base = store.load_config()?.unwrap_or_default();
            let config = apply_overrides(base, &args);
            info!(run = %run_dir.display(), "resuming run");
            RoundScheduler::resume(config, target, oracle, store)?
        }
        None => {
            let Some(out) = &args.out else {
                bail!("--out is required for a new run");
            };
            let seeds = args
                .seeds
                .iter()
                .map(|s| parse_seed_arg(s))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .flatten()
                .collect::<Vec<_>>();
            let config = apply_overrides(RunConfig::default(), &args);
            let store = RunStore::create(out)?;
            RoundScheduler::new(config, target, oracle, store, seeds)?
        }
    };

    let handle = scheduler.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing up");
            handle.cancel();
        }
    });

    let run_dir = args
        .resume
        .clone()
        .or_else(|| args.out.clone())
        .unwrap_or_default();
    let summary = scheduler.run().await?;
    print_summary(&summary);
    if let Err(err) = write_summary(&run_dir, &summary) {
        warn!(error = %err, "could not write {SUMMARY_FILE}");
    }

    Ok(ExitCode::from(summary.reason.exit_code() as u8))
}

fn apply_overrides(mut config: RunConfig, args: &RunArgs) -> RunConfig {
    if let Some(rounds) = args.rounds {
        config.limits.rounds = Some(rounds);
    }
    if let Some(selection) = args.selection {
        config.selection = selection;
    }
    if let Some(secs) = args.timeout {
        config.sandbox.timeout_ms = secs.saturating_mul(1000);
    }
    if let Some(secs) = args.plateau_slot {
        config.limits.plateau_slot_secs = Some(secs);
    }
    if let Some(n) = args.parallel_num {
        config.parallel_num = n;
    }
    if let Some(secs) = args.overall_timeout {
        config.limits.overall_timeout_secs = Some(secs);
    }
    if let Some(units) = args.max_cost {
        config.limits.max_cost = Some(units);
    }
    if let Some(seed) = args.rng_seed {
        config.rng_seed = seed;
    }
    config
}

/// A `--seed` value: inline JSON, or `@path` to a file holding the same.
fn parse_seed_arg(arg: &str) -> Result<Vec<TestInput>> {
    match arg.strip_prefix('@') {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read seed file {path}"))?;
            parse_seeds(&text).with_context(|| format!("bad seed file {path}"))
        }
        None => parse_seeds(arg).with_context(|| format!("bad seed `{arg}`")),
    }
}

/// Accepts an input object, an argument list, or an array of either.
fn parse_seeds(text: &str) -> Result<Vec<TestInput>> {
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::Object(_) => Ok(vec![serde_json::from_value(value)?]),
        Value::Array(items) if items.iter().all(Value::is_string) => {
            let args: Vec<String> = items
                .into_iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
            Ok(vec![TestInput::from_args(args)])
        }
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Array(_) | Value::Object(_) => {
                    let mut one = parse_seeds(&item.to_string())?;
                    one.pop().context("empty seed")
                }
                other => bail!("expected an input object or argument list, got {other}"),
            })
            .collect(),
        other => bail!("expected an input object or argument list, got {other}"),
    }
}

fn print_summary(summary: &RunSummary) {
    println!("stopped: {}", summary.reason);
    println!(
        "rounds: {} this session (last round {})",
        summary.rounds_completed, summary.last_round
    );
    println!(
        "cases: {} committed, {} in queue",
        summary.cases, summary.queue_len
    );
    if summary.catalog_total > 0 {
        println!(
            "coverage: {} markers seen, {}/{} catalog markers",
            summary.markers_seen, summary.catalog_hit, summary.catalog_total
        );
    } else {
        println!("coverage: {} markers seen", summary.markers_seen);
    }
    let totals = &summary.analytics.totals;
    println!(
        "outcomes: {} crashes, {} hangs, {} oracle failures, {} launch failures",
        totals.crashes, totals.hangs, totals.oracle_failures, totals.launch_failures
    );
    println!(
        "oracle cost: {:.4} units over {} calls",
        summary.cost.units, summary.cost.calls
    );
}

fn write_summary(run_dir: &Path, summary: &RunSummary) -> Result<()> {
    let path = run_dir.join(SUMMARY_FILE);
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(&path, json).with_context(|| format!("cannot write {}", path.display()))?;
    Ok(())
}

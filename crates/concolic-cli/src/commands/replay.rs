use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use concolic_core::replay::{replay, ReplayOptions};
use concolic_core::store::RunStore;
use concolic_core::{ProjectConfig, Target};

use crate::ReplayArgs;

pub async fn execute(args: ReplayArgs) -> Result<ExitCode> {
    let project = ProjectConfig::load(&args.project_dir)?;
    let target = Target::from_project(&project, &args.project_dir)?;
    let store = RunStore::open(&args.run_dir)?;

    let mut options = ReplayOptions::new(&args.output_csv);
    options.coverage_script = args.cov_script.clone();
    options.timeout = Duration::from_secs(args.timeout);

    let summary = replay(&store, &target, &args.project_dir, &options).await?;

    println!(
        "replayed {} cases ({} executed) into {}",
        summary.rows,
        summary.executed,
        args.output_csv.display()
    );
    println!(
        "{} crashes, {} hangs, {} markers seen, {:.4} oracle units",
        summary.crashes, summary.hangs, summary.markers_seen, summary.cost.units
    );
    if let Some(cov) = &summary.coverage {
        println!(
            "coverage: {:.2}% lines ({}), {:.2}% branches ({})",
            cov.line_percent, cov.lines, cov.branch_percent, cov.branches
        );
    }
    if !summary.crash_or_hang_ids.is_empty() {
        let ids: Vec<String> = summary.crash_or_hang_ids.iter().map(u64::to_string).collect();
        println!("crash/hang cases: {}", ids.join(" "));
    }
    if !summary.mismatches.is_empty() {
        let ids: Vec<String> = summary.mismatches.iter().map(u64::to_string).collect();
        println!("status differs from the recorded run: {}", ids.join(" "));
    }
    Ok(ExitCode::SUCCESS)
}

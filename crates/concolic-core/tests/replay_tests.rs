#![cfg(unix)]

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::*;
use concolic_core::replay::{replay, ReplayOptions};
use concolic_core::scheduler::Target;
use concolic_core::store::RunStore;
use concolic_explore::testcase::TestInput;
use concolic_sandbox::{ArgvHarness, TraceStream};

/// Fixed totals; per-line queries report how often the bug path ran.
const COVERAGE_SCRIPT: &str = r#"
if [ $# -eq 0 ]; then
  echo "50.0,10,25.0,2,0"
else
  n=$(cat bug.log 2>/dev/null | wc -l)
  echo "50.0,10,25.0,2,$n"
fi
"#;

/// A target whose working directory is the project, so `bug.log` lands there.
fn project_target(project: &Path, script: &Path) -> Target {
    Target::new(Arc::new(ArgvHarness {
        program: PathBuf::from("/bin/sh"),
        prefix_args: vec![script.display().to_string()],
        cwd: Some(project.to_path_buf()),
        trace_stream: TraceStream::Stderr,
    }))
}

async fn count_run(root: &Path) -> (PathBuf, PathBuf, Target) {
    let project = root.join("project");
    std::fs::create_dir_all(&project).unwrap();
    let script = write_script(&project, "count.sh", COUNT_TARGET);
    let run_dir = root.join("run");
    let target = project_target(&project, &script);

    let scheduler = new_scheduler(
        &run_dir,
        config(2, 2),
        target.clone(),
        StubOracle::new(widening_walk),
        vec![count_seed()],
    );
    scheduler.run().await.unwrap();
    (project, run_dir, target)
}

fn rows(csv: &Path) -> Vec<Vec<String>> {
    std::fs::read_to_string(csv)
        .unwrap()
        .lines()
        .map(|l| l.split(',').map(String::from).collect())
        .collect()
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (project, run_dir, target) = count_run(dir.path()).await;
    let store = RunStore::open(&run_dir).unwrap();

    let first_csv = dir.path().join("first.csv");
    let second_csv = dir.path().join("second.csv");
    let first = replay(&store, &target, &project, &ReplayOptions::new(&first_csv))
        .await
        .unwrap();
    let second = replay(&store, &target, &project, &ReplayOptions::new(&second_csv))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(
        std::fs::read_to_string(&first_csv).unwrap(),
        std::fs::read_to_string(&second_csv).unwrap()
    );

    let table = rows(&first_csv);
    assert_eq!(table[0].join(","), "elapsed_ms,id,cost,crashes,hangs,markers_seen");
    // Seed plus two candidates per round.
    assert_eq!(table.len(), 1 + 5);
    assert_eq!(first.rows, 5);
    assert!(first.mismatches.is_empty());

    let ledger = store.load_ledger().unwrap().unwrap();
    assert_eq!(first.markers_seen, ledger.len());
    let last_seen: usize = table.last().unwrap()[5].parse().unwrap();
    assert_eq!(last_seen, ledger.len());
}

#[tokio::test]
async fn test_replay_rows_follow_commit_order_and_cost_is_cumulative() {
    let dir = tempfile::tempdir().unwrap();
    let (project, run_dir, target) = count_run(dir.path()).await;
    let store = RunStore::open(&run_dir).unwrap();
    let csv = dir.path().join("out.csv");

    replay(&store, &target, &project, &ReplayOptions::new(&csv))
        .await
        .unwrap();

    let table = rows(&csv);
    let elapsed: Vec<u64> = table[1..].iter().map(|r| r[0].parse().unwrap()).collect();
    assert!(elapsed.windows(2).all(|w| w[0] <= w[1]));
    let costs: Vec<f64> = table[1..].iter().map(|r| r[2].parse().unwrap()).collect();
    assert!(costs.windows(2).all(|w| w[0] <= w[1]));
    assert!((costs.last().unwrap() - 0.04).abs() < 1e-9);
}

#[tokio::test]
async fn test_replay_with_coverage_script_checks_target_lines() {
    let dir = tempfile::tempdir().unwrap();
    let (project, run_dir, target) = count_run(dir.path()).await;
    let cov = write_script(&project, "cov.sh", COVERAGE_SCRIPT);
    let store = RunStore::open(&run_dir).unwrap();
    let csv = dir.path().join("cov.csv");

    let mut options = ReplayOptions::new(&csv);
    options.coverage_script = Some(cov);
    let summary = replay(&store, &target, &project, &options).await.unwrap();
    assert_eq!(summary.coverage.map(|c| c.lines), Some(10));

    let table = rows(&csv);
    assert_eq!(
        table[0].join(","),
        "elapsed_ms,id,cost,crashes,hangs,markers_seen,l_per,l_abs,b_per,b_abs,target_reached"
    );

    let cases = store.load_cases().unwrap();
    for row in &table[1..] {
        let id: u64 = row[1].parse().unwrap();
        let case = cases.iter().find(|c| c.id.0 == id).unwrap();
        let reached_bug = case.signature.contains(&marker(14));
        let expected = case.is_seed() || reached_bug;
        assert_eq!(row[10], expected.to_string(), "case {id}");
        assert_eq!(row[7], "10");
    }
}

#[tokio::test]
async fn test_replay_counts_crashes() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    std::fs::create_dir_all(&project).unwrap();
    let script = write_script(&project, "crashy.sh", CRASHY_TARGET);
    let run_dir = dir.path().join("run");
    let target = project_target(&project, &script);

    let scheduler = new_scheduler(
        &run_dir,
        config(2, 2),
        target.clone(),
        StubOracle::new(always_crash),
        vec![TestInput::from_args(["seed"])],
    );
    scheduler.run().await.unwrap();

    let store = RunStore::open(&run_dir).unwrap();
    let csv = dir.path().join("crash.csv");
    let summary = replay(&store, &target, &project, &ReplayOptions::new(&csv))
        .await
        .unwrap();

    assert_eq!(summary.crashes, 4);
    assert_eq!(summary.hangs, 0);
    assert_eq!(summary.crash_or_hang_ids.len(), 4);
    assert!(summary.mismatches.is_empty());
    let table = rows(&csv);
    assert_eq!(table.last().unwrap()[3], "4");
}

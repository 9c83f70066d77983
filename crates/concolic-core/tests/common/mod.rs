#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concolic_core::config::{RunConfig, RunLimits};
use concolic_core::scheduler::{RoundScheduler, Target};
use concolic_core::store::RunStore;
use concolic_explore::oracle::{
    Oracle, OracleConfig, OracleError, OracleReply, OracleRequest, OracleResponse, Proposal,
    RetryPolicy,
};
use concolic_explore::testcase::{Cost, TargetLines, TestInput};
use concolic_sandbox::{ArgvHarness, SandboxConfig};
use concolic_trace::MarkerId;

/// Shell rendition of the instrumented `count` target: walks from `$1` to
/// `$2` in steps of 1e-5 and hits the bug marker once the walk takes three
/// or more steps. Appends to `bug.log` in its working directory on the bug
/// path so coverage scripts can count hits.
pub const COUNT_TARGET: &str = r#"
echo "[count.c] enter main 1" >&2
if [ $# -ne 2 ]; then
  echo "[count.c] enter main 2" >&2
  exit 1
fi
echo "[count.c] enter main 3" >&2
case "$1" in
  ''|*[!0-9.]*) echo "[count.c] enter main 4" >&2; exit 1 ;;
esac
echo "[count.c] enter main 5" >&2
case "$2" in
  ''|*[!0-9.]*) echo "[count.c] enter main 6" >&2; exit 1 ;;
esac
echo "[count.c] enter main 7" >&2
if [ "$1" = "$2" ]; then
  echo "[count.c] enter main 8" >&2
  exit 1
fi
echo "[count.c] enter main 9" >&2
steps=$(awk -v s="$1" -v e="$2" 'BEGIN { d = (e - s) * 100000; if (d < 0) d = -d; printf "%d", d + 0.5 }')
if [ "$steps" -gt 1000 ]; then
  echo "[count.c] enter main 10" >&2
  exit 1
fi
echo "[count.c] enter main 11" >&2
i=0
while [ "$i" -lt "$steps" ]; do
  echo "[count.c] enter main 12" >&2
  i=$((i + 1))
done
echo "[count.c] enter main 13" >&2
if [ "$steps" -ge 3 ]; then
  echo "[count.c] enter main 14" >&2
  echo "BUG triggered!"
  echo hit >> bug.log
  exit 1
fi
exit 0
"#;

/// Crashes on every input except the seed's.
pub const CRASHY_TARGET: &str = r#"
echo "[crashy.c] enter main 1" >&2
if [ "$1" = "seed" ]; then
  echo "[crashy.c] enter main 2" >&2
  exit 0
fi
echo "[crashy.c] enter main 3" >&2
kill -SEGV $$
"#;

/// Crashes on every input, seeds included.
pub const ALWAYS_CRASH_TARGET: &str = r#"
echo "[boom.c] enter main 1" >&2
kill -SEGV $$
"#;

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// A target that runs `script` through `/bin/sh`.
pub fn sh_target(script: &Path) -> Target {
    Target::new(Arc::new(
        ArgvHarness::new("/bin/sh").with_prefix_args(vec![script.display().to_string()]),
    ))
}

pub fn marker(n: u32) -> MarkerId {
    MarkerId::enter("count.c", "main", n)
}

pub fn config(parallel_num: usize, rounds: u64) -> RunConfig {
    RunConfig {
        parallel_num,
        rng_seed: 7,
        limits: RunLimits {
            rounds: Some(rounds),
            plateau_slot_secs: None,
            overall_timeout_secs: Some(60),
            max_cost: None,
        },
        sandbox: SandboxConfig {
            timeout_ms: 5_000,
            ..SandboxConfig::default()
        },
        oracle: OracleConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                base_backoff_ms: 1,
                max_backoff_ms: 2,
            },
            attempt_timeout_ms: 30_000,
            ..OracleConfig::default()
        },
        ..RunConfig::default()
    }
}

pub fn count_seed() -> TestInput {
    TestInput::from_args(["1.0", "1.00001"])
}

type Reply = fn(u32, &OracleRequest) -> Result<OracleResponse, OracleError>;

/// Deterministic oracle: `reply` gets the call number (from 0) and the request.
pub struct StubOracle {
    reply: Reply,
    delay: Duration,
    calls: AtomicU32,
}

impl StubOracle {
    pub fn new(reply: Reply) -> Arc<Self> {
        Self::slow(reply, Duration::ZERO)
    }

    pub fn slow(reply: Reply, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply,
            delay,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Oracle for StubOracle {
    fn name(&self) -> &str {
        "stub"
    }

    async fn exchange(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.reply)(n, request)
    }
}

pub fn propose(input: TestInput, target: Option<TargetLines>) -> Result<OracleResponse, OracleError> {
    Ok(OracleResponse {
        reply: OracleReply::Proposal(Proposal {
            input,
            summary: Some("widen the walk".into()),
            target,
        }),
        cost: Cost {
            units: 0.01,
            input_tokens: 100,
            output_tokens: 20,
            calls: 1,
        },
    })
}

/// Walks of 2, 3, 4... steps from the seed's start point, aimed at the bug line.
pub fn widening_walk(n: u32, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
    let start = request.seed_input.args[0].clone();
    let end = format!("1.{:05}", n + 2);
    propose(
        TestInput::from_args([start, end]),
        Some(TargetLines {
            file: "count.c".into(),
            start: 40,
            end: 42,
            content: vec!["  if (count <= FLOATS_BETWEEN_BUG) {".into(), "".into(), "    bug();".into()],
        }),
    )
}

/// Always hands back the seed's own input.
pub fn echo_seed(_n: u32, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
    propose(request.seed_input.clone(), None)
}

pub fn always_crash(_n: u32, _request: &OracleRequest) -> Result<OracleResponse, OracleError> {
    propose(TestInput::from_args(["crash"]), None)
}

pub fn malformed(_n: u32, _request: &OracleRequest) -> Result<OracleResponse, OracleError> {
    Err(OracleError::Malformed {
        message: "expected JSON, got prose".into(),
        cost: Cost {
            units: 0.005,
            ..Cost::default()
        },
    })
}

pub fn new_scheduler(
    run_dir: &Path,
    config: RunConfig,
    target: Target,
    oracle: Arc<dyn Oracle>,
    seeds: Vec<TestInput>,
) -> RoundScheduler {
    let store = RunStore::create(run_dir).unwrap();
    RoundScheduler::new(config, target, oracle, store, seeds).unwrap()
}

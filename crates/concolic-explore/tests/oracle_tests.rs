#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use concolic_explore::oracle::{
    CommandOracle, FailureKind, OracleClient, OracleConfig, OracleRequest, RetryPolicy,
};
use concolic_explore::testcase::{CaseId, TestInput};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn sh_oracle(script: &Path) -> CommandOracle {
    CommandOracle::new("/bin/sh", vec![script.display().to_string()])
}

fn request() -> OracleRequest {
    OracleRequest {
        round: 1,
        seed_id: CaseId(0),
        seed_input: TestInput::from_args(["1.0", "1.00001"]),
        call_chain: Default::default(),
        trace_excerpt: vec!["[count.c] enter main 1".into()],
        trace_truncated: false,
        prior_attempts: vec![],
        history: (0, 0),
        missing_markers: vec![],
    }
}

fn config() -> OracleConfig {
    OracleConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            base_backoff_ms: 1,
            max_backoff_ms: 1,
        },
        attempt_timeout_ms: 5_000,
        ..OracleConfig::default()
    }
}

#[tokio::test]
async fn test_command_oracle_reads_request_and_proposes() {
    let dir = tempfile::tempdir().unwrap();
    // Echo the seed id back inside the summary to prove the request arrived.
    let script = write_script(
        dir.path(),
        "oracle.sh",
        r#"req=$(cat)
case "$req" in
  *'"seed_id":0'*) seen=yes ;;
  *) seen=no ;;
esac
printf '{"status":"proposal","input":{"args":["1.0","1.000002"]},"summary":"%s","cost":{"units":0.01}}' "$seen"
"#,
    );
    let client = OracleClient::new(Arc::new(sh_oracle(&script)), config());

    let proposed = client.propose(&request()).await.unwrap();
    assert_eq!(proposed.proposal.input.args, vec!["1.0", "1.000002"]);
    assert_eq!(proposed.proposal.summary.as_deref(), Some("yes"));
    assert_eq!(proposed.attempts, 1);
    assert_eq!(proposed.cost.calls, 1);
}

#[tokio::test]
async fn test_command_oracle_nonzero_exit_is_transport() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "fail.sh", "cat >/dev/null\necho boom >&2\nexit 3\n");
    let client = OracleClient::new(Arc::new(sh_oracle(&script)), config());

    let failure = client.propose(&request()).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Transport);
    assert_eq!(failure.attempts, 2);
    assert!(failure.message.contains("boom"));
}

#[tokio::test]
async fn test_command_oracle_prose_is_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "chatty.sh", "cat >/dev/null\necho 'try a bigger number'\n");
    let client = OracleClient::new(Arc::new(sh_oracle(&script)), config());

    let failure = client.propose(&request()).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Malformed);
    assert_eq!(failure.cost.calls, 2);
}

#[tokio::test]
async fn test_missing_oracle_program_is_transport() {
    let oracle = CommandOracle::new("/definitely/not/an/oracle", vec![]);
    let client = OracleClient::new(Arc::new(oracle), config());
    let failure = client.propose(&request()).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Transport);
}

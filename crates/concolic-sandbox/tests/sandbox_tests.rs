#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use concolic_sandbox::config::SandboxConfig;
use concolic_sandbox::harness::{ArgvHarness, ScriptHarness, TraceStream};
use concolic_sandbox::input::TestInput;
use concolic_sandbox::sandbox::{Sandbox, SandboxError, SIGKILL};

/// Helper: write a shell script into `dir`.
fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// Helper: run `script` through `/bin/sh` (no exec bit, no ETXTBSY races).
fn sh(script: &Path) -> ArgvHarness {
    ArgvHarness::new("/bin/sh").with_prefix_args(vec![script.display().to_string()])
}

/// Toy target: marker per branch, exit 1 on the "bug" branch.
const BRANCHY: &str = r#"
echo "[toy.sh] enter main 1" >&2
if [ "$1" = "bug" ]; then
  echo "[toy.sh] enter main 2" >&2
  echo "BUG triggered!"
  exit 1
fi
echo "[toy.sh] enter main 3" >&2
exit 0
"#;

#[tokio::test]
async fn test_normal_exit_captures_streams() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_script(dir.path(), "toy.sh", BRANCHY);
    let sandbox = Sandbox::new(&SandboxConfig::default());
    let harness = sh(&target);

    let outcome = sandbox
        .execute(&harness, &TestInput::from_args(["ok"]))
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, Some(0));
    assert!(outcome.success());
    assert!(!outcome.timed_out);
    assert_eq!(
        String::from_utf8_lossy(&outcome.trace_text),
        "[toy.sh] enter main 1\n[toy.sh] enter main 3\n"
    );
}

#[tokio::test]
async fn test_nonzero_exit_is_data_not_error() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_script(dir.path(), "toy.sh", BRANCHY);
    let sandbox = Sandbox::new(&SandboxConfig::default());
    let harness = sh(&target);

    let outcome = sandbox
        .execute(&harness, &TestInput::from_args(["bug"]))
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, Some(1));
    assert_eq!(outcome.harness_code(), 1);
    assert!(!outcome.is_crash());
    assert_eq!(String::from_utf8_lossy(&outcome.stdout), "BUG triggered!\n");
}

#[tokio::test]
async fn test_signal_death_is_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_script(
        dir.path(),
        "segv.sh",
        "echo \"[segv.sh] enter main 1\" >&2\nkill -SEGV $$\n",
    );
    let sandbox = Sandbox::new(&SandboxConfig::default());

    let outcome = sandbox
        .execute(&sh(&target), &TestInput::default())
        .await
        .unwrap();
    assert_eq!(outcome.signal, Some(11));
    assert_eq!(outcome.harness_code(), -11);
    assert_eq!(outcome.crash_reason().as_deref(), Some("SIGSEGV"));
    assert!(String::from_utf8_lossy(&outcome.trace_text).contains("enter main 1"));
}

#[tokio::test]
async fn test_timeout_kills_and_keeps_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_script(
        dir.path(),
        "hang.sh",
        "echo \"[hang.sh] enter main 1\" >&2\nexec sleep 30\n",
    );
    let sandbox = Sandbox::new(&SandboxConfig::default());

    let outcome = sandbox
        .run(
            &sh(&target),
            &TestInput::default(),
            Duration::from_millis(300),
        )
        .await
        .unwrap();
    assert!(outcome.timed_out);
    assert_eq!(outcome.harness_code(), -SIGKILL);
    assert!(!outcome.is_crash());
    assert!(outcome.duration < Duration::from_secs(10));
    assert_eq!(
        String::from_utf8_lossy(&outcome.trace_text),
        "[hang.sh] enter main 1\n"
    );
}

#[tokio::test]
async fn test_stdin_and_files_are_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_script(
        dir.path(),
        "cat.sh",
        "read line\necho \"stdin=$line\"\ncat data/in.txt\n",
    );
    let sandbox = Sandbox::new(&SandboxConfig::default());
    let input = TestInput::default()
        .with_stdin("hello\n")
        .with_file("data/in.txt", "from-file");

    let outcome = sandbox
        .execute(&sh(&target), &input)
        .await
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&outcome.stdout),
        "stdin=hello\nfrom-file"
    );
}

#[tokio::test]
async fn test_env_is_scoped_when_not_inherited() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_script(dir.path(), "env.sh", "echo \"${MODE:-unset}:${HOME:-nohome}\"\n");
    let config = SandboxConfig {
        inherit_env: false,
        ..SandboxConfig::default()
    };
    let sandbox = Sandbox::new(&config);
    let input = TestInput::default().with_env("MODE", "fast");

    let outcome = sandbox
        .execute(&sh(&target), &input)
        .await
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&outcome.stdout), "fast:nohome\n");
}

#[tokio::test]
async fn test_output_is_truncated_at_limit() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_script(
        dir.path(),
        "loud.sh",
        "i=0\nwhile [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done\n",
    );
    let config = SandboxConfig {
        max_output_bytes: 64,
        ..SandboxConfig::default()
    };
    let sandbox = Sandbox::new(&config);

    let outcome = sandbox
        .execute(&sh(&target), &TestInput::default())
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.stdout.len(), 64);
    assert!(outcome.truncated);
    // Markers go to stderr, which stayed under the cap.
    assert!(!outcome.trace_truncated);
    assert!(!outcome.trace_is_partial());
}

#[tokio::test]
async fn test_cut_trace_stream_is_partial() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_script(dir.path(), "cut.sh", "echo '[t.c] enter main 12' >&2
");
    let config = SandboxConfig {
        max_output_bytes: 18,
        ..SandboxConfig::default()
    };
    let sandbox = Sandbox::new(&config);

    let outcome = sandbox
        .execute(&sh(&target), &TestInput::default())
        .await
        .unwrap();
    assert_eq!(outcome.trace_text, b"[t.c] enter main 1".to_vec());
    assert!(outcome.trace_truncated);
    assert!(outcome.trace_is_partial());
}

#[tokio::test]
async fn test_script_harness_relays_target() {
    let dir = tempfile::tempdir().unwrap();
    let target = write_script(dir.path(), "toy.sh", BRANCHY);
    let launcher = write_script(
        dir.path(),
        "launch.sh",
        &format!(
            "if grep -q '\"bug\"' \"$1\"; then arg=bug; else arg=ok; fi\nexec /bin/sh {} \"$arg\"\n",
            target.display()
        ),
    );
    let sandbox = Sandbox::new(&SandboxConfig::default());
    let mut harness = ScriptHarness::new(launcher).with_interpreter("/bin/sh");
    harness.trace_stream = TraceStream::Stderr;

    let outcome = sandbox
        .execute(&harness, &TestInput::from_args(["bug"]))
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, Some(1));
    assert!(String::from_utf8_lossy(&outcome.trace_text).contains("enter main 2"));
}

#[tokio::test]
async fn test_missing_program_is_launch_error() {
    let sandbox = Sandbox::new(&SandboxConfig::default());
    let harness = ArgvHarness::new("/definitely/not/a/program");
    let err = sandbox
        .execute(&harness, &TestInput::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Launch { .. }));
}

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::harness::{Harness, HarnessError, TraceStream};
use crate::input::TestInput;

/// Signal number reported for a child killed on timeout.
pub const SIGKILL: i32 = 9;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Scratch directory error: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("Harness error: {0}")]
    Harness(#[from] HarnessError),

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for child: {0}")]
    Wait(#[source] std::io::Error),
}

/// What one execution produced. Abnormal termination is data here, not an
/// error: a crash or a timeout still yields an outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Exit status when the child exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal when the child died from one.
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// The stream the harness designated as carrying markers.
    pub trace_text: Vec<u8>,
    pub timed_out: bool,
    /// Some stream exceeded `max_output_bytes` and was cut.
    pub truncated: bool,
    /// The trace stream itself was cut.
    pub trace_truncated: bool,
    pub duration: Duration,
}

impl ExecutionOutcome {
    /// Single integer status: the exit code, or `-signal` for signal deaths
    /// (a timed-out run reports `-SIGKILL`).
    pub fn harness_code(&self) -> i32 {
        if self.timed_out {
            return -SIGKILL;
        }
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => -sig,
            (None, None) => -1,
        }
    }

    /// Why the run counts as a crash, if it does: a fatal signal or a
    /// sanitizer report on stderr. Timeouts are not crashes.
    pub fn crash_reason(&self) -> Option<String> {
        if self.timed_out {
            return None;
        }
        if let Some(sig) = self.signal {
            return Some(signal_name(sig));
        }
        sanitizer_report(&self.stderr)
    }

    pub fn is_crash(&self) -> bool {
        self.crash_reason().is_some()
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// The trace may end mid-line, so its last unterminated line is not
    /// evidence.
    pub fn trace_is_partial(&self) -> bool {
        self.timed_out || self.trace_truncated
    }
}

fn signal_name(sig: i32) -> String {
    match sig {
        4 => "SIGILL".to_string(),
        6 => "SIGABRT".to_string(),
        7 => "SIGBUS".to_string(),
        8 => "SIGFPE".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("signal {other}"),
    }
}

const SANITIZER_MARKERS: &[&str] = &[
    "ERROR: AddressSanitizer",
    "ERROR: LeakSanitizer",
    "WARNING: MemorySanitizer",
    "WARNING: ThreadSanitizer",
    "runtime error:",
];

fn sanitizer_report(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    text.lines()
        .find(|line| SANITIZER_MARKERS.iter().any(|m| line.contains(m)))
        .map(|line| line.trim().to_string())
}

/// The process sandbox. Runs one target invocation per call with no state
/// shared between calls.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Execute `input` through `harness` with the configured timeout.
    pub async fn execute(
        &self,
        harness: &dyn Harness,
        input: &TestInput,
    ) -> Result<ExecutionOutcome, SandboxError> {
        self.run(harness, input, self.config.timeout()).await
    }

    /// Execute `input` through `harness`, killing the child after `timeout`.
    pub async fn run(
        &self,
        harness: &dyn Harness,
        input: &TestInput,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let scratch = tempfile::Builder::new()
            .prefix("concolic-run-")
            .tempdir()
            .map_err(SandboxError::Scratch)?;
        let invocation = harness.prepare(input, scratch.path())?;
        let program = invocation.program.to_string_lossy().into_owned();

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.config.inherit_env {
            cmd.env_clear();
            if let Some(path) = std::env::var_os("PATH") {
                cmd.env("PATH", path);
            }
        }
        cmd.envs(&invocation.env);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Launch {
            program: program.clone(),
            source,
        })?;

        if let (Some(mut stdin), Some(bytes)) = (child.stdin.take(), invocation.stdin) {
            // A target that exits without reading its stdin closes the pipe;
            // that is not a sandbox failure.
            tokio::spawn(async move {
                let _ = stdin.write_all(&bytes).await;
            });
        }

        let limit = self.config.max_output_bytes;
        let stdout = Capture::start(child.stdout.take(), limit);
        let stderr = Capture::start(child.stderr.take(), limit);

        let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (status.map_err(SandboxError::Wait)?, false),
            Err(_) => {
                debug!(
                    program = %program,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "killing timed-out child"
                );
                if let Err(err) = child.start_kill() {
                    warn!(program = %program, error = %err, "failed to kill child");
                }
                (child.wait().await.map_err(SandboxError::Wait)?, true)
            }
        };
        let duration = started.elapsed();

        // Grandchildren may keep the pipes open; bound how long we wait.
        let grace = self.config.kill_grace();
        let (stdout, stdout_cut) = stdout.finish(grace).await;
        let (stderr, stderr_cut) = stderr.finish(grace).await;

        let (exit_code, signal) = split_status(status);
        let (trace_text, trace_truncated) = match invocation.trace_stream {
            TraceStream::Stderr => (stderr.clone(), stderr_cut),
            TraceStream::Stdout => (stdout.clone(), stdout_cut),
        };

        debug!(
            program = %program,
            harness = harness.name(),
            exit_code = ?exit_code,
            signal = ?signal,
            timed_out,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "execution finished"
        );

        Ok(ExecutionOutcome {
            exit_code,
            signal,
            stdout,
            stderr,
            trace_text,
            timed_out,
            truncated: stdout_cut || stderr_cut,
            trace_truncated,
            duration,
        })
    }
}

/// A stream being drained into a shared buffer. The buffer outlives the
/// reader task, so whatever arrived before a kill is still available.
struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    truncated: Arc<Mutex<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    fn start<R>(stream: Option<R>, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let truncated = Arc::new(Mutex::new(false));
        let task = stream.map(|mut stream| {
            let buffer = Arc::clone(&buffer);
            let truncated = Arc::clone(&truncated);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut buf = buffer.lock();
                            let room = limit.saturating_sub(buf.len());
                            if n > room {
                                *truncated.lock() = true;
                            }
                            buf.extend_from_slice(&chunk[..n.min(room)]);
                        }
                    }
                }
            })
        });
        Self {
            buffer,
            truncated,
            task,
        }
    }

    async fn finish(self, grace: Duration) -> (Vec<u8>, bool) {
        if let Some(mut task) = self.task {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }
        let bytes = std::mem::take(&mut *self.buffer.lock());
        let truncated = *self.truncated.lock();
        (bytes, truncated)
    }
}

#[cfg(unix)]
fn split_status(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(not(unix))]
fn split_status(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), None)
}

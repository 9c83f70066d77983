//! Sandbox configuration: wall-clock limits and output capture bounds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the process sandbox.
///
/// Controls how long a target may run, how much of its output is kept, and
/// what environment it sees. Each run gets a fresh scratch directory; nothing
/// persists between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock limit per execution in milliseconds (default: 3 s).
    pub timeout_ms: u64,
    /// Captured bytes kept per stream; the rest is read and discarded.
    pub max_output_bytes: usize,
    /// Time allowed for output pipes to drain after the child is killed.
    pub kill_grace_ms: u64,
    /// Pass the scheduler's environment through to the target. When false,
    /// only `PATH` and the input's own variables are set.
    pub inherit_env: bool,
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            max_output_bytes: 4 * 1024 * 1024, // 4 MB
            kill_grace_ms: 200,
            inherit_env: true,
        }
    }
}

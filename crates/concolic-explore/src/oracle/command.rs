//! An oracle backed by an external program.
//!
//! The program receives one JSON [`OracleRequest`] on stdin and must print
//! one JSON reply on stdout:
//!
//! ```json
//! {"status": "proposal", "input": {"args": ["1.0", "1.000002"]},
//!  "summary": "count <= 20", "cost": {"units": 0.01}}
//! {"status": "declined", "reason": "no feasible branch"}
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Oracle, OracleError, OracleReply, OracleRequest, OracleResponse, Proposal};
use crate::testcase::{Cost, TargetLines, TestInput};

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WireReply {
    Proposal {
        input: TestInput,
        #[serde(default)]
        summary: Option<String>,
        #[serde(default)]
        target: Option<TargetLines>,
        #[serde(default)]
        cost: Cost,
    },
    Declined {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        cost: Cost,
    },
}

#[derive(Debug, Clone)]
pub struct CommandOracle {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl CommandOracle {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
        }
    }

    /// Build from a command line: the first word is the program.
    pub fn from_command_line(words: &[String]) -> Option<Self> {
        let (program, args) = words.split_first()?;
        Some(Self::new(program, args.to_vec()))
    }
}

#[async_trait]
impl Oracle for CommandOracle {
    fn name(&self) -> &str {
        "command"
    }

    async fn exchange(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| OracleError::Transport(format!("cannot encode request: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OracleError::Transport(format!("cannot launch {}: {e}", self.program.display()))
            })?;

        // Write and read concurrently so a chatty oracle cannot deadlock on
        // full pipes. Dropping stdin at the end of the write signals EOF.
        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());

        let output =
            output.map_err(|e| OracleError::Transport(format!("oracle process error: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OracleError::Transport(format!(
                "oracle exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        // An oracle that answers without reading its request closes the pipe early.
        if let Err(e) = written {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(OracleError::Transport(format!("cannot write request: {e}")));
            }
        }

        parse_reply(&output.stdout)
    }
}

fn parse_reply(stdout: &[u8]) -> Result<OracleResponse, OracleError> {
    let wire: WireReply = serde_json::from_slice(stdout).map_err(|e| OracleError::Malformed {
        message: format!("unparsable reply: {e}"),
        cost: Cost::default(),
    })?;

    Ok(match wire {
        WireReply::Proposal {
            input,
            summary,
            target,
            cost,
        } => OracleResponse {
            reply: OracleReply::Proposal(Proposal {
                input,
                summary,
                target,
            }),
            cost,
        },
        WireReply::Declined { reason, cost } => OracleResponse {
            reply: OracleReply::Declined {
                reason: reason.unwrap_or_else(|| "no reason given".to_string()),
            },
            cost,
        },
    })
}

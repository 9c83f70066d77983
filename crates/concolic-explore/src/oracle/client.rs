use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::config::OracleConfig;
use super::{Oracle, OracleError, OracleReply, OracleRequest, Proposal};
use crate::testcase::Cost;

/// Why an expansion got no usable proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Malformed,
    Declined,
    Transport,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Malformed => "malformed",
            FailureKind::Declined => "no_progress",
            FailureKind::Transport => "transport",
        })
    }
}

/// A usable proposal and what it took to get it.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposed {
    pub proposal: Proposal,
    pub cost: Cost,
    pub attempts: u32,
}

/// All attempts failed. The cost of every attempt is still reported.
#[derive(Debug, Clone, thiserror::Error)]
#[error("oracle gave up ({kind}) after {attempts} attempt(s): {message}")]
pub struct OracleFailure {
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
    pub cost: Cost,
}

/// Wraps an [`Oracle`] with per-attempt timeouts, retries and cost accounting.
#[derive(Clone)]
pub struct OracleClient {
    oracle: Arc<dyn Oracle>,
    config: OracleConfig,
}

impl OracleClient {
    pub fn new(oracle: Arc<dyn Oracle>, config: OracleConfig) -> Self {
        Self { oracle, config }
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn oracle_name(&self) -> &str {
        self.oracle.name()
    }

    pub async fn propose(&self, request: &OracleRequest) -> Result<Proposed, OracleFailure> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut cost = Cost::default();
        let mut last = (FailureKind::Transport, String::new());

        for attempt in 1..=max_attempts {
            cost.calls += 1;
            let exchange = self.oracle.exchange(request);
            let result = match tokio::time::timeout(self.config.attempt_timeout(), exchange).await {
                Ok(result) => result,
                Err(_) => Err(OracleError::Transport(format!(
                    "no reply within {} ms",
                    self.config.attempt_timeout_ms
                ))),
            };

            match result {
                Ok(response) => {
                    cost += Cost {
                        calls: 0,
                        ..response.cost
                    };
                    match response.reply {
                        OracleReply::Proposal(proposal) => {
                            debug!(
                                seed_id = %request.seed_id,
                                attempt,
                                oracle = self.oracle.name(),
                                "oracle proposed an input"
                            );
                            return Ok(Proposed {
                                proposal,
                                cost,
                                attempts: attempt,
                            });
                        }
                        OracleReply::Declined { reason } => {
                            last = (FailureKind::Declined, reason);
                        }
                    }
                }
                Err(err) => {
                    cost += Cost {
                        calls: 0,
                        ..err.cost()
                    };
                    let kind = match err {
                        OracleError::Transport(_) => FailureKind::Transport,
                        OracleError::Malformed { .. } => FailureKind::Malformed,
                    };
                    last = (kind, err.to_string());
                }
            }

            warn!(
                seed_id = %request.seed_id,
                attempt,
                max_attempts,
                kind = %last.0,
                message = %last.1,
                "oracle attempt failed"
            );
            if attempt < max_attempts {
                tokio::time::sleep(self.config.retry.backoff(attempt)).await;
            }
        }

        Err(OracleFailure {
            kind: last.0,
            message: last.1,
            attempts: max_attempts,
            cost,
        })
    }
}

impl fmt::Debug for OracleClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OracleClient")
            .field("oracle", &self.oracle.name())
            .field("config", &self.config)
            .finish()
    }
}

//! The oracle: an external reasoning step that proposes the next input.
//!
//! The scheduler never looks inside an oracle. It packages what is known
//! about a seed into an [`OracleRequest`] and gets back either a proposal or
//! a refusal, plus what the exchange cost.

pub mod client;
pub mod command;
pub mod config;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use concolic_trace::{CallChain, MarkerCatalog, MarkerId};
use serde::{Deserialize, Serialize};

use crate::queue::{PriorAttempt, QueueEntry};
use crate::testcase::{CaseId, Cost, TargetLines, TestInput};

pub use client::{FailureKind, OracleClient, OracleFailure, Proposed};
pub use command::CommandOracle;
pub use config::{OracleConfig, RetryPolicy};

/// Everything the oracle is told about one expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleRequest {
    pub round: u64,
    pub seed_id: CaseId,
    pub seed_input: TestInput,
    pub call_chain: CallChain,
    /// Leading markers of the seed's trace, rendered one per entry.
    pub trace_excerpt: Vec<String>,
    /// Whether `trace_excerpt` was cut short.
    pub trace_truncated: bool,
    /// Candidates already derived from this seed and how each turned out,
    /// oldest first.
    pub prior_attempts: Vec<PriorAttempt>,
    /// `(failed, selected)` expansion counts for the seed.
    pub history: (u32, u32),
    /// Cataloged markers nobody has hit yet.
    pub missing_markers: Vec<MarkerId>,
}

impl OracleRequest {
    pub fn build(
        round: u64,
        seed: &QueueEntry,
        seen: &BTreeSet<MarkerId>,
        catalog: &MarkerCatalog,
        config: &OracleConfig,
    ) -> Self {
        let trace = &seed.case.trace;
        let trace_excerpt = trace
            .iter()
            .take(config.trace_excerpt_limit)
            .map(MarkerId::to_string)
            .collect();
        Self {
            round,
            seed_id: seed.id(),
            seed_input: seed.case.input.clone(),
            call_chain: CallChain::compress(trace),
            trace_excerpt,
            trace_truncated: trace.len() > config.trace_excerpt_limit,
            prior_attempts: seed.prior_attempts().cloned().collect(),
            history: seed.history(),
            missing_markers: catalog
                .missing(seen)
                .take(config.missing_hint_limit)
                .cloned()
                .collect(),
        }
    }
}

/// A proposed next input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub input: TestInput,
    /// The path condition the oracle aimed at, in its own words.
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub target: Option<TargetLines>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OracleReply {
    Proposal(Proposal),
    /// The oracle found nothing worth trying from this seed.
    Declined { reason: String },
}

/// One successful exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleResponse {
    pub reply: OracleReply,
    pub cost: Cost,
}

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// The exchange itself failed (process, network, timeout).
    #[error("Oracle transport error: {0}")]
    Transport(String),

    /// A reply arrived but could not be understood. It may still have cost.
    #[error("Malformed oracle reply: {message}")]
    Malformed { message: String, cost: Cost },
}

impl OracleError {
    pub fn cost(&self) -> Cost {
        match self {
            OracleError::Transport(_) => Cost::default(),
            OracleError::Malformed { cost, .. } => *cost,
        }
    }
}

/// A source of input proposals. Implementations must be safe to call from
/// several workers at once.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn exchange(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError>;
}

impl fmt::Display for OracleReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleReply::Proposal(p) => write!(f, "proposal {:?}", p.input.args),
            OracleReply::Declined { reason } => write!(f, "declined: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{AttemptOutcome, TestCaseQueue};
    use crate::testcase::{CaseStatus, TestCase};

    #[test]
    fn test_request_bounds_excerpt_and_hints() {
        let mut q = TestCaseQueue::with_history_window(2);
        let id = q.add_seed(TestInput::from_args(["1.0", "1.00001"]));
        let mut case = q.get(id).unwrap().case.clone();
        case.status = CaseStatus::Executed;
        case.trace = (1..=5).map(|n| MarkerId::enter("count.c", "main", n)).collect();
        case.signature = case.trace.iter().cloned().collect();
        q.complete_seed(case.clone()).unwrap();

        let mut early = TestCase::candidate(CaseId(0), id, TestInput::from_args(["1.0", "1.5"]), 1);
        early.status = CaseStatus::Executed;
        q.commit(early).unwrap();
        let mut crashed = TestCase::candidate(CaseId(0), id, TestInput::from_args(["1.0", "9.0"]), 1);
        crashed.status = CaseStatus::Crashed;
        crashed.summary = Some("x > 8".into());
        crashed.target = Some(TargetLines {
            file: "count.c".into(),
            start: 14,
            end: 14,
            content: vec!["abort();".into()],
        });
        q.commit(crashed).unwrap();
        let mut refused = TestCase::candidate(CaseId(0), id, TestInput::default(), 2);
        refused.status = CaseStatus::OracleFailed;
        q.commit(refused).unwrap();
        let mut plain = TestCase::candidate(CaseId(0), id, TestInput::from_args(["1.0", "1.00001"]), 2);
        plain.status = CaseStatus::Executed;
        q.commit(plain).unwrap();

        let catalog = MarkerCatalog::from_markers((1..=20).map(|n| MarkerId::enter("count.c", "main", n)));
        let config = OracleConfig {
            trace_excerpt_limit: 3,
            missing_hint_limit: 4,
            ..OracleConfig::default()
        };
        let seen = case.signature.as_set().clone();

        let req = OracleRequest::build(2, q.get(id).unwrap(), &seen, &catalog, &config);
        assert_eq!(req.trace_excerpt, vec![
            "[count.c] enter main 1",
            "[count.c] enter main 2",
            "[count.c] enter main 3",
        ]);
        assert!(req.trace_truncated);
        assert_eq!(req.missing_markers.len(), 4);
        assert_eq!(req.missing_markers[0], MarkerId::enter("count.c", "main", 6));
        assert_eq!(req.call_chain.len(), 1);

        let outcomes: Vec<_> = req.prior_attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(outcomes, vec![AttemptOutcome::Crashed, AttemptOutcome::Plain]);
        assert_eq!(req.prior_attempts[0].summary.as_deref(), Some("x > 8"));
        assert_eq!(req.prior_attempts[0].target.as_ref().map(|t| t.start), Some(14));
    }
}

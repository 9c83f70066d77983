//! Termination budgets and stop reasons.
//!
//! A run stops at a round boundary when a budget is spent, or mid-round when
//! the overall deadline passes or an external cancel arrives. Whatever was
//! committed before the stop stays on disk.

use std::fmt;
use std::time::Duration;

use concolic_explore::ledger::SharedLedger;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::RunLimits;

/// Why a run was cancelled rather than finishing a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelCause {
    /// Overall wall-clock timeout passed.
    OverallTimeout,
    /// Cumulative oracle cost reached `max_cost`.
    CostBudget,
    /// Interrupted from outside (Ctrl-C, a `CancelHandle`).
    External,
}

/// Reason a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The configured number of rounds completed.
    RoundLimitReached,
    /// The ledger stopped growing for a whole plateau slot.
    Plateaued,
    Cancelled(CancelCause),
}

impl StopReason {
    /// Whether the run ended by spending a budget it was given, as opposed
    /// to being interrupted.
    pub fn is_clean(&self) -> bool {
        match self {
            StopReason::RoundLimitReached | StopReason::Plateaued => true,
            StopReason::Cancelled(CancelCause::OverallTimeout | CancelCause::CostBudget) => true,
            StopReason::Cancelled(CancelCause::External) => false,
        }
    }

    /// Process exit status for the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            StopReason::Cancelled(CancelCause::External) => 130,
            _ => 0,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::RoundLimitReached => "round limit reached",
            StopReason::Plateaued => "coverage plateaued",
            StopReason::Cancelled(CancelCause::OverallTimeout) => {
                "cancelled: overall timeout"
            }
            StopReason::Cancelled(CancelCause::CostBudget) => "cancelled: cost budget exhausted",
            StopReason::Cancelled(CancelCause::External) => "cancelled: interrupted",
        })
    }
}

/// Checks run progress against [`RunLimits`].
#[derive(Debug, Clone)]
pub struct ResourceChecker {
    limits: RunLimits,
    start_time: Instant,
}

impl ResourceChecker {
    pub fn new(limits: RunLimits) -> Self {
        Self {
            limits,
            start_time: Instant::now(),
        }
    }

    /// Round-boundary check. `rounds_done` counts this session only.
    /// Returns `None` while every budget still has room.
    pub fn check(
        &self,
        rounds_done: u64,
        ledger: &SharedLedger,
        cost_units: f64,
    ) -> Option<StopReason> {
        if let Some(rounds) = self.limits.rounds {
            if rounds_done >= rounds {
                return Some(StopReason::RoundLimitReached);
            }
        }
        if let Some(slot) = self.limits.plateau_slot() {
            if ledger.plateau_elapsed(Instant::now(), slot) {
                return Some(StopReason::Plateaued);
            }
        }
        if self.wall_time_exceeded() {
            return Some(StopReason::Cancelled(CancelCause::OverallTimeout));
        }
        if self.cost_exceeded(cost_units) {
            return Some(StopReason::Cancelled(CancelCause::CostBudget));
        }
        None
    }

    pub fn cost_exceeded(&self, cost_units: f64) -> bool {
        self.limits
            .max_cost
            .is_some_and(|max_cost| cost_units >= max_cost)
    }

    pub fn wall_time_exceeded(&self) -> bool {
        self.deadline().is_some_and(|d| Instant::now() >= d)
    }

    /// Instant at which in-flight work is aborted, if an overall timeout is set.
    pub fn deadline(&self) -> Option<Instant> {
        self.limits.overall_timeout().map(|t| self.start_time + t)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn limits(&self) -> &RunLimits {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concolic_explore::ledger::CoverageLedger;
    use concolic_trace::{MarkerId, Signature};

    fn limits(rounds: Option<u64>, plateau: Option<u64>, overall: Option<u64>) -> RunLimits {
        RunLimits {
            rounds,
            plateau_slot_secs: plateau,
            overall_timeout_secs: overall,
            max_cost: Some(1.0),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_limit_checked_first() {
        let checker = ResourceChecker::new(limits(Some(3), Some(1), Some(1)));
        let ledger = SharedLedger::default();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(
            checker.check(3, &ledger, 10.0),
            Some(StopReason::RoundLimitReached)
        );
        assert_eq!(checker.check(2, &ledger, 10.0), Some(StopReason::Plateaued));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plateau_resets_on_growth() {
        let checker = ResourceChecker::new(limits(None, Some(10), None));
        let ledger = SharedLedger::new(CoverageLedger::new());

        tokio::time::advance(Duration::from_secs(8)).await;
        let sig: Signature = [MarkerId::enter("count.c", "main", 1)].into_iter().collect();
        ledger.record(&sig, 1).unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(checker.check(2, &ledger, 0.0), None);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(checker.check(3, &ledger, 0.0), Some(StopReason::Plateaued));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout_and_cost() {
        let checker = ResourceChecker::new(limits(None, None, Some(60)));
        let ledger = SharedLedger::default();
        assert_eq!(
            checker.check(1, &ledger, 1.5),
            Some(StopReason::Cancelled(CancelCause::CostBudget))
        );
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            checker.check(1, &ledger, 0.0),
            Some(StopReason::Cancelled(CancelCause::OverallTimeout))
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(StopReason::RoundLimitReached.exit_code(), 0);
        assert_eq!(StopReason::Plateaued.exit_code(), 0);
        assert_eq!(
            StopReason::Cancelled(CancelCause::CostBudget).exit_code(),
            0
        );
        assert_eq!(StopReason::Cancelled(CancelCause::External).exit_code(), 130);
        assert!(!StopReason::Cancelled(CancelCause::External).is_clean());
        assert!(StopReason::Cancelled(CancelCause::OverallTimeout).is_clean());
    }

    #[test]
    fn test_stop_reason_serde() {
        let json = serde_json::to_string(&StopReason::Cancelled(CancelCause::CostBudget)).unwrap();
        assert_eq!(json, r#"{"cancelled":"cost_budget"}"#);
        assert_eq!(
            serde_json::to_string(&StopReason::Plateaued).unwrap(),
            r#""plateaued""#
        );
    }
}

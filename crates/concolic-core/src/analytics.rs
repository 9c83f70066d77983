//! Run analytics.
//!
//! Tracks the coverage curve, per-round statistics and run-wide counters
//! for logs, the event log and the end-of-run summary.

use concolic_explore::testcase::{CaseStatus, Cost, TestCase};
use serde::{Deserialize, Serialize};

use crate::limits::StopReason;

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
    Plateaued,
    RoundLimitReached,
    Cancelled,
    Stopped,
}

impl SchedulerState {
    /// The state a run passes through on its way to `Stopped`.
    pub fn for_stop(reason: &StopReason) -> Self {
        match reason {
            StopReason::RoundLimitReached => SchedulerState::RoundLimitReached,
            StopReason::Plateaued => SchedulerState::Plateaued,
            StopReason::Cancelled(_) => SchedulerState::Cancelled,
        }
    }
}

/// Counters accumulated over a run (or a single round).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStats {
    /// Target executions, seeds included.
    pub executions: u64,
    /// Candidates committed, any status.
    pub candidates: u64,
    /// Candidates admitted to the queue.
    pub admitted: u64,
    /// Executed candidates that added nothing.
    pub non_novel: u64,
    pub crashes: u64,
    pub hangs: u64,
    pub oracle_failures: u64,
    /// Candidates the sandbox could not launch.
    pub launch_failures: u64,
    pub cost: Cost,
}

impl RunStats {
    /// Account for one committed case.
    pub fn record_case(&mut self, case: &TestCase, admitted: bool) {
        if !case.is_seed() {
            self.candidates += 1;
        }
        match case.status {
            CaseStatus::Executed | CaseStatus::Crashed | CaseStatus::TimedOut => {
                self.executions += 1;
            }
            CaseStatus::Pending | CaseStatus::OracleFailed | CaseStatus::LaunchFailed => {}
        }
        match case.status {
            CaseStatus::Crashed => self.crashes += 1,
            CaseStatus::TimedOut => self.hangs += 1,
            CaseStatus::OracleFailed => self.oracle_failures += 1,
            CaseStatus::LaunchFailed => self.launch_failures += 1,
            CaseStatus::Executed if !case.is_seed() && !admitted => self.non_novel += 1,
            _ => {}
        }
        if admitted {
            self.admitted += 1;
        }
        self.cost += case.cost;
    }

    pub fn merge(&mut self, other: &RunStats) {
        self.executions += other.executions;
        self.candidates += other.candidates;
        self.admitted += other.admitted;
        self.non_novel += other.non_novel;
        self.crashes += other.crashes;
        self.hangs += other.hangs;
        self.oracle_failures += other.oracle_failures;
        self.launch_failures += other.launch_failures;
        self.cost += other.cost;
    }
}

/// Statistics for one finished (or aborted) round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundStats {
    pub round: u64,
    pub seeds: usize,
    pub stats: RunStats,
    /// Markers the ledger gained this round.
    pub new_markers: usize,
    pub markers_seen: usize,
    pub elapsed_ms: u64,
}

/// A coverage measurement taken at a round boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoveragePoint {
    pub round: u64,
    pub elapsed_ms: u64,
    pub markers_seen: usize,
    /// Cataloged markers hit, when a catalog was scanned.
    pub catalog_hit: usize,
    pub catalog_total: usize,
    /// `catalog_hit / catalog_total` (0.0-1.0), 0.0 without a catalog.
    pub percent: f64,
}

/// Run-level analytics aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAnalytics {
    pub coverage_curve: Vec<CoveragePoint>,
    pub rounds: Vec<RoundStats>,
    pub totals: RunStats,
    pub peak_coverage: f64,
    pub elapsed_ms: u64,
    pub state: SchedulerState,
}

impl RunAnalytics {
    pub fn new() -> Self {
        Self {
            coverage_curve: Vec::new(),
            rounds: Vec::new(),
            totals: RunStats::default(),
            peak_coverage: 0.0,
            elapsed_ms: 0,
            state: SchedulerState::Idle,
        }
    }

    pub fn record_coverage(
        &mut self,
        round: u64,
        elapsed_ms: u64,
        markers_seen: usize,
        catalog_hit: usize,
        catalog_total: usize,
    ) {
        let percent = if catalog_total > 0 {
            catalog_hit as f64 / catalog_total as f64
        } else {
            0.0
        };
        self.coverage_curve.push(CoveragePoint {
            round,
            elapsed_ms,
            markers_seen,
            catalog_hit,
            catalog_total,
            percent,
        });
        if percent > self.peak_coverage {
            self.peak_coverage = percent;
        }
    }

    pub fn record_round(&mut self, round: RoundStats) {
        self.totals.merge(&round.stats);
        self.elapsed_ms = round.elapsed_ms;
        self.rounds.push(round);
    }

    /// Fraction of rounds that grew the ledger.
    pub fn productive_round_ratio(&self) -> f64 {
        if self.rounds.is_empty() {
            return 0.0;
        }
        let productive = self.rounds.iter().filter(|r| r.new_markers > 0).count();
        productive as f64 / self.rounds.len() as f64
    }

    /// Markers gained per round across the curve.
    pub fn coverage_velocity(&self) -> f64 {
        match (self.coverage_curve.first(), self.coverage_curve.last()) {
            (Some(first), Some(last)) if last.round > first.round => {
                (last.markers_seen - first.markers_seen.min(last.markers_seen)) as f64
                    / (last.round - first.round) as f64
            }
            _ => 0.0,
        }
    }
}

impl Default for RunAnalytics {
    fn default() -> Self {
        Self::new()
    }
}

//! Scheduler events, appended to `events.jsonl` one per line.

use concolic_explore::selection::SelectionPolicy;
use concolic_explore::testcase::{CaseId, CaseStatus, Cost};
use serde::{Deserialize, Serialize};

use crate::analytics::RunStats;
use crate::limits::StopReason;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        seeds: usize,
        parallel_num: usize,
        selection: SelectionPolicy,
        rng_seed: u64,
        catalog_markers: usize,
    },
    Resumed {
        cases: usize,
        next_id: CaseId,
        starting_round: u64,
        markers_seen: usize,
    },
    RoundStarted {
        round: u64,
        seeds: Vec<CaseId>,
    },
    CaseCommitted {
        round: u64,
        case_id: CaseId,
        parent_id: Option<CaseId>,
        status: CaseStatus,
        novel: bool,
        new_markers: usize,
        admitted: bool,
    },
    RoundFinished {
        round: u64,
        stats: RunStats,
        new_markers: usize,
        markers_seen: usize,
        /// The round's workers were aborted before all of them finished.
        aborted: bool,
    },
    Stopped {
        reason: StopReason,
        message: String,
        rounds_completed: u64,
        markers_seen: usize,
        cost: Cost,
    },
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Milliseconds since the session started.
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub event: RunEvent,
}

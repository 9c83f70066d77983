//! The test-case queue: an append-only arena of queue-resident cases.
//!
//! Residents are the seeds plus every executed candidate that was novel,
//! and every resident may be chosen as a seed. Seeds stay whatever their
//! own run did; only candidates are filtered by status.
//! Ids are assigned and appended under the same lock, so the arena stays
//! sorted by id and lookup is a binary search. Every other committed case
//! (crashed, timed out, non-novel, oracle or launch failure) still consumes
//! an id but never enters the arena.

use std::collections::{HashSet, VecDeque};

use concolic_trace::Signature;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::selection::Selector;
use crate::testcase::{CaseId, CaseStatus, TargetLines, TestCase, TestInput};

/// Prior attempts kept per seed for the oracle's context.
pub const DEFAULT_HISTORY_WINDOW: usize = 8;

/// How a candidate derived from a seed turned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Crashed,
    TimedOut,
    /// Executed and added coverage.
    Novel,
    /// Executed without adding coverage.
    Plain,
}

/// One earlier expansion of a seed, as the oracle is shown it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorAttempt {
    pub input: TestInput,
    #[serde(default)]
    pub target: Option<TargetLines>,
    #[serde(default)]
    pub summary: Option<String>,
    pub outcome: AttemptOutcome,
}

impl PriorAttempt {
    /// Candidates that never ran have nothing to report.
    fn of(case: &TestCase) -> Option<Self> {
        let outcome = match case.status {
            CaseStatus::Crashed => AttemptOutcome::Crashed,
            CaseStatus::TimedOut => AttemptOutcome::TimedOut,
            CaseStatus::Executed if case.novel => AttemptOutcome::Novel,
            CaseStatus::Executed => AttemptOutcome::Plain,
            CaseStatus::Pending | CaseStatus::OracleFailed | CaseStatus::LaunchFailed => {
                return None
            }
        };
        Some(Self {
            input: case.input.clone(),
            target: case.target.clone(),
            summary: case.summary.clone(),
            outcome,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Unknown case {0}")]
    UnknownCase(CaseId),

    #[error("Case {case} names parent {parent}, which is not in the queue")]
    UnknownParent { case: CaseId, parent: CaseId },

    #[error("Case ids must increase: got {got} after {last}")]
    NonMonotonicId { got: CaseId, last: CaseId },
}

/// A resident case plus its selection bookkeeping.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub case: TestCase,
    /// Times chosen as the seed of an expansion.
    pub selected: u32,
    /// Expansions from this seed that produced a novel candidate.
    pub succeeded: u32,
    prior_attempts: VecDeque<PriorAttempt>,
}

impl QueueEntry {
    fn new(case: TestCase) -> Self {
        Self {
            case,
            selected: 0,
            succeeded: 0,
            prior_attempts: VecDeque::new(),
        }
    }

    pub fn id(&self) -> CaseId {
        self.case.id
    }

    /// `(failed, selected)` expansion counts.
    pub fn history(&self) -> (u32, u32) {
        (self.selected.saturating_sub(self.succeeded), self.selected)
    }

    /// Most recent candidates derived from this seed, oldest first.
    pub fn prior_attempts(&self) -> impl Iterator<Item = &PriorAttempt> {
        self.prior_attempts.iter()
    }

    fn remember(&mut self, case: &TestCase, window: usize) {
        if window == 0 {
            return;
        }
        let Some(attempt) = PriorAttempt::of(case) else {
            return;
        };
        if self.prior_attempts.len() == window {
            self.prior_attempts.pop_front();
        }
        self.prior_attempts.push_back(attempt);
    }
}

/// What happened when a finished candidate was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    pub id: CaseId,
    /// Whether the case became a queue resident.
    pub admitted: bool,
}

#[derive(Debug)]
pub struct TestCaseQueue {
    entries: Vec<QueueEntry>,
    next_id: CaseId,
    resident_signatures: HashSet<Signature>,
    history_window: usize,
}

impl TestCaseQueue {
    pub fn new() -> Self {
        Self::with_history_window(DEFAULT_HISTORY_WINDOW)
    }

    pub fn with_history_window(history_window: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_id: CaseId(0),
            resident_signatures: HashSet::new(),
            history_window,
        }
    }

    /// Add an initial seed. It is pending until executed.
    pub fn add_seed(&mut self, input: TestInput) -> CaseId {
        let id = self.allocate();
        self.entries.push(QueueEntry::new(TestCase::seed(id, input)));
        debug!(case_id = %id, "seed queued");
        id
    }

    /// Fill in a pending seed's execution results. The seed stays
    /// selectable even when it crashed or timed out.
    pub fn complete_seed(&mut self, executed: TestCase) -> Result<(), QueueError> {
        let id = executed.id;
        let entry = self.get_mut(id).ok_or(QueueError::UnknownCase(id))?;
        entry.case = executed;

        if entry.case.status == CaseStatus::Executed {
            let signature = entry.case.signature.clone();
            self.resident_signatures.insert(signature);
        } else {
            info!(case_id = %id, status = entry.case.status.as_str(), "seed did not run cleanly; kept as a seed");
        }
        Ok(())
    }

    /// Assign an id to a finished candidate and append it if it qualifies.
    ///
    /// Only executed, novel candidates with an unseen signature are admitted.
    pub fn commit(&mut self, mut case: TestCase) -> Result<Commit, QueueError> {
        if let Some(parent) = case.parent_id {
            if self.get(parent).is_none() {
                return Err(QueueError::UnknownParent {
                    case: self.next_id,
                    parent,
                });
            }
        }

        let id = self.allocate();
        case.id = id;

        let admitted = case.status == CaseStatus::Executed
            && case.novel
            && !self.resident_signatures.contains(&case.signature);

        if let Some(parent) = case.parent_id {
            let window = self.history_window;
            if let Some(seed) = self.get_mut(parent) {
                if admitted {
                    seed.succeeded += 1;
                }
                seed.remember(&case, window);
            }
        }

        if admitted {
            self.resident_signatures.insert(case.signature.clone());
            self.entries.push(QueueEntry::new(case));
        }
        Ok(Commit { id, admitted })
    }

    /// Choose up to `n` seeds for a round, counting each choice as a selection.
    pub fn select_seeds(&mut self, selector: &mut Selector, n: usize) -> Vec<CaseId> {
        let mut chosen = Vec::with_capacity(n);
        for _ in 0..n {
            let Some(id) = selector.choose(&self.entries) else {
                break;
            };
            if let Some(entry) = self.get_mut(id) {
                entry.selected += 1;
            }
            chosen.push(id);
        }
        chosen
    }

    pub fn get(&self, id: CaseId) -> Option<&QueueEntry> {
        self.entries
            .binary_search_by_key(&id, QueueEntry::id)
            .ok()
            .map(|idx| &self.entries[idx])
    }

    fn get_mut(&mut self, id: CaseId) -> Option<&mut QueueEntry> {
        self.entries
            .binary_search_by_key(&id, QueueEntry::id)
            .ok()
            .map(|idx| &mut self.entries[idx])
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The id the next committed case will receive.
    pub fn next_id(&self) -> CaseId {
        self.next_id
    }

    /// Rebuild a queue from persisted cases (any order).
    ///
    /// Residents are seeds plus executed novel candidates; ids continue
    /// after the largest persisted id.
    pub fn restore(
        mut cases: Vec<TestCase>,
        history_window: usize,
    ) -> Result<Self, QueueError> {
        cases.sort_by_key(|c| c.id);
        let mut queue = Self::with_history_window(history_window);

        for case in cases {
            if case.id < queue.next_id {
                return Err(QueueError::NonMonotonicId {
                    got: case.id,
                    last: CaseId(queue.next_id.0.saturating_sub(1)),
                });
            }
            queue.next_id = case.id.next();

            if let Some(parent) = case.parent_id {
                let window = queue.history_window;
                let resident = case.status == CaseStatus::Executed && case.novel;
                let seed = queue.get_mut(parent).ok_or(QueueError::UnknownParent {
                    case: case.id,
                    parent,
                })?;
                seed.selected += 1;
                if resident {
                    seed.succeeded += 1;
                }
                seed.remember(&case, window);
                if resident {
                    queue.resident_signatures.insert(case.signature.clone());
                    queue.entries.push(QueueEntry::new(case));
                }
            } else {
                if case.status == CaseStatus::Executed {
                    queue.resident_signatures.insert(case.signature.clone());
                }
                queue.entries.push(QueueEntry::new(case));
            }
        }
        Ok(queue)
    }

    fn allocate(&mut self) -> CaseId {
        let id = self.next_id;
        self.next_id = id.next();
        id
    }
}

impl Default for TestCaseQueue {
    fn default() -> Self {
        Self::new()
    }
}

//! Seed selection policies.

use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::queue::QueueEntry;
use crate::testcase::CaseId;

/// How the next seed is picked from the queue residents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Uniform over never-selected cases; uniform over all residents once
    /// every case has been selected at least once.
    #[default]
    Random,
    /// Always the most recently admitted case (depth-first).
    Latest,
    /// The case selected the fewest times; newer cases win ties.
    LeastTried,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::Random => "random",
            SelectionPolicy::Latest => "latest",
            SelectionPolicy::LeastTried => "least-tried",
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(SelectionPolicy::Random),
            "latest" => Ok(SelectionPolicy::Latest),
            "least-tried" | "least_tried" => Ok(SelectionPolicy::LeastTried),
            other => Err(format!(
                "unknown selection policy `{other}` (expected random, latest or least-tried)"
            )),
        }
    }
}

/// A policy plus its RNG, seeded from the run seed so a given seed always
/// replays the same choices.
#[derive(Debug, Clone)]
pub struct Selector {
    policy: SelectionPolicy,
    rng: ChaCha8Rng,
}

impl Selector {
    pub fn new(policy: SelectionPolicy, run_seed: u64) -> Self {
        Self {
            policy,
            rng: ChaCha8Rng::seed_from_u64(run_seed),
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Pick one entry, or `None` when there are none.
    pub fn choose(&mut self, entries: &[QueueEntry]) -> Option<CaseId> {
        match self.policy {
            SelectionPolicy::Random => {
                let fresh: Vec<&QueueEntry> = entries.iter().filter(|e| e.selected == 0).collect();
                if fresh.is_empty() {
                    entries.choose(&mut self.rng).map(QueueEntry::id)
                } else {
                    fresh.choose(&mut self.rng).map(|e| e.id())
                }
            }
            SelectionPolicy::Latest => entries.last().map(QueueEntry::id),
            SelectionPolicy::LeastTried => entries
                .iter()
                .min_by_key(|e| (e.selected, std::cmp::Reverse(e.id())))
                .map(|e| e.id()),
        }
    }
}

//! Coverage ledger: the union of every marker any completed execution hit.
//!
//! `record` is the only way markers enter the ledger, and it decides novelty
//! and applies the union in one step. The set never shrinks.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use concolic_trace::{MarkerCatalog, MarkerId, Signature};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::testcase::CaseId;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger corruption: {detail}")]
    Corruption { detail: String },
}

/// Outcome of recording one signature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Novelty {
    pub novel: bool,
    /// Markers this signature added to the ledger.
    pub new_markers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageLedger {
    seen: BTreeSet<MarkerId>,
    last_growth_round: u64,
    /// Wall-clock instant of the last growth. Not persisted: a resumed
    /// ledger starts its plateau window at load time.
    #[serde(skip, default = "Instant::now")]
    last_growth_at: Instant,
}

impl CoverageLedger {
    pub fn new() -> Self {
        Self {
            seen: BTreeSet::new(),
            last_growth_round: 0,
            last_growth_at: Instant::now(),
        }
    }

    /// Union `signature` into the ledger, reporting whether it added anything.
    pub fn record(&mut self, signature: &Signature, round: u64) -> Result<Novelty, LedgerError> {
        if round < self.last_growth_round {
            return Err(LedgerError::Corruption {
                detail: format!(
                    "record for round {round} after growth in round {}",
                    self.last_growth_round
                ),
            });
        }

        let mut added = 0;
        for marker in signature.iter() {
            if self.seen.insert(marker.clone()) {
                added += 1;
            }
        }
        if added > 0 {
            self.last_growth_round = round;
            self.last_growth_at = Instant::now();
        }

        Ok(Novelty {
            novel: added > 0,
            new_markers: added,
        })
    }

    /// True once more than `slot` has passed since the ledger last grew.
    pub fn plateau_elapsed(&self, now: Instant, slot: Duration) -> bool {
        now.saturating_duration_since(self.last_growth_at) > slot
    }

    /// Check that a previously executed case is accounted for. Used on resume.
    pub fn verify_covers(&self, case: CaseId, signature: &Signature) -> Result<(), LedgerError> {
        let missing = signature.difference_from(&self.seen);
        if let Some(first) = missing.iter().next() {
            return Err(LedgerError::Corruption {
                detail: format!(
                    "case {case} hit {} marker(s) absent from the ledger, e.g. `{first}`",
                    missing.len()
                ),
            });
        }
        Ok(())
    }

    pub fn seen(&self) -> &BTreeSet<MarkerId> {
        &self.seen
    }

    pub fn contains(&self, marker: &MarkerId) -> bool {
        self.seen.contains(marker)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn last_growth_round(&self) -> u64 {
        self.last_growth_round
    }

    pub fn last_growth_at(&self) -> Instant {
        self.last_growth_at
    }

    /// Fraction of cataloged markers that have been hit; 0.0 for an empty catalog.
    pub fn coverage_ratio(&self, catalog: &MarkerCatalog) -> f64 {
        if catalog.is_empty() {
            return 0.0;
        }
        catalog.covered_by(&self.seen) as f64 / catalog.len() as f64
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Default for CoverageLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// The ledger behind a mutex, shared by all workers of a run.
#[derive(Debug, Clone, Default)]
pub struct SharedLedger {
    inner: Arc<Mutex<CoverageLedger>>,
}

impl SharedLedger {
    pub fn new(ledger: CoverageLedger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ledger)),
        }
    }

    pub fn record(&self, signature: &Signature, round: u64) -> Result<Novelty, LedgerError> {
        self.inner.lock().record(signature, round)
    }

    pub fn plateau_elapsed(&self, now: Instant, slot: Duration) -> bool {
        self.inner.lock().plateau_elapsed(now, slot)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn coverage_ratio(&self, catalog: &MarkerCatalog) -> f64 {
        self.inner.lock().coverage_ratio(catalog)
    }

    /// Copy of the current ledger state.
    pub fn snapshot(&self) -> CoverageLedger {
        self.inner.lock().clone()
    }

    /// Run `f` with the ledger locked.
    pub fn with<R>(&self, f: impl FnOnce(&CoverageLedger) -> R) -> R {
        f(&*self.inner.lock())
    }
}

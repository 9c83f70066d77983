use std::fmt;
use std::ops::AddAssign;

use concolic_trace::{MarkerId, Signature};
use serde::{Deserialize, Serialize};

pub use concolic_sandbox::TestInput;

/// Monotonically assigned test-case identifier. Seeds get the lowest ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(pub u64);

impl CaseId {
    pub fn next(self) -> Self {
        CaseId(self.0 + 1)
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    /// Created but not yet executed.
    Pending,
    /// Ran to completion (any exit code that is not a crash).
    Executed,
    /// Died from a signal or a sanitizer report.
    Crashed,
    /// Killed by the sandbox timeout.
    TimedOut,
    /// The oracle could not produce a usable input; never executed.
    OracleFailed,
    /// The sandbox could not start the target for a proposed input.
    LaunchFailed,
}

impl CaseStatus {
    /// Whether the case has reached a final status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CaseStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Pending => "pending",
            CaseStatus::Executed => "executed",
            CaseStatus::Crashed => "crashed",
            CaseStatus::TimedOut => "timed_out",
            CaseStatus::OracleFailed => "oracle_failed",
            CaseStatus::LaunchFailed => "launch_failed",
        }
    }
}

/// Oracle usage attributed to one case. Additive; never decreases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cost {
    /// Billing units (e.g. dollars) as reported by the oracle.
    pub units: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Oracle exchanges attempted, including failed ones.
    pub calls: u32,
}

impl Cost {
    pub fn is_zero(&self) -> bool {
        self.calls == 0 && self.units == 0.0 && self.input_tokens == 0 && self.output_tokens == 0
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Self) {
        // Negative or NaN reports are clamped so the total never decreases.
        if rhs.units.is_finite() && rhs.units > 0.0 {
            self.units += rhs.units;
        }
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.calls += rhs.calls;
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.6} ({} calls, {} in / {} out tokens)",
            self.units, self.calls, self.input_tokens, self.output_tokens
        )
    }
}

/// Source lines the oracle aimed the candidate at, used to verify reach on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetLines {
    pub file: String,
    /// Inclusive line range.
    pub start: u32,
    pub end: u32,
    /// Text of each line in `start..=end`, in order.
    #[serde(default)]
    pub content: Vec<String>,
}

impl TargetLines {
    /// `(line number, trimmed text)` for every non-blank target line.
    pub fn lines(&self) -> impl Iterator<Item = (u32, &str)> {
        (self.start..=self.end)
            .zip(self.content.iter())
            .map(|(line, text)| (line, text.trim()))
            .filter(|(_, text)| !text.is_empty())
    }
}

/// One concrete input plus everything observed about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: CaseId,
    /// The seed this case was derived from; `None` for initial seeds.
    pub parent_id: Option<CaseId>,
    pub input: TestInput,
    pub status: CaseStatus,
    /// Marker occurrences in execution order.
    #[serde(default)]
    pub trace: Vec<MarkerId>,
    #[serde(default)]
    pub signature: Signature,
    #[serde(default)]
    pub cost: Cost,
    /// Round in which the case was created (seeds: 0).
    pub created_at: u64,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub novel: bool,
    #[serde(default)]
    pub new_markers: usize,
    /// The oracle's summary of the path condition it targeted.
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub target: Option<TargetLines>,
    /// Milliseconds since run start when the case was committed.
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub crash_reason: Option<String>,
    /// Why the oracle gave no usable input (`oracle_failed` cases only).
    #[serde(default)]
    pub failure: Option<String>,
}

impl TestCase {
    pub fn seed(id: CaseId, input: TestInput) -> Self {
        Self {
            id,
            parent_id: None,
            input,
            status: CaseStatus::Pending,
            trace: Vec::new(),
            signature: Signature::new(),
            cost: Cost::default(),
            created_at: 0,
            exit_code: None,
            novel: false,
            new_markers: 0,
            summary: None,
            target: None,
            elapsed_ms: 0,
            crash_reason: None,
            failure: None,
        }
    }

    pub fn candidate(id: CaseId, parent: CaseId, input: TestInput, round: u64) -> Self {
        Self {
            parent_id: Some(parent),
            created_at: round,
            ..Self::seed(id, input)
        }
    }

    pub fn is_seed(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_crash_or_hang(&self) -> bool {
        matches!(self.status, CaseStatus::Crashed | CaseStatus::TimedOut)
    }
}

pub mod ledger;
pub mod oracle;
pub mod queue;
pub mod selection;
pub mod testcase;

pub use ledger::{CoverageLedger, LedgerError, Novelty, SharedLedger};
pub use oracle::{
    CommandOracle, FailureKind, Oracle, OracleClient, OracleConfig, OracleError, OracleFailure,
    OracleReply, OracleRequest, OracleResponse, Proposal, Proposed, RetryPolicy,
};
pub use queue::{AttemptOutcome, Commit, PriorAttempt, QueueEntry, QueueError, TestCaseQueue};
pub use selection::{SelectionPolicy, Selector};
pub use testcase::{CaseId, CaseStatus, Cost, TargetLines, TestCase, TestInput};

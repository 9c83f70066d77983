//! The round scheduler.
//!
//! Each round picks up to `parallel_num` seeds, first executes any of them
//! that are still pending, then runs one expansion per pick concurrently:
//! ask the oracle for a candidate, execute it, record its signature in the
//! ledger, and commit it to the queue. Rounds are separated by a barrier;
//! budgets are checked at the barrier, while the overall deadline and
//! external cancellation abort in-flight work directly.
//!
//! Lock order is queue before ledger. Neither lock is held across an await.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use concolic_explore::ledger::{CoverageLedger, LedgerError, SharedLedger};
use concolic_explore::oracle::{Oracle, OracleClient, OracleRequest};
use concolic_explore::queue::{Commit, QueueError, TestCaseQueue};
use concolic_explore::selection::Selector;
use concolic_explore::testcase::{CaseId, CaseStatus, Cost, TestCase, TestInput};
use concolic_sandbox::{ExecutionOutcome, Harness, HarnessError, Sandbox, SandboxError};
use concolic_trace::{parse_bytes, CatalogError, MarkerCatalog};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::analytics::{RoundStats, RunAnalytics, RunStats, SchedulerState};
use crate::config::{ConfigError, ProjectConfig, RunConfig};
use crate::events::RunEvent;
use crate::limits::{CancelCause, ResourceChecker, StopReason};
use crate::store::{RunStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Run store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Target error: {0}")]
    Harness(#[from] HarnessError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Marker catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Worker failed: {0}")]
    Worker(String),
}

/// The program under test and what is known about it.
#[derive(Clone)]
pub struct Target {
    pub harness: Arc<dyn Harness>,
    /// Markers the instrumented sources can emit; empty when not scanned.
    pub catalog: MarkerCatalog,
    /// Count any non-zero exit as a crash.
    pub crash_on_nonzero_exit: bool,
}

impl Target {
    pub fn new(harness: Arc<dyn Harness>) -> Self {
        Self {
            harness,
            catalog: MarkerCatalog::default(),
            crash_on_nonzero_exit: false,
        }
    }

    pub fn with_catalog(mut self, catalog: MarkerCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_crash_on_nonzero_exit(mut self, yes: bool) -> Self {
        self.crash_on_nonzero_exit = yes;
        self
    }

    /// Build the target described by a project file, scanning its source
    /// directory for the marker catalog.
    pub fn from_project(project: &ProjectConfig, project_dir: &Path) -> Result<Self, RunError> {
        let catalog = match &project.source_dir {
            Some(dir) => {
                let catalog = MarkerCatalog::scan(dir)?;
                info!(
                    markers = catalog.len(),
                    files = catalog.files_scanned(),
                    dir = %dir.display(),
                    "marker catalog scanned"
                );
                catalog
            }
            None => MarkerCatalog::default(),
        };
        Ok(Self::new(project.build_harness(project_dir))
            .with_catalog(catalog)
            .with_crash_on_nonzero_exit(project.crash_on_nonzero_exit))
    }

    pub(crate) fn crash_reason(&self, outcome: &ExecutionOutcome) -> Option<String> {
        if let Some(reason) = outcome.crash_reason() {
            return Some(reason);
        }
        match outcome.exit_code {
            Some(code) if self.crash_on_nonzero_exit && code != 0 => {
                Some(format!("exit code {code}"))
            }
            _ => None,
        }
    }
}

/// Requests an early stop from outside the scheduler.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Final report of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub reason: StopReason,
    pub state: SchedulerState,
    /// Rounds completed in this session.
    pub rounds_completed: u64,
    /// Number of the last round started, counting earlier sessions.
    pub last_round: u64,
    /// Cases committed over the whole run, any status.
    pub cases: u64,
    /// Queue residents, every one of them selectable as a seed.
    pub queue_len: usize,
    pub markers_seen: usize,
    pub catalog_total: usize,
    pub catalog_hit: usize,
    /// Oracle cost over the whole run, earlier sessions included.
    pub cost: Cost,
    pub analytics: RunAnalytics,
}

/// State shared by the coordinator and every worker.
struct Shared {
    queue: Mutex<TestCaseQueue>,
    ledger: SharedLedger,
    sandbox: Sandbox,
    target: Target,
    oracle: OracleClient,
    store: RunStore,
    round_stats: Mutex<RunStats>,
    started: Instant,
}

impl Shared {
    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Turn an execution outcome into trace, status and novelty.
    fn apply_outcome(
        &self,
        case: &mut TestCase,
        outcome: &ExecutionOutcome,
        round: u64,
    ) -> Result<(), RunError> {
        let parsed = parse_bytes(&outcome.trace_text, outcome.trace_is_partial());
        case.trace = parsed.markers;
        case.signature = parsed.signature;
        case.exit_code = Some(outcome.harness_code());
        case.status = if outcome.timed_out {
            CaseStatus::TimedOut
        } else if let Some(reason) = self.target.crash_reason(outcome) {
            case.crash_reason = Some(reason);
            CaseStatus::Crashed
        } else {
            CaseStatus::Executed
        };

        let novelty = self.ledger.record(&case.signature, round)?;
        case.novel = novelty.novel;
        case.new_markers = novelty.new_markers;
        debug!(
            round,
            status = case.status.as_str(),
            markers = case.signature.len(),
            new_markers = novelty.new_markers,
            duration_ms = u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
            "execution recorded"
        );
        Ok(())
    }

    /// Execute a pending seed and complete it in the queue.
    async fn run_seed(&self, id: CaseId, round: u64) -> Result<(), RunError> {
        let mut case = {
            let queue = self.queue.lock();
            match queue.get(id) {
                Some(entry) if entry.case.status == CaseStatus::Pending => entry.case.clone(),
                Some(_) => return Ok(()),
                None => return Err(QueueError::UnknownCase(id).into()),
            }
        };
        let outcome = match self
            .sandbox
            .execute(self.target.harness.as_ref(), &case.input)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                // Still pending, so the seed is executed again next time it is picked.
                warn!(round, case_id = %id, error = %err, "seed could not be executed");
                return Ok(());
            }
        };
        self.apply_outcome(&mut case, &outcome, round)?;
        case.elapsed_ms = self.elapsed_ms();

        {
            let mut queue = self.queue.lock();
            queue.complete_seed(case.clone())?;
            self.store.save_ledger(&self.ledger.snapshot())?;
            self.store.save_case(&case)?;
        }
        self.round_stats.lock().record_case(&case, false);
        info!(
            round,
            case_id = %id,
            status = case.status.as_str(),
            markers = case.signature.len(),
            "seed executed"
        );
        self.store.append_event(
            self.elapsed_ms(),
            RunEvent::CaseCommitted {
                round,
                case_id: id,
                parent_id: None,
                status: case.status,
                novel: case.novel,
                new_markers: case.new_markers,
                admitted: true,
            },
        )?;
        Ok(())
    }

    /// One expansion: oracle, execution, ledger, queue.
    async fn expand(&self, seed_id: CaseId, round: u64) -> Result<(), RunError> {
        let (request, seed_input) = {
            let queue = self.queue.lock();
            let entry = queue.get(seed_id).ok_or(QueueError::UnknownCase(seed_id))?;
            if entry.case.status == CaseStatus::Pending {
                debug!(round, seed_id = %seed_id, "seed not executed yet; skipping expansion");
                return Ok(());
            }
            let request = self.ledger.with(|ledger| {
                OracleRequest::build(
                    round,
                    entry,
                    ledger.seen(),
                    &self.target.catalog,
                    self.oracle.config(),
                )
            });
            (request, entry.case.input.clone())
        };

        let mut case = match self.oracle.propose(&request).await {
            Ok(proposed) => {
                let mut case =
                    TestCase::candidate(CaseId(0), seed_id, proposed.proposal.input, round);
                case.cost = proposed.cost;
                case.summary = proposed.proposal.summary;
                case.target = proposed.proposal.target;
                match self
                    .sandbox
                    .execute(self.target.harness.as_ref(), &case.input)
                    .await
                {
                    Ok(outcome) => self.apply_outcome(&mut case, &outcome, round)?,
                    Err(SandboxError::Harness(err)) => {
                        warn!(round, seed_id = %seed_id, error = %err, "proposed input cannot be delivered");
                        case.status = CaseStatus::OracleFailed;
                        case.failure = Some(err.to_string());
                    }
                    Err(err) => {
                        warn!(round, seed_id = %seed_id, error = %err, "candidate could not be executed");
                        case.status = CaseStatus::LaunchFailed;
                        case.failure = Some(err.to_string());
                    }
                }
                case
            }
            Err(failure) => {
                warn!(round, seed_id = %seed_id, kind = %failure.kind, "expansion abandoned");
                let mut case = TestCase::candidate(CaseId(0), seed_id, seed_input, round);
                case.status = CaseStatus::OracleFailed;
                case.cost = failure.cost;
                case.failure = Some(failure.to_string());
                case
            }
        };

        let commit = self.commit(&mut case)?;
        self.round_stats.lock().record_case(&case, commit.admitted);
        if commit.admitted {
            info!(
                round,
                case_id = %commit.id,
                seed_id = %seed_id,
                new_markers = case.new_markers,
                "novel candidate admitted"
            );
        } else {
            debug!(
                round,
                case_id = %commit.id,
                seed_id = %seed_id,
                status = case.status.as_str(),
                "candidate recorded"
            );
        }
        self.store.append_event(
            self.elapsed_ms(),
            RunEvent::CaseCommitted {
                round,
                case_id: commit.id,
                parent_id: Some(seed_id),
                status: case.status,
                novel: case.novel,
                new_markers: case.new_markers,
                admitted: commit.admitted,
            },
        )?;
        Ok(())
    }

    /// Assign an id, append to the queue if admitted, and persist. The
    /// ledger is written before the case so the ledger on disk always
    /// covers every persisted case.
    fn commit(&self, case: &mut TestCase) -> Result<Commit, RunError> {
        let mut queue = self.queue.lock();
        case.id = queue.next_id();
        case.elapsed_ms = self.elapsed_ms();
        let commit = queue.commit(case.clone())?;
        self.store.save_ledger(&self.ledger.snapshot())?;
        self.store.save_case(case)?;
        Ok(commit)
    }
}

enum RoundEnd {
    Completed,
    Interrupted(CancelCause),
}

/// Where a scheduler's state came from.
enum Origin {
    Fresh { seeds: usize },
    Resumed { cases: usize, prior_cost: Cost },
}

pub struct RoundScheduler {
    config: RunConfig,
    shared: Arc<Shared>,
    selector: Selector,
    cancel: CancelHandle,
    /// Last round number already used before this session.
    starting_round: u64,
    origin: Origin,
    analytics: RunAnalytics,
}

impl RoundScheduler {
    /// Start a new run in an empty run directory.
    pub fn new(
        config: RunConfig,
        target: Target,
        oracle: Arc<dyn Oracle>,
        store: RunStore,
        seeds: Vec<TestInput>,
    ) -> Result<Self, RunError> {
        config.validate()?;
        target.harness.check()?;
        if seeds.is_empty() {
            return Err(ConfigError::Invalid("at least one seed input is required".into()).into());
        }

        let mut queue = TestCaseQueue::with_history_window(config.history_window);
        let count = seeds.len();
        for input in seeds {
            let id = queue.add_seed(input);
            if let Some(entry) = queue.get(id) {
                store.save_case(&entry.case)?;
            }
        }
        let ledger = CoverageLedger::new();
        store.save_ledger(&ledger)?;
        store.save_config(&config)?;

        Ok(Self::assemble(
            config,
            target,
            oracle,
            store,
            queue,
            ledger,
            0,
            Origin::Fresh { seeds: count },
        ))
    }

    /// Continue a run from its directory. Ids keep increasing and every
    /// persisted execution must already be covered by the stored ledger.
    pub fn resume(
        config: RunConfig,
        target: Target,
        oracle: Arc<dyn Oracle>,
        store: RunStore,
    ) -> Result<Self, RunError> {
        config.validate()?;
        target.harness.check()?;
        let cases = store.load_cases()?;
        let ledger = store.load_ledger()?.unwrap_or_default();

        let mut prior_cost = Cost::default();
        let mut last_round = ledger.last_growth_round();
        for case in &cases {
            prior_cost += case.cost;
            last_round = last_round.max(case.created_at);
            if matches!(
                case.status,
                CaseStatus::Executed | CaseStatus::Crashed | CaseStatus::TimedOut
            ) {
                ledger.verify_covers(case.id, &case.signature)?;
            }
        }

        let count = cases.len();
        let queue = TestCaseQueue::restore(cases, config.history_window)?;
        if queue.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{} holds no seeds to resume from",
                store.dir().display()
            ))
            .into());
        }
        store.save_config(&config)?;
        info!(
            cases = count,
            residents = queue.len(),
            markers = ledger.len(),
            last_round,
            "run state restored"
        );

        Ok(Self::assemble(
            config,
            target,
            oracle,
            store,
            queue,
            ledger,
            last_round,
            Origin::Resumed {
                cases: count,
                prior_cost,
            },
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: RunConfig,
        target: Target,
        oracle: Arc<dyn Oracle>,
        store: RunStore,
        queue: TestCaseQueue,
        ledger: CoverageLedger,
        starting_round: u64,
        origin: Origin,
    ) -> Self {
        let shared = Shared {
            queue: Mutex::new(queue),
            ledger: SharedLedger::new(ledger),
            sandbox: Sandbox::new(&config.sandbox),
            target,
            oracle: OracleClient::new(oracle, config.oracle.clone()),
            store,
            round_stats: Mutex::new(RunStats::default()),
            started: Instant::now(),
        };
        Self {
            selector: Selector::new(config.selection, config.rng_seed),
            config,
            shared: Arc::new(shared),
            cancel: CancelHandle::new(),
            starting_round,
            origin,
            analytics: RunAnalytics::new(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> SchedulerState {
        self.analytics.state
    }

    /// Run rounds until a stop condition holds.
    pub async fn run(mut self) -> Result<RunSummary, RunError> {
        let checker = ResourceChecker::new(self.config.limits.clone());
        let shared = Arc::clone(&self.shared);
        self.analytics.state = SchedulerState::Running;

        let prior_cost = match &self.origin {
            Origin::Fresh { seeds } => {
                shared.store.append_event(
                    shared.elapsed_ms(),
                    RunEvent::RunStarted {
                        seeds: *seeds,
                        parallel_num: self.config.parallel_num,
                        selection: self.config.selection,
                        rng_seed: self.config.rng_seed,
                        catalog_markers: shared.target.catalog.len(),
                    },
                )?;
                Cost::default()
            }
            Origin::Resumed { cases, prior_cost } => {
                shared.store.append_event(
                    shared.elapsed_ms(),
                    RunEvent::Resumed {
                        cases: *cases,
                        next_id: shared.queue.lock().next_id(),
                        starting_round: self.starting_round + 1,
                        markers_seen: shared.ledger.len(),
                    },
                )?;
                *prior_cost
            }
        };
        info!(
            parallel_num = self.config.parallel_num,
            selection = %self.config.selection,
            oracle = shared.oracle.oracle_name(),
            harness = shared.target.harness.name(),
            "scheduler running"
        );

        let mut round = self.starting_round;
        let mut rounds_done = 0u64;
        let mut cost = prior_cost;

        let reason = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled(CancelCause::External);
            }
            if let Some(reason) = checker.check(rounds_done, &shared.ledger, cost.units) {
                break reason;
            }

            let seeds = shared
                .queue
                .lock()
                .select_seeds(&mut self.selector, self.config.parallel_num);

            round += 1;
            let markers_before = shared.ledger.len();
            info!(round, seeds = seeds.len(), "round started");
            shared.store.append_event(
                shared.elapsed_ms(),
                RunEvent::RoundStarted {
                    round,
                    seeds: seeds.clone(),
                },
            )?;

            let end = self.run_round(round, &seeds, &checker).await?;

            let stats = std::mem::take(&mut *shared.round_stats.lock());
            cost += stats.cost;
            let markers_seen = shared.ledger.len();
            let new_markers = markers_seen.saturating_sub(markers_before);
            let elapsed_ms = shared.elapsed_ms();
            let catalog = &shared.target.catalog;
            let catalog_hit = shared.ledger.with(|l| catalog.covered_by(l.seen()));

            shared.store.save_ledger(&shared.ledger.snapshot())?;
            shared.store.append_event(
                elapsed_ms,
                RunEvent::RoundFinished {
                    round,
                    stats,
                    new_markers,
                    markers_seen,
                    aborted: matches!(end, RoundEnd::Interrupted(_)),
                },
            )?;
            self.analytics
                .record_coverage(round, elapsed_ms, markers_seen, catalog_hit, catalog.len());
            self.analytics.record_round(RoundStats {
                round,
                seeds: seeds.len(),
                stats,
                new_markers,
                markers_seen,
                elapsed_ms,
            });
            info!(
                round,
                new_markers,
                markers_seen,
                admitted = stats.admitted,
                crashes = stats.crashes,
                hangs = stats.hangs,
                oracle_failures = stats.oracle_failures,
                launch_failures = stats.launch_failures,
                cost = stats.cost.units,
                "round finished"
            );

            match end {
                RoundEnd::Completed => rounds_done += 1,
                RoundEnd::Interrupted(cause) => break StopReason::Cancelled(cause),
            }
        };

        self.analytics.state = SchedulerState::for_stop(&reason);
        info!(state = ?self.analytics.state, %reason, "scheduler stopping");
        self.analytics.state = SchedulerState::Stopped;

        let markers_seen = shared.ledger.len();
        shared.store.save_ledger(&shared.ledger.snapshot())?;
        shared.store.append_event(
            shared.elapsed_ms(),
            RunEvent::Stopped {
                reason,
                message: reason.to_string(),
                rounds_completed: rounds_done,
                markers_seen,
                cost,
            },
        )?;

        let (cases, queue_len) = {
            let queue = shared.queue.lock();
            (queue.next_id().0, queue.len())
        };
        let catalog = &shared.target.catalog;
        let summary = RunSummary {
            reason,
            state: SchedulerState::Stopped,
            rounds_completed: rounds_done,
            last_round: round,
            cases,
            queue_len,
            markers_seen,
            catalog_total: catalog.len(),
            catalog_hit: shared.ledger.with(|l| catalog.covered_by(l.seen())),
            cost,
            analytics: self.analytics,
        };
        info!(
            %reason,
            rounds = summary.rounds_completed,
            cases = summary.cases,
            markers = summary.markers_seen,
            cost = %summary.cost,
            "run stopped"
        );
        Ok(summary)
    }

    /// Execute pending picks, then expand every pick concurrently.
    async fn run_round(
        &self,
        round: u64,
        seeds: &[CaseId],
        checker: &ResourceChecker,
    ) -> Result<RoundEnd, RunError> {
        let pending: BTreeSet<CaseId> = {
            let queue = self.shared.queue.lock();
            seeds
                .iter()
                .copied()
                .filter(|id| {
                    queue
                        .get(*id)
                        .is_some_and(|e| e.case.status == CaseStatus::Pending)
                })
                .collect()
        };

        if !pending.is_empty() {
            let mut tasks = JoinSet::new();
            for id in pending {
                let shared = Arc::clone(&self.shared);
                tasks.spawn(async move { shared.run_seed(id, round).await });
            }
            if let Some(cause) = self.join_round(&mut tasks, checker).await? {
                return Ok(RoundEnd::Interrupted(cause));
            }
        }

        let mut tasks = JoinSet::new();
        for &seed_id in seeds {
            let shared = Arc::clone(&self.shared);
            tasks.spawn(async move { shared.expand(seed_id, round).await });
        }
        Ok(match self.join_round(&mut tasks, checker).await? {
            Some(cause) => RoundEnd::Interrupted(cause),
            None => RoundEnd::Completed,
        })
    }

    /// Wait for every task, or abort them all at the deadline or on cancel.
    async fn join_round(
        &self,
        tasks: &mut JoinSet<Result<(), RunError>>,
        checker: &ResourceChecker,
    ) -> Result<Option<CancelCause>, RunError> {
        let mut cancel = self.cancel.subscribe();
        let deadline = checker.deadline();
        let expiry = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                biased;
                _ = cancel.wait_for(|cancelled| *cancelled) => {
                    warn!(in_flight = tasks.len(), "cancel requested; aborting workers");
                    tasks.shutdown().await;
                    return Ok(Some(CancelCause::External));
                }
                _ = &mut expiry => {
                    warn!(in_flight = tasks.len(), "overall timeout; aborting workers");
                    tasks.shutdown().await;
                    return Ok(Some(CancelCause::OverallTimeout));
                }
                joined = tasks.join_next() => match joined {
                    None => return Ok(None),
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => {
                        error!(error = %err, "worker failed; aborting round");
                        tasks.shutdown().await;
                        return Err(err);
                    }
                    Some(Err(join_err)) => {
                        tasks.shutdown().await;
                        return Err(RunError::Worker(join_err.to_string()));
                    }
                },
            }
        }
    }
}

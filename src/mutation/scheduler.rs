//! The orchestration loop: calibrate, capture coverage, batch mutants across hosts and resolve
//! every mutant to a terminal status.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{CoverageMode, OrchestratorConfig};
use super::journal::{Journal, JournalError};
use super::mutant::{Mutant, MutantId, MutantStatus};
use super::report::StatusReport;
use super::result::{ModelError, TestRunResult};
use super::runner::{
    BatchRunResult, PlannedMutant, RunnerError, TestRunner, TestUpdate, TestUpdateHandler,
};
use super::testset::{TestId, TestSet, TestsGuidList};
use super::timeout::TimeoutValueCalculator;

/// Session-level errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Tests fail on unmutated code; mutation results would be meaningless.
    #[error("tests do not pass without mutation ({} failing): {message}", failing.len())]
    BaselineFailed {
        /// Names of the failing tests.
        failing: Vec<String>,
        /// Runner diagnostic.
        message: String,
    },
    /// Discovery or the baseline run exceeded the initialization ceiling.
    #[error("initialization did not finish within {after:?}")]
    InitializationTimeout {
        /// Ceiling that was hit.
        after: Duration,
    },
    /// A session operation ran before [`MutationOrchestrator::initialize`].
    #[error("orchestrator is not initialized")]
    NotInitialized,
    /// A run result reported failures for tests it never executed.
    #[error("inconsistent test run result{}: {source}", mutant.map(|m| format!(" for mutant {m}")).unwrap_or_default())]
    InconsistentResult {
        /// Mutant the result belongs to (`None` for unmutated runs).
        mutant: Option<MutantId>,
        /// Violated invariant.
        #[source]
        source: ModelError,
    },
    /// A batch task panicked or was aborted.
    #[error("batch task failed: {0}")]
    TaskFailed(String),
    /// Runner failure outside of batch execution.
    #[error(transparent)]
    Runner(#[from] RunnerError),
    /// Journal failure.
    #[error(transparent)]
    Journal(#[from] JournalError),
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation shared between a session and whoever stops it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Fresh, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// True once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Tests to run against `mutant`.
///
/// Known coverage restricts the run to the covering tests that exist in `tests`; unknown
/// coverage falls back to every test.
pub fn select_tests(mutant: &Mutant, tests: &TestSet) -> TestsGuidList {
    match mutant.covering_tests() {
        None | Some(TestsGuidList::Everything) => TestsGuidList::every_test(),
        Some(TestsGuidList::Explicit(ids)) => {
            TestsGuidList::from_ids(ids.into_iter().filter(|id| tests.contains(id)))
        }
    }
}

/// Resolve a mutant from its final run result. Returns the status it ends up with.
pub fn resolve_from_result(
    planned: &PlannedMutant,
    result: &TestRunResult,
    tests: &TestSet,
) -> MutantStatus {
    let mutant = &planned.mutant;
    let killer = result
        .failing_tests
        .resolve(tests)
        .into_iter()
        .find(|id| planned.tests.contains(id, tests));

    if let Some(killer) = killer {
        mutant.resolve_with(
            MutantStatus::Killed,
            format!("killed by {}", tests.name_of(&killer)),
            Some(killer),
        );
    } else if result.session_timed_out || !result.timed_out_tests.is_empty() {
        mutant.resolve_with(
            MutantStatus::Timeout,
            format!("run exceeded its timeout of {:?}", planned.timeout),
            None,
        );
    } else if result.executed_tests.is_included(&planned.tests, tests) {
        mutant.resolve_with(
            MutantStatus::Survived,
            format!("{} covering test(s) passed", planned.tests.count(tests)),
            None,
        );
    } else {
        mutant.resolve_with(
            MutantStatus::RuntimeError,
            "covering tests were not all executed",
            None,
        );
    }
    mutant.status()
}

/// Demultiplexes streamed test results onto the mutants of one batch.
#[derive(Debug)]
pub struct BatchTracker {
    tests: Arc<TestSet>,
    entries: HashMap<MutantId, PlannedMutant>,
}

impl BatchTracker {
    /// Tracker for `batch`.
    pub fn new(tests: Arc<TestSet>, batch: &[PlannedMutant]) -> Self {
        Self {
            tests,
            entries: batch
                .iter()
                .map(|p| (p.mutant.id(), p.clone()))
                .collect(),
        }
    }

    fn first_failure(&self, planned: &PlannedMutant, failing: &TestsGuidList) -> Option<TestId> {
        failing
            .resolve(&self.tests)
            .into_iter()
            .find(|id| planned.tests.contains(id, &self.tests))
    }
}

impl TestUpdateHandler for BatchTracker {
    fn on_update(&self, update: TestUpdate<'_>) -> bool {
        let mut wanted = false;
        for id in update.mutants {
            let Some(planned) = self.entries.get(id) else {
                continue;
            };
            let mutant = &planned.mutant;
            if !mutant.is_resolved() {
                if let Some(killer) = self.first_failure(planned, update.failing) {
                    if mutant.resolve_with(
                        MutantStatus::Killed,
                        format!("killed by {}", self.tests.name_of(&killer)),
                        Some(killer),
                    ) {
                        debug!(mutant = %id, test = %killer, "mutant killed");
                    }
                } else if update.timed_out.intersects(&planned.tests, &self.tests) {
                    mutant.resolve_with(
                        MutantStatus::Timeout,
                        format!("run exceeded its timeout of {:?}", planned.timeout),
                        None,
                    );
                }
            }
            wanted |= !mutant.is_resolved();
        }
        wanted
    }
}

struct Calibration {
    tests: Arc<TestSet>,
    timeouts: TimeoutValueCalculator,
    baseline: TestRunResult,
}

struct BatchDone {
    slot: usize,
    batch: Vec<PlannedMutant>,
    outcome: Result<BatchRunResult, RunnerError>,
}

/// Owns the discovered tests and timeout calibration for one project, and runs sessions.
pub struct MutationOrchestrator<R> {
    runner: Arc<R>,
    config: OrchestratorConfig,
    cancel: CancelToken,
    calibration: Option<Calibration>,
}

impl<R> std::fmt::Debug for MutationOrchestrator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationOrchestrator")
            .field("config", &self.config)
            .field("initialized", &self.calibration.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl<R: TestRunner + 'static> MutationOrchestrator<R> {
    /// Orchestrator driving `runner`.
    pub fn new(runner: R, config: OrchestratorConfig) -> Self {
        Self::from_shared(Arc::new(runner), config)
    }

    /// Orchestrator driving a shared runner.
    pub fn from_shared(runner: Arc<R>, config: OrchestratorConfig) -> Self {
        Self {
            runner,
            config,
            cancel: CancelToken::new(),
            calibration: None,
        }
    }

    /// Use `cancel` instead of the orchestrator's own token.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels this orchestrator's sessions.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Discovered tests, once initialized.
    pub fn tests(&self) -> Option<&TestSet> {
        self.calibration.as_ref().map(|c| c.tests.as_ref())
    }

    /// Timeout calibration, once initialized.
    pub fn timeouts(&self) -> Option<&TimeoutValueCalculator> {
        self.calibration.as_ref().map(|c| &c.timeouts)
    }

    /// Unmutated baseline result, once initialized.
    pub fn baseline(&self) -> Option<&TestRunResult> {
        self.calibration.as_ref().map(|c| &c.baseline)
    }

    /// Forget discovered tests and calibration; the next session initializes again.
    pub fn reset(&mut self) {
        self.calibration = None;
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, RunnerError>>,
    ) -> Result<T, OrchestratorError> {
        let Some(ceiling) = self.config.initial_run_ceiling() else {
            return Ok(operation.await?);
        };
        match tokio::time::timeout(ceiling, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(RunnerError::Timeout(_))) | Err(_) => {
                Err(OrchestratorError::InitializationTimeout { after: ceiling })
            }
            Ok(Err(err)) => Err(err.into()),
        }
    }

    /// Discover tests, run the unmutated baseline and calibrate timeouts. Runs once; later
    /// calls return the cached tests.
    #[tracing::instrument(skip_all)]
    pub async fn initialize(&mut self) -> Result<&TestSet, OrchestratorError> {
        if self.calibration.is_none() {
            let calibration = self.calibrate().await?;
            self.calibration = Some(calibration);
        }
        self.tests().ok_or(OrchestratorError::NotInitialized)
    }

    async fn calibrate(&self) -> Result<Calibration, OrchestratorError> {
        let tests = Arc::new(self.bounded(self.runner.discover_tests()).await?);
        info!(tests = tests.len(), "running baseline");

        let started = Instant::now();
        let baseline = self.bounded(self.runner.run_baseline(&tests)).await?;
        let elapsed = started.elapsed();

        if !baseline.success {
            let failing = baseline
                .failing_tests
                .resolve(&tests)
                .iter()
                .map(|id| tests.name_of(id))
                .collect();
            return Err(OrchestratorError::BaselineFailed {
                failing,
                message: baseline.message.clone(),
            });
        }
        baseline
            .check_consistency(&tests)
            .map_err(|source| OrchestratorError::InconsistentResult {
                mutant: None,
                source,
            })?;

        let timeouts = TimeoutValueCalculator::calibrate(
            elapsed,
            self.config.additional_timeout(),
            self.config.timeout_factor,
            tests.len(),
        )
        .with_test_durations(baseline.test_durations.clone());
        info!(
            baseline = ?elapsed,
            default_timeout = ?timeouts.default_timeout(),
            "baseline passed"
        );

        Ok(Calibration {
            tests,
            timeouts,
            baseline,
        })
    }

    /// Record covering tests on every mutant. Falls back to "every test" when capture is off or
    /// fails. Returns whether coverage data was applied.
    #[tracing::instrument(skip_all, fields(mutants = mutants.len()))]
    pub async fn capture_coverage(&self, mutants: &[Arc<Mutant>]) -> Result<bool, OrchestratorError> {
        let calibration = self
            .calibration
            .as_ref()
            .ok_or(OrchestratorError::NotInitialized)?;
        let fallback = || {
            for mutant in mutants {
                mutant.set_covering_tests(None);
            }
        };

        if self.config.coverage == CoverageMode::Off || mutants.is_empty() {
            fallback();
            return Ok(false);
        }

        match self
            .bounded(self.runner.capture_coverage(&calibration.tests, mutants))
            .await
        {
            Ok(capture) if capture.result.success => {
                capture.coverage.annotate(mutants);
                info!(
                    covered = capture.coverage.covered_mutants(),
                    "coverage captured"
                );
                Ok(true)
            }
            Ok(capture) => {
                warn!(message = %capture.result.message, "coverage run failed; running every test");
                fallback();
                Ok(false)
            }
            Err(err) => {
                warn!(%err, "coverage capture failed; running every test");
                fallback();
                Ok(false)
            }
        }
    }

    fn next_batch(
        &self,
        queue: &mut VecDeque<Arc<Mutant>>,
        calibration: &Calibration,
    ) -> Vec<PlannedMutant> {
        let tests = &calibration.tests;
        let budget = calibration.timeouts.test_count().max(1);
        let mut batch = Vec::new();
        let mut planned_tests = 0;

        while let Some(next) = queue.front() {
            let selected = select_tests(next, tests);
            let count = selected.count(tests);
            if !batch.is_empty()
                && (selected.is_every_test()
                    || planned_tests + count > budget
                    || batch.len() >= self.config.max_mutants_per_batch)
            {
                break;
            }
            let Some(mutant) = queue.pop_front() else {
                break;
            };
            let timeout = mutant
                .timeout_override()
                .unwrap_or_else(|| calibration.timeouts.timeout_for_tests(&selected));
            let alone = selected.is_every_test();
            planned_tests += count;
            batch.push(PlannedMutant {
                mutant,
                tests: selected,
                timeout,
            });
            if alone || planned_tests >= budget {
                break;
            }
        }
        batch
    }

    fn settle_batch(
        &self,
        done: BatchDone,
        tests: &TestSet,
        attempts: &mut HashMap<MutantId, u32>,
        journal: Option<&Journal>,
    ) -> Result<Vec<Arc<Mutant>>, OrchestratorError> {
        let BatchDone { slot, batch, outcome } = done;
        let (results, host_error) = match outcome {
            Ok(BatchRunResult {
                results,
                host_error,
            }) => (results, host_error),
            Err(err) => {
                warn!(slot, %err, mutants = batch.len(), "batch failed");
                (Default::default(), Some(err.to_string()))
            }
        };

        for planned in &batch {
            let Some(result) = results.get(&planned.mutant.id()) else {
                continue;
            };
            result
                .check_consistency(tests)
                .map_err(|source| OrchestratorError::InconsistentResult {
                    mutant: Some(planned.mutant.id()),
                    source,
                })?;
            resolve_from_result(planned, result, tests);
        }

        let progressed = !results.is_empty();
        let mut requeue = Vec::new();
        for planned in &batch {
            let mutant = &planned.mutant;
            if !mutant.is_resolved() && (host_error.is_some() || !progressed) {
                let failures = attempts.entry(mutant.id()).or_insert(0);
                *failures += 1;
                if *failures > self.config.max_batch_retries {
                    let detail = host_error.as_deref().unwrap_or("test host returned no result");
                    mutant.resolve_with(
                        MutantStatus::RuntimeError,
                        format!("test host failed {failures} time(s): {detail}"),
                        None,
                    );
                }
            }

            if mutant.is_resolved() {
                debug!(mutant = %mutant.id(), status = %mutant.status(), "mutant resolved");
                if let Some(journal) = journal {
                    journal.mutant_resolved(mutant)?;
                }
            } else if mutant.revert_to_not_run() {
                requeue.push(mutant.clone());
            }
        }
        Ok(requeue)
    }

    /// Run every unresolved mutant of `mutants` and resolve it. Returns `true` when the
    /// session was cancelled.
    #[tracing::instrument(skip_all, fields(mutants = mutants.len()))]
    pub async fn test_mutants(&self, mutants: &[Arc<Mutant>]) -> Result<bool, OrchestratorError> {
        self.execute(mutants, None).await
    }

    async fn execute(
        &self,
        mutants: &[Arc<Mutant>],
        journal: Option<&Journal>,
    ) -> Result<bool, OrchestratorError> {
        let calibration = self
            .calibration
            .as_ref()
            .ok_or(OrchestratorError::NotInitialized)?;
        let tests = calibration.tests.clone();

        let mut queue = VecDeque::new();
        for mutant in mutants {
            if mutant.status() != MutantStatus::NotRun {
                continue;
            }
            if select_tests(mutant, &tests).count(&tests) == 0 {
                mutant.resolve_with(MutantStatus::NoCoverage, "no test covers this mutant", None);
                if let Some(journal) = journal {
                    journal.mutant_resolved(mutant)?;
                }
            } else {
                queue.push_back(mutant.clone());
            }
        }
        info!(queued = queue.len(), concurrency = self.config.concurrency, "testing mutants");

        let mut attempts = HashMap::new();
        let mut free_slots: Vec<usize> = (0..self.config.concurrency.max(1)).rev().collect();
        let mut running = JoinSet::new();
        let mut interrupted = false;

        loop {
            if self.cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            while !queue.is_empty() {
                let Some(slot) = free_slots.pop() else {
                    break;
                };
                let batch = self.next_batch(&mut queue, calibration);
                for planned in &batch {
                    planned.mutant.mark_pending();
                }
                debug!(slot, mutants = batch.len(), "starting batch");
                let runner = self.runner.clone();
                let tests = tests.clone();
                running.spawn(async move {
                    let tracker = BatchTracker::new(tests.clone(), &batch);
                    let outcome = runner.run_batch(slot, &tests, &batch, &tracker).await;
                    BatchDone {
                        slot,
                        batch,
                        outcome,
                    }
                });
            }
            if running.is_empty() {
                break;
            }

            let joined = tokio::select! {
                _ = self.cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                joined = running.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let settled = match joined {
                Ok(done) => {
                    free_slots.push(done.slot);
                    self.settle_batch(done, &tests, &mut attempts, journal)
                }
                Err(err) => Err(OrchestratorError::TaskFailed(err.to_string())),
            };
            match settled {
                Ok(requeue) => queue.extend(requeue),
                Err(err) => {
                    running.shutdown().await;
                    fail_in_flight(mutants, "session aborted");
                    return Err(err);
                }
            }
        }

        if interrupted {
            warn!(in_flight = running.len(), "session cancelled");
            running.shutdown().await;
            fail_in_flight(mutants, "session cancelled");
        }
        Ok(interrupted)
    }

    /// Full session: restore or reset journaled statuses, initialize, capture coverage, test
    /// every unresolved mutant and report.
    #[tracing::instrument(skip_all, fields(mutants = mutants.len()))]
    pub async fn run_session(
        &mut self,
        mutants: &[Arc<Mutant>],
    ) -> Result<StatusReport, OrchestratorError> {
        let journal = self.config.journal_path.as_ref().map(Journal::open);
        if self.config.retest_all {
            for mutant in mutants {
                mutant.reset_for_retest();
            }
        } else if let Some(journal) = &journal {
            let snapshot = journal.replay()?;
            if snapshot.malformed_lines > 0 {
                warn!(lines = snapshot.malformed_lines, "skipped malformed journal lines");
            }
            let restored = snapshot.restore_into(mutants);
            if restored > 0 {
                info!(restored, "restored statuses from earlier sessions");
            }
        }

        let test_count = self.initialize().await?.len();
        if let Some(journal) = &journal {
            journal.session_started(mutants.len(), test_count)?;
        }

        let unresolved: Vec<Arc<Mutant>> = mutants
            .iter()
            .filter(|m| !m.is_resolved())
            .cloned()
            .collect();
        let interrupted = tokio::select! {
            _ = self.cancel.cancelled() => true,
            captured = self.capture_coverage(&unresolved) => {
                captured?;
                self.execute(&unresolved, journal.as_ref()).await?
            }
        };

        if let Some(journal) = &journal {
            if interrupted {
                journal.session_interrupted("session cancelled")?;
            } else {
                journal.session_completed()?;
            }
        }

        let session_id = journal
            .as_ref()
            .map(|j| j.session_id().to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let tests = self.tests().ok_or(OrchestratorError::NotInitialized)?;
        let report = StatusReport::collect(session_id, mutants, tests, interrupted);
        info!(
            killed = report.summary.killed,
            survived = report.summary.survived,
            timeout = report.summary.timeout,
            no_coverage = report.summary.no_coverage,
            runtime_error = report.summary.runtime_error,
            score = report.summary.mutation_score,
            interrupted,
            "session finished"
        );
        Ok(report)
    }
}

fn fail_in_flight(mutants: &[Arc<Mutant>], reason: &str) {
    for mutant in mutants {
        if mutant.status() == MutantStatus::Pending {
            mutant.resolve_with(MutantStatus::RuntimeError, reason, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::testset::TestDescription;

    fn universe(n: u128) -> Arc<TestSet> {
        Arc::new(
            (1..=n)
                .map(|i| TestDescription::new(TestId::from_u128(i), format!("t{i}"), "suite.rs"))
                .collect(),
        )
    }

    fn planned(id: u32, tests: TestsGuidList) -> PlannedMutant {
        let mutant = Mutant::new(MutantId(id), format!("m{id}")).shared();
        mutant.mark_pending();
        PlannedMutant {
            mutant,
            tests,
            timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn selection_respects_coverage_and_falls_back() {
        let tests = universe(3);
        let m = Mutant::new(MutantId(1), "m");
        assert_eq!(select_tests(&m, &tests), TestsGuidList::every_test());

        m.set_covering_tests(Some(TestsGuidList::from_ids([
            TestId::from_u128(2),
            TestId::from_u128(99),
        ])));
        assert_eq!(
            select_tests(&m, &tests),
            TestsGuidList::from_ids([TestId::from_u128(2)])
        );

        m.set_covering_tests(Some(TestsGuidList::every_test()));
        assert!(select_tests(&m, &tests).is_every_test());
    }

    #[test]
    fn tracker_kills_on_first_covering_failure_only() {
        let tests = universe(3);
        let (t1, t2, t3) = (
            TestId::from_u128(1),
            TestId::from_u128(2),
            TestId::from_u128(3),
        );
        let m = planned(1, TestsGuidList::from_ids([t1, t2]));
        let tracker = BatchTracker::new(tests, std::slice::from_ref(&m));
        let none = TestsGuidList::no_test();

        // A failure outside the covering set is not attributed.
        let wanted = tracker.on_update(TestUpdate {
            mutants: &[MutantId(1)],
            failing: &TestsGuidList::from_ids([t3]),
            executed: &TestsGuidList::from_ids([t3]),
            timed_out: &none,
        });
        assert!(wanted);
        assert_eq!(m.mutant.status(), MutantStatus::Pending);

        let wanted = tracker.on_update(TestUpdate {
            mutants: &[MutantId(1)],
            failing: &TestsGuidList::from_ids([t1]),
            executed: &TestsGuidList::from_ids([t1]),
            timed_out: &none,
        });
        assert!(!wanted);
        assert_eq!(m.mutant.status(), MutantStatus::Killed);
        assert_eq!(m.mutant.killing_test(), Some(t1));

        // Late results do not change the terminal status.
        tracker.on_update(TestUpdate {
            mutants: &[MutantId(1)],
            failing: &TestsGuidList::from_ids([t1]),
            executed: &TestsGuidList::from_ids([t1, t2]),
            timed_out: &TestsGuidList::from_ids([t2]),
        });
        assert_eq!(m.mutant.status(), MutantStatus::Killed);
    }

    #[test]
    fn final_result_maps_to_statuses() {
        let tests = universe(2);
        let t1 = TestId::from_u128(1);
        let t2 = TestId::from_u128(2);

        let survived = planned(1, TestsGuidList::from_ids([t1]));
        let passed = TestRunResult::passed(TestsGuidList::from_ids([t1]), Duration::ZERO, 2);
        assert_eq!(
            resolve_from_result(&survived, &passed, &tests),
            MutantStatus::Survived
        );

        let timed = planned(2, TestsGuidList::every_test());
        let timed_out = TestRunResult::timed_out(
            TestsGuidList::from_ids([t1]),
            TestsGuidList::no_test(),
            TestsGuidList::from_ids([t2]),
            Duration::from_millis(100),
            2,
        );
        assert_eq!(
            resolve_from_result(&timed, &timed_out, &tests),
            MutantStatus::Timeout
        );

        let partial = planned(3, TestsGuidList::every_test());
        let short = TestRunResult::passed(TestsGuidList::from_ids([t1]), Duration::ZERO, 2);
        assert_eq!(
            resolve_from_result(&partial, &short, &tests),
            MutantStatus::RuntimeError
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
        assert!(token.is_cancelled());
        token.cancelled().await;
    }
}

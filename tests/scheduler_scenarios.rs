use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kitchensink_mutants::mutation::{
    BatchRunResult, CoverageCapture, CoverageMode, Mutant, MutantId, MutantStatus,
    MutationOrchestrator, OrchestratorConfig, OrchestratorError, PlannedMutant, RunnerError,
    TestCoverageInfos, TestDescription, TestId, TestRunResult, TestRunner, TestSet, TestUpdate,
    TestUpdateHandler, TestsGuidList,
};
use tempfile::tempdir;

fn test_id(i: u128) -> TestId {
    TestId::from_u128(i)
}

fn universe(n: u128) -> TestSet {
    (1..=n)
        .map(|i| TestDescription::new(test_id(i), format!("test_{i}"), "suite.rs"))
        .collect()
}

#[derive(Default)]
struct Script {
    baseline_failing: Vec<TestId>,
    /// Report only these tests as executed by the baseline.
    baseline_executed: Option<Vec<TestId>>,
    baseline_delay: Duration,
    coverage: Option<TestCoverageInfos>,
    coverage_fails: bool,
    killers: BTreeMap<MutantId, BTreeSet<TestId>>,
    hangs: BTreeSet<MutantId>,
    crash_first_batches: usize,
    block_batches: bool,
    ignore_stop: bool,
}

/// In-process runner that executes a script instead of spawning hosts.
struct ScriptedRunner {
    tests: TestSet,
    script: Script,
    discover_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    executed: Mutex<Vec<(MutantId, TestId)>>,
}

impl ScriptedRunner {
    fn new(tests: TestSet, script: Script) -> Self {
        Self {
            tests,
            script,
            discover_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    fn executed(&self) -> Vec<(MutantId, TestId)> {
        self.executed.lock().expect("executed log").clone()
    }
}

impl TestRunner for ScriptedRunner {
    async fn discover_tests(&self) -> Result<TestSet, RunnerError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tests.clone())
    }

    async fn run_baseline(&self, tests: &TestSet) -> Result<TestRunResult, RunnerError> {
        tokio::time::sleep(self.script.baseline_delay).await;
        let executed = match &self.script.baseline_executed {
            Some(ids) => TestsGuidList::from_ids(ids.iter().copied()),
            None => TestsGuidList::from_ids(tests.ids().copied()),
        };
        let durations = tests.ids().map(|id| (*id, Duration::from_millis(1))).collect();
        let result = if self.script.baseline_failing.is_empty() {
            TestRunResult::passed(executed, self.script.baseline_delay, tests.len())
        } else {
            TestRunResult::failed(
                executed,
                TestsGuidList::from_ids(self.script.baseline_failing.iter().copied()),
                "assertion failed",
                self.script.baseline_delay,
                tests.len(),
            )
        };
        Ok(result.with_test_durations(durations))
    }

    async fn capture_coverage(
        &self,
        tests: &TestSet,
        _mutants: &[Arc<Mutant>],
    ) -> Result<CoverageCapture, RunnerError> {
        if self.script.coverage_fails {
            return Err(RunnerError::HostCrashed("coverage host died".to_string()));
        }
        Ok(CoverageCapture {
            result: TestRunResult::passed(
                TestsGuidList::every_test(),
                Duration::from_millis(1),
                tests.len(),
            ),
            coverage: self.script.coverage.clone().unwrap_or_default(),
        })
    }

    async fn run_batch(
        &self,
        _slot: usize,
        tests: &TestSet,
        batch: &[PlannedMutant],
        handler: &dyn TestUpdateHandler,
    ) -> Result<BatchRunResult, RunnerError> {
        let call = self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.block_batches {
            std::future::pending::<()>().await;
        }
        if call < self.script.crash_first_batches {
            return Err(RunnerError::HostCrashed("host exited with signal 9".to_string()));
        }

        let mut out = BatchRunResult::default();
        for planned in batch {
            let id = planned.mutant.id();
            let mut executed = TestsGuidList::no_test();
            let mut failing = TestsGuidList::no_test();
            let none = TestsGuidList::no_test();

            if self.script.hangs.contains(&id) {
                let still_running = TestsGuidList::from_ids(planned.tests.resolve(tests));
                handler.on_update(TestUpdate {
                    mutants: &[id],
                    failing: &failing,
                    executed: &executed,
                    timed_out: &still_running,
                });
                out.results.insert(
                    id,
                    TestRunResult::timed_out(
                        executed,
                        failing,
                        still_running,
                        planned.timeout,
                        tests.len(),
                    ),
                );
                return Ok(out);
            }

            for test in planned.tests.resolve(tests) {
                self.executed
                    .lock()
                    .expect("executed log")
                    .push((id, test));
                executed.insert(test);
                if self
                    .script
                    .killers
                    .get(&id)
                    .is_some_and(|killers| killers.contains(&test))
                {
                    failing.insert(test);
                }
                let wanted = handler.on_update(TestUpdate {
                    mutants: &[id],
                    failing: &failing,
                    executed: &executed,
                    timed_out: &none,
                });
                if !wanted && !self.script.ignore_stop {
                    break;
                }
            }

            let result = if failing.is_empty() {
                TestRunResult::passed(executed, Duration::from_millis(1), tests.len())
            } else {
                TestRunResult::failed(
                    executed,
                    failing,
                    "assertion failed",
                    Duration::from_millis(1),
                    tests.len(),
                )
            };
            out.results.insert(id, result);
        }
        Ok(out)
    }
}

fn mutants(ids: impl IntoIterator<Item = u32>) -> Vec<Arc<Mutant>> {
    ids.into_iter()
        .map(|i| Mutant::new(MutantId(i), format!("mutant {i}")).shared())
        .collect()
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_concurrency(2)
        .with_additional_timeout_ms(0)
}

#[tokio::test(flavor = "current_thread")]
async fn failing_baseline_aborts_before_any_mutant_runs() {
    let runner = Arc::new(ScriptedRunner::new(
        universe(3),
        Script {
            baseline_failing: vec![test_id(2)],
            ..Script::default()
        },
    ));
    let mut orchestrator = MutationOrchestrator::from_shared(runner.clone(), config());
    let all = mutants(1..=3);

    let err = orchestrator
        .run_session(&all)
        .await
        .expect_err("baseline failure should abort the session");

    match err {
        OrchestratorError::BaselineFailed { failing, .. } => {
            assert_eq!(failing, vec!["test_2".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runner.batch_calls.load(Ordering::SeqCst), 0);
    assert!(all.iter().all(|m| m.status() == MutantStatus::NotRun));
}

#[tokio::test(flavor = "current_thread")]
async fn failing_baseline_is_reported_even_when_failures_were_not_listed_as_executed() {
    let runner = ScriptedRunner::new(
        universe(3),
        Script {
            baseline_failing: vec![test_id(3)],
            baseline_executed: Some(vec![test_id(1)]),
            ..Script::default()
        },
    );
    let mut orchestrator = MutationOrchestrator::new(runner, config());

    let err = orchestrator
        .initialize()
        .await
        .expect_err("failing baseline should abort");
    match err {
        OrchestratorError::BaselineFailed { failing, .. } => {
            assert_eq!(failing, vec!["test_3".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn short_baseline_yields_loose_but_bounded_timeout() {
    let runner = ScriptedRunner::new(
        universe(2),
        Script {
            baseline_delay: Duration::from_millis(2),
            ..Script::default()
        },
    );
    let mut orchestrator = MutationOrchestrator::new(runner, config());
    orchestrator.initialize().await.expect("baseline should pass");

    let timeouts = orchestrator.timeouts().expect("calibrated");
    let timeout = timeouts.default_timeout();
    assert!(timeouts.baseline() >= Duration::from_millis(2));
    assert!(timeout >= timeouts.baseline());
    assert!(timeout > Duration::from_millis(1));
    assert!(timeout < Duration::from_millis(200));
    assert_eq!(timeouts.test_count(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn first_covering_failure_kills_and_late_results_do_not_overwrite() {
    let mut coverage = TestCoverageInfos::new();
    coverage.record_test(test_id(1), [MutantId(1)]);
    coverage.record_test(test_id(2), [MutantId(1)]);
    let runner = Arc::new(ScriptedRunner::new(
        universe(3),
        Script {
            coverage: Some(coverage),
            killers: BTreeMap::from([(MutantId(1), BTreeSet::from([test_id(1)]))]),
            ignore_stop: true,
            ..Script::default()
        },
    ));
    let mut orchestrator = MutationOrchestrator::from_shared(runner.clone(), config());
    let all = mutants([1]);

    let report = orchestrator.run_session(&all).await.expect("session");

    assert_eq!(all[0].status(), MutantStatus::Killed);
    assert_eq!(all[0].killing_test(), Some(test_id(1)));
    assert_eq!(report.mutants[0].killing_test_name.as_deref(), Some("test_1"));
    // Test 2 still reported after the kill.
    assert_eq!(
        runner.executed(),
        vec![(MutantId(1), test_id(1)), (MutantId(1), test_id(2))]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn abort_on_first_kill_skips_remaining_tests() {
    let runner = Arc::new(ScriptedRunner::new(
        universe(4),
        Script {
            killers: BTreeMap::from([(MutantId(1), BTreeSet::from([test_id(1)]))]),
            ..Script::default()
        },
    ));
    let mut orchestrator = MutationOrchestrator::from_shared(
        runner.clone(),
        config().with_coverage(CoverageMode::Off),
    );
    let all = mutants([1]);

    orchestrator.run_session(&all).await.expect("session");

    assert_eq!(all[0].status(), MutantStatus::Killed);
    assert_eq!(runner.executed(), vec![(MutantId(1), test_id(1))]);
}

#[tokio::test(flavor = "current_thread")]
async fn uncovered_mutant_resolves_without_execution() {
    let mut coverage = TestCoverageInfos::new();
    coverage.record_test(test_id(1), [MutantId(2)]);
    let runner = Arc::new(ScriptedRunner::new(
        universe(2),
        Script {
            coverage: Some(coverage),
            ..Script::default()
        },
    ));
    let mut orchestrator = MutationOrchestrator::from_shared(runner.clone(), config());
    let all = mutants([1, 2]);

    let report = orchestrator.run_session(&all).await.expect("session");

    assert_eq!(all[0].status(), MutantStatus::NoCoverage);
    assert_eq!(all[1].status(), MutantStatus::Survived);
    assert!(runner.executed().iter().all(|(m, _)| *m != MutantId(1)));
    assert_eq!(report.summary.no_coverage, 1);
    assert_eq!(report.summary.survived, 1);
    assert!((report.summary.mutation_score - 0.0).abs() < 1e-12);
}

#[tokio::test(flavor = "current_thread")]
async fn crashed_batch_is_retried_once() {
    let runner = Arc::new(ScriptedRunner::new(
        universe(2),
        Script {
            crash_first_batches: 1,
            ..Script::default()
        },
    ));
    let mut orchestrator = MutationOrchestrator::from_shared(
        runner.clone(),
        config().with_concurrency(1).with_coverage(CoverageMode::Off),
    );
    let all = mutants([1]);

    orchestrator.run_session(&all).await.expect("session");

    assert_eq!(all[0].status(), MutantStatus::Survived);
    assert_eq!(runner.batch_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn repeated_crash_becomes_runtime_error() {
    let runner = Arc::new(ScriptedRunner::new(
        universe(2),
        Script {
            crash_first_batches: usize::MAX,
            ..Script::default()
        },
    ));
    let mut orchestrator = MutationOrchestrator::from_shared(
        runner.clone(),
        config().with_concurrency(1).with_coverage(CoverageMode::Off),
    );
    let all = mutants([1, 2]);

    let report = orchestrator
        .run_session(&all)
        .await
        .expect("host failures are absorbed into the report");

    for mutant in &all {
        assert_eq!(mutant.status(), MutantStatus::RuntimeError);
        assert!(
            mutant
                .diagnostic()
                .is_some_and(|d| d.contains("host exited with signal 9"))
        );
    }
    // Each mutant runs alone without coverage: two attempts apiece.
    assert_eq!(runner.batch_calls.load(Ordering::SeqCst), 4);
    assert_eq!(report.summary.runtime_error, 2);
}

#[tokio::test(flavor = "current_thread")]
async fn retry_bound_is_configurable() {
    let runner = Arc::new(ScriptedRunner::new(
        universe(1),
        Script {
            crash_first_batches: usize::MAX,
            ..Script::default()
        },
    ));
    let mut orchestrator = MutationOrchestrator::from_shared(
        runner.clone(),
        config()
            .with_coverage(CoverageMode::Off)
            .with_max_batch_retries(3),
    );
    let all = mutants([1]);

    orchestrator.run_session(&all).await.expect("session");

    assert_eq!(all[0].status(), MutantStatus::RuntimeError);
    assert_eq!(runner.batch_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduling_never_leaves_the_covering_set() {
    let mut coverage = TestCoverageInfos::new();
    coverage.record_test(test_id(1), [MutantId(1), MutantId(2)]);
    coverage.record_test(test_id(2), [MutantId(2), MutantId(3)]);
    coverage.record_test(test_id(3), [MutantId(4)]);
    coverage.record_test(test_id(5), [MutantId(1)]);
    let covering: BTreeMap<MutantId, TestsGuidList> = (1..=4)
        .map(|i| (MutantId(i), coverage.covering(MutantId(i))))
        .collect();

    let runner = Arc::new(ScriptedRunner::new(
        universe(5),
        Script {
            coverage: Some(coverage),
            killers: BTreeMap::from([(MutantId(3), BTreeSet::from([test_id(2)]))]),
            ..Script::default()
        },
    ));
    let mut orchestrator = MutationOrchestrator::from_shared(
        runner.clone(),
        config().with_concurrency(3).with_max_mutants_per_batch(2),
    );
    let all = mutants(1..=4);

    orchestrator.run_session(&all).await.expect("session");

    let executed = runner.executed();
    assert!(!executed.is_empty());
    for (mutant, test) in executed {
        assert!(
            covering[&mutant].explicit_ids().is_some_and(|ids| ids.contains(&test)),
            "mutant {mutant} ran uncovered test {test}"
        );
    }
    assert_eq!(all[2].status(), MutantStatus::Killed);
    for i in [0, 1, 3] {
        assert_eq!(all[i].status(), MutantStatus::Survived);
    }
}

#[tokio::test(flavor = "current_thread")]
async fn failed_coverage_capture_falls_back_to_every_test() {
    let runner = Arc::new(ScriptedRunner::new(
        universe(3),
        Script {
            coverage_fails: true,
            ..Script::default()
        },
    ));
    let mut orchestrator = MutationOrchestrator::from_shared(runner.clone(), config());
    let all = mutants([1, 2]);

    orchestrator.run_session(&all).await.expect("session");

    for mutant in &all {
        assert_eq!(mutant.covering_tests(), None);
        let ran: BTreeSet<TestId> = runner
            .executed()
            .into_iter()
            .filter(|(m, _)| *m == mutant.id())
            .map(|(_, t)| t)
            .collect();
        assert_eq!(ran, universe(3).ids().copied().collect());
    }
}

#[tokio::test(flavor = "current_thread")]
async fn hanging_mutant_times_out_and_others_still_resolve() {
    let runner = Arc::new(ScriptedRunner::new(
        universe(2),
        Script {
            hangs: BTreeSet::from([MutantId(1)]),
            ..Script::default()
        },
    ));
    let mut orchestrator = MutationOrchestrator::from_shared(
        runner.clone(),
        config().with_coverage(CoverageMode::Off),
    );
    let all = mutants([1, 2]);

    let report = orchestrator.run_session(&all).await.expect("session");

    assert_eq!(all[0].status(), MutantStatus::Timeout);
    assert_eq!(all[1].status(), MutantStatus::Survived);
    assert_eq!(report.summary.timeout, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn cancellation_fails_in_flight_mutants_and_keeps_queued_ones() {
    let runner = ScriptedRunner::new(
        universe(2),
        Script {
            block_batches: true,
            ..Script::default()
        },
    );
    let mut orchestrator = MutationOrchestrator::new(
        runner,
        config().with_concurrency(1).with_coverage(CoverageMode::Off),
    );
    let cancel = orchestrator.cancel_token();
    let all = mutants([1, 2]);

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let report = orchestrator.run_session(&all).await.expect("session");
    canceller.await.expect("canceller task");

    assert!(report.interrupted);
    assert_eq!(all[0].status(), MutantStatus::RuntimeError);
    assert_eq!(all[0].diagnostic().as_deref(), Some("session cancelled"));
    assert_eq!(all[1].status(), MutantStatus::NotRun);
    assert_eq!(report.summary.incomplete, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn journal_restores_results_unless_retesting() {
    let tmp = tempdir().expect("tempdir should be created");
    let journal = tmp.path().join("session.jsonl");
    let script = || Script {
        killers: BTreeMap::from([(MutantId(1), BTreeSet::from([test_id(1)]))]),
        ..Script::default()
    };

    let first = Arc::new(ScriptedRunner::new(universe(2), script()));
    let mut orchestrator = MutationOrchestrator::from_shared(
        first.clone(),
        config()
            .with_coverage(CoverageMode::Off)
            .with_journal_path(&journal),
    );
    orchestrator
        .run_session(&mutants([1, 2]))
        .await
        .expect("first session");
    assert_eq!(first.batch_calls.load(Ordering::SeqCst), 2);

    let second = Arc::new(ScriptedRunner::new(universe(2), script()));
    let mut orchestrator = MutationOrchestrator::from_shared(
        second.clone(),
        config()
            .with_coverage(CoverageMode::Off)
            .with_journal_path(&journal),
    );
    let resumed = mutants([1, 2]);
    let report = orchestrator.run_session(&resumed).await.expect("second session");
    assert_eq!(second.batch_calls.load(Ordering::SeqCst), 0);
    assert_eq!(resumed[0].status(), MutantStatus::Killed);
    assert_eq!(resumed[1].status(), MutantStatus::Survived);
    assert_eq!(resumed[0].killing_test(), Some(test_id(1)));
    assert_eq!(report.mutants[0].killing_test_name.as_deref(), Some("test_1"));
    assert!(!report.interrupted);

    let third = Arc::new(ScriptedRunner::new(universe(2), script()));
    let mut orchestrator = MutationOrchestrator::from_shared(
        third.clone(),
        config()
            .with_coverage(CoverageMode::Off)
            .with_journal_path(&journal)
            .with_retest_all(true),
    );
    orchestrator
        .run_session(&mutants([1, 2]))
        .await
        .expect("third session");
    assert_eq!(third.batch_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn initialization_runs_once_until_reset() {
    let runner = Arc::new(ScriptedRunner::new(universe(1), Script::default()));
    let mut orchestrator = MutationOrchestrator::from_shared(
        runner.clone(),
        config().with_coverage(CoverageMode::Off),
    );

    orchestrator.run_session(&mutants([1])).await.expect("first");
    orchestrator.run_session(&mutants([2])).await.expect("second");
    assert_eq!(runner.discover_calls.load(Ordering::SeqCst), 1);

    orchestrator.reset();
    assert!(orchestrator.tests().is_none());
    orchestrator.run_session(&mutants([3])).await.expect("third");
    assert_eq!(runner.discover_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn hung_baseline_hits_initialization_ceiling() {
    let runner = ScriptedRunner::new(
        universe(1),
        Script {
            baseline_delay: Duration::from_secs(30),
            ..Script::default()
        },
    );
    let mut orchestrator =
        MutationOrchestrator::new(runner, config().with_initial_run_ceiling_ms(50));

    let err = orchestrator
        .initialize()
        .await
        .expect_err("baseline should exceed the ceiling");
    assert!(matches!(
        err,
        OrchestratorError::InitializationTimeout { after } if after == Duration::from_millis(50)
    ));
}

//! Test runner contract driven by the scheduler.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::channel::ChannelError;
use super::mutant::{Mutant, MutantId, TestCoverageInfos};
use super::result::TestRunResult;
use super::testset::{TestSet, TestsGuidList};

/// Runner-level errors.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The host never connected.
    #[error("test host did not connect after {attempts} attempt(s): {source}")]
    ConnectTimeout {
        /// Spawn/connect attempts made.
        attempts: u32,
        /// Last connection error.
        #[source]
        source: ChannelError,
    },
    /// The host process died or its channel closed before any result arrived.
    #[error("test host crashed: {0}")]
    HostCrashed(String),
    /// The host sent something that does not fit the protocol.
    #[error("test host protocol error: {0}")]
    Protocol(String),
    /// A run exceeded its absolute ceiling.
    #[error("test host did not answer within {0:?}")]
    Timeout(Duration),
    /// Launching the host failed.
    #[error("failed to launch test host: {0}")]
    Spawn(std::io::Error),
    /// Channel failure.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// One mutant scheduled into a batch.
#[derive(Debug, Clone)]
pub struct PlannedMutant {
    /// The mutant.
    pub mutant: Arc<Mutant>,
    /// Tests to run against it.
    pub tests: TestsGuidList,
    /// Bound for this mutant's run.
    pub timeout: Duration,
}

/// Progress report from inside a running batch.
#[derive(Debug, Clone, Copy)]
pub struct TestUpdate<'a> {
    /// Mutants the reported tests ran against.
    pub mutants: &'a [MutantId],
    /// Tests that failed so far.
    pub failing: &'a TestsGuidList,
    /// Tests that ran so far.
    pub executed: &'a TestsGuidList,
    /// Tests that timed out so far.
    pub timed_out: &'a TestsGuidList,
}

/// Receives [`TestUpdate`]s while a batch runs.
pub trait TestUpdateHandler: Send + Sync {
    /// Apply one update. Returns `false` when none of `update.mutants` needs more tests.
    fn on_update(&self, update: TestUpdate<'_>) -> bool;
}

/// Result of a batch: one entry per mutant the host actually ran.
#[derive(Debug, Clone, Default)]
pub struct BatchRunResult {
    /// Per-mutant outcomes. Mutants missing here were never started.
    pub results: BTreeMap<MutantId, TestRunResult>,
    /// Set when the host failed part-way through the batch.
    pub host_error: Option<String>,
}

/// Result of a coverage-capture run.
#[derive(Debug, Clone)]
pub struct CoverageCapture {
    /// The unmutated run that collected coverage.
    pub result: TestRunResult,
    /// Covering tests per mutant.
    pub coverage: TestCoverageInfos,
}

/// Process-execution contract consumed by the scheduler.
pub trait TestRunner: Send + Sync {
    /// Discover the available tests.
    fn discover_tests(&self) -> impl Future<Output = Result<TestSet, RunnerError>> + Send;

    /// Run the whole suite once without any mutation active.
    fn run_baseline(
        &self,
        tests: &TestSet,
    ) -> impl Future<Output = Result<TestRunResult, RunnerError>> + Send;

    /// Run the suite unmutated while recording which tests reach which mutants.
    fn capture_coverage(
        &self,
        tests: &TestSet,
        mutants: &[Arc<Mutant>],
    ) -> impl Future<Output = Result<CoverageCapture, RunnerError>> + Send;

    /// Run a batch on host slot `slot`, activating each planned mutant in turn and streaming
    /// progress to `handler`.
    fn run_batch(
        &self,
        slot: usize,
        tests: &TestSet,
        batch: &[PlannedMutant],
        handler: &dyn TestUpdateHandler,
    ) -> impl Future<Output = Result<BatchRunResult, RunnerError>> + Send;
}

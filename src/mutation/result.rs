//! Outcome of one test execution round.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::testset::{TestId, TestSet, TestsGuidList};

/// Model invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// Failing tests reported that were never executed.
    #[error("{count} failing test(s) are not part of the executed tests")]
    FailingNotExecuted {
        /// Number of offending tests.
        count: usize,
    },
}

/// Immutable record of one execution round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunResult {
    /// True when every executed test passed and nothing timed out.
    pub success: bool,
    /// Tests that failed.
    pub failing_tests: TestsGuidList,
    /// Tests that did not finish in time.
    pub timed_out_tests: TestsGuidList,
    /// Tests that actually ran.
    pub executed_tests: TestsGuidList,
    /// Free-form diagnostic from the host.
    pub message: String,
    /// Wall-clock duration of the round.
    pub duration: Duration,
    /// Number of tests the round knew about.
    pub total_tests: usize,
    /// Per-test durations, when the host reported them.
    #[serde(default)]
    pub test_durations: BTreeMap<TestId, Duration>,
    /// The whole round was aborted by its deadline.
    #[serde(default)]
    pub session_timed_out: bool,
}

impl TestRunResult {
    /// A round where every executed test passed.
    pub fn passed(executed_tests: TestsGuidList, duration: Duration, total_tests: usize) -> Self {
        Self {
            success: true,
            failing_tests: TestsGuidList::no_test(),
            timed_out_tests: TestsGuidList::no_test(),
            executed_tests,
            message: String::new(),
            duration,
            total_tests,
            test_durations: BTreeMap::new(),
            session_timed_out: false,
        }
    }

    /// A round with failing tests.
    pub fn failed(
        executed_tests: TestsGuidList,
        failing_tests: TestsGuidList,
        message: impl Into<String>,
        duration: Duration,
        total_tests: usize,
    ) -> Self {
        Self {
            success: false,
            failing_tests,
            timed_out_tests: TestsGuidList::no_test(),
            executed_tests,
            message: message.into(),
            duration,
            total_tests,
            test_durations: BTreeMap::new(),
            session_timed_out: false,
        }
    }

    /// A round aborted by its deadline. `still_running` are the tests in flight at that time.
    pub fn timed_out(
        executed_tests: TestsGuidList,
        failing_tests: TestsGuidList,
        still_running: TestsGuidList,
        duration: Duration,
        total_tests: usize,
    ) -> Self {
        Self {
            success: false,
            failing_tests,
            timed_out_tests: still_running,
            executed_tests,
            message: "test run exceeded its timeout".to_string(),
            duration,
            total_tests,
            test_durations: BTreeMap::new(),
            session_timed_out: true,
        }
    }

    /// Attach per-test durations.
    pub fn with_test_durations(mut self, durations: BTreeMap<TestId, Duration>) -> Self {
        self.test_durations = durations;
        self
    }

    /// Check `failing_tests ⊆ executed_tests` (skipped when executed is the sentinel).
    pub fn check_consistency(&self, universe: &TestSet) -> Result<(), ModelError> {
        let Some(executed) = self.executed_tests.explicit_ids() else {
            return Ok(());
        };
        let count = self
            .failing_tests
            .resolve(universe)
            .difference(executed)
            .count();
        if count == 0 {
            Ok(())
        } else {
            Err(ModelError::FailingNotExecuted { count })
        }
    }
}

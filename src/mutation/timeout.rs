//! Timeout estimation from the unmutated baseline run.

use std::collections::BTreeMap;
use std::time::Duration;

use super::testset::{TestId, TestsGuidList};

const MIN_TEST_DURATION: Duration = Duration::from_millis(1);

/// Computes run timeouts from the baseline measurement.
///
/// `timeout(estimate) = estimate * factor + additional`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutValueCalculator {
    additional: Duration,
    factor: f64,
    baseline: Duration,
    test_count: usize,
    test_durations: BTreeMap<TestId, Duration>,
}

impl TimeoutValueCalculator {
    /// Calibrate from the baseline wall-clock duration.
    pub fn calibrate(
        baseline: Duration,
        additional: Duration,
        factor: f64,
        test_count: usize,
    ) -> Self {
        Self {
            additional,
            factor: if factor.is_finite() && factor >= 1.0 {
                factor
            } else {
                1.0
            },
            baseline,
            test_count,
            test_durations: BTreeMap::new(),
        }
    }

    /// Attach per-test baseline durations.
    pub fn with_test_durations(mut self, durations: BTreeMap<TestId, Duration>) -> Self {
        self.test_durations = durations;
        self
    }

    /// Measured baseline.
    pub fn baseline(&self) -> Duration {
        self.baseline
    }

    /// Tests discovered at baseline time.
    pub fn test_count(&self) -> usize {
        self.test_count
    }

    /// Timeout for a run expected to take `estimate`.
    pub fn timeout_for(&self, estimate: Duration) -> Duration {
        let scaled = (estimate.as_nanos() as f64 * self.factor).round();
        Duration::from_nanos(scaled.min(u64::MAX as f64) as u64) + self.additional
    }

    /// Ceiling applied to every mutant run without a tighter bound.
    pub fn default_timeout(&self) -> Duration {
        self.timeout_for(self.baseline)
    }

    /// Timeout for running `tests` against one mutant.
    ///
    /// Uses the sum of the tests' baseline durations when every one of them is known. The
    /// result stays between the measured baseline and [`Self::default_timeout`]; hosts report
    /// whole milliseconds, so a fast selection can sum to zero.
    pub fn timeout_for_tests(&self, tests: &TestsGuidList) -> Duration {
        let default = self.default_timeout();
        let Some(ids) = tests.explicit_ids() else {
            return default;
        };
        let estimate = ids.iter().try_fold(Duration::ZERO, |acc, id| {
            self.test_durations
                .get(id)
                .map(|d| acc + (*d).max(MIN_TEST_DURATION))
        });
        match estimate {
            Some(estimate) if !ids.is_empty() => self
                .timeout_for(estimate)
                .max(self.baseline)
                .min(default),
            _ => default,
        }
    }
}

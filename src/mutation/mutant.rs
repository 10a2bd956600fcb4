//! Mutants, their status state machine, and the coverage mapping.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::testset::{TestId, TestsGuidList};

/// Identifier assigned by mutation generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutantId(pub u32);

impl fmt::Display for MutantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source location of a mutant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceSpan {
    /// Source file path.
    pub file: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    #[serde(default)]
    pub column: u32,
}

/// Mutant lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MutantStatus {
    /// Not yet scheduled.
    NotRun = 0,
    /// Scheduled, result outstanding.
    Pending = 1,
    /// Terminal: a covering test failed.
    Killed = 2,
    /// Terminal: every covering test passed.
    Survived = 3,
    /// Terminal: the run for this mutant exceeded its timeout.
    Timeout = 4,
    /// Terminal: no test covers the mutant.
    NoCoverage = 5,
    /// Terminal: the execution environment failed.
    RuntimeError = 6,
}

impl MutantStatus {
    /// True for final statuses.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::NotRun | Self::Pending)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NotRun,
            1 => Self::Pending,
            2 => Self::Killed,
            3 => Self::Survived,
            4 => Self::Timeout,
            5 => Self::NoCoverage,
            _ => Self::RuntimeError,
        }
    }
}

impl fmt::Display for MutantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotRun => "not_run",
            Self::Pending => "pending",
            Self::Killed => "killed",
            Self::Survived => "survived",
            Self::Timeout => "timeout",
            Self::NoCoverage => "no_coverage",
            Self::RuntimeError => "runtime_error",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Default)]
struct MutantDetails {
    covering_tests: Option<TestsGuidList>,
    diagnostic: Option<String>,
    killing_test: Option<TestId>,
    timeout_override: Option<Duration>,
}

/// One mutant, shared between the scheduler and result-handling callbacks.
///
/// Status changes go through compare-and-set on an atomic tag: a terminal status, once stored,
/// is never overwritten by another resolution.
#[derive(Debug)]
pub struct Mutant {
    id: MutantId,
    label: String,
    span: Option<SourceSpan>,
    status: AtomicU8,
    details: Mutex<MutantDetails>,
}

impl Mutant {
    /// New mutant in `NotRun`.
    pub fn new(id: MutantId, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            span: None,
            status: AtomicU8::new(MutantStatus::NotRun as u8),
            details: Mutex::new(MutantDetails::default()),
        }
    }

    /// Attach a source span.
    pub fn with_span(mut self, span: SourceSpan) -> Self {
        self.span = Some(span);
        self
    }

    /// Bound this mutant's runs by `timeout` instead of the estimated default.
    pub fn with_timeout_override(self, timeout: Duration) -> Self {
        self.lock_details().timeout_override = Some(timeout);
        self
    }

    /// Wrap in an `Arc` for sharing with the scheduler.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Identifier.
    pub fn id(&self) -> MutantId {
        self.id
    }

    /// Human-readable description.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Source span, if known.
    pub fn span(&self) -> Option<&SourceSpan> {
        self.span.as_ref()
    }

    /// Current status.
    pub fn status(&self) -> MutantStatus {
        MutantStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// True once a terminal status has been stored.
    pub fn is_resolved(&self) -> bool {
        self.status().is_terminal()
    }

    fn compare_and_set(&self, from: MutantStatus, to: MutantStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `NotRun -> Pending`.
    pub fn mark_pending(&self) -> bool {
        self.compare_and_set(MutantStatus::NotRun, MutantStatus::Pending)
    }

    /// `Pending -> NotRun`, used when a batch is rescheduled.
    pub fn revert_to_not_run(&self) -> bool {
        self.compare_and_set(MutantStatus::Pending, MutantStatus::NotRun)
    }

    /// Store a terminal status if none is stored yet.
    ///
    /// Returns `Ok(status)` for the winning transition, `Err(current)` when the mutant was
    /// already terminal (or `status` is not terminal).
    pub fn resolve(&self, status: MutantStatus) -> Result<MutantStatus, MutantStatus> {
        if !status.is_terminal() {
            return Err(self.status());
        }
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if MutantStatus::from_u8(current).is_terminal() {
                return Err(MutantStatus::from_u8(current));
            }
            match self.status.compare_exchange_weak(
                current,
                status as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(status),
                Err(actual) => current = actual,
            }
        }
    }

    /// Resolve and record a diagnostic only when this call wins the transition.
    pub fn resolve_with(
        &self,
        status: MutantStatus,
        diagnostic: impl Into<String>,
        killing_test: Option<TestId>,
    ) -> bool {
        // Details are locked across the transition so readers never see the status alone.
        let mut details = self.lock_details();
        if self.resolve(status).is_err() {
            return false;
        }
        details.diagnostic = Some(diagnostic.into());
        details.killing_test = killing_test;
        true
    }

    /// Administrative override: forget any previous status.
    pub fn reset_for_retest(&self) {
        let mut details = self.lock_details();
        self.status
            .store(MutantStatus::NotRun as u8, Ordering::Release);
        details.diagnostic = None;
        details.killing_test = None;
    }

    /// Restore a terminal status recorded by an earlier session. Only applies to `NotRun`.
    pub fn restore(
        &self,
        status: MutantStatus,
        diagnostic: Option<String>,
        killing_test: Option<TestId>,
    ) -> bool {
        let mut details = self.lock_details();
        if !status.is_terminal() || !self.compare_and_set(MutantStatus::NotRun, status) {
            return false;
        }
        details.diagnostic = diagnostic;
        details.killing_test = killing_test;
        true
    }

    /// Covering tests; `None` means coverage is unknown.
    pub fn covering_tests(&self) -> Option<TestsGuidList> {
        self.lock_details().covering_tests.clone()
    }

    /// Record covering tests.
    pub fn set_covering_tests(&self, tests: Option<TestsGuidList>) {
        self.lock_details().covering_tests = tests;
    }

    /// Diagnostic recorded with the terminal status.
    pub fn diagnostic(&self) -> Option<String> {
        self.lock_details().diagnostic.clone()
    }

    /// First test observed failing against this mutant.
    pub fn killing_test(&self) -> Option<TestId> {
        self.lock_details().killing_test
    }

    /// Explicit timeout bound, if any.
    pub fn timeout_override(&self) -> Option<Duration> {
        self.lock_details().timeout_override
    }

    fn lock_details(&self) -> MutexGuard<'_, MutantDetails> {
        self.details.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Serialized form of a mutant as produced by mutation generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutantDefinition {
    /// Mutant id.
    pub id: MutantId,
    /// Human-readable label.
    pub label: String,
    /// Source file.
    #[serde(default)]
    pub file: Option<String>,
    /// 1-based line.
    #[serde(default)]
    pub line: u32,
    /// 1-based column.
    #[serde(default)]
    pub column: u32,
    /// Explicit timeout bound in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl MutantDefinition {
    /// Build the runtime mutant.
    pub fn into_mutant(self) -> Mutant {
        let mut mutant = Mutant::new(self.id, self.label);
        if let Some(file) = self.file {
            mutant = mutant.with_span(SourceSpan {
                file,
                line: self.line,
                column: self.column,
            });
        }
        if let Some(ms) = self.timeout_ms {
            mutant = mutant.with_timeout_override(Duration::from_millis(ms));
        }
        mutant
    }
}

/// Coverage mapping collected by a coverage-capture run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestCoverageInfos {
    covering: BTreeMap<MutantId, TestsGuidList>,
}

impl TestCoverageInfos {
    /// Empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `test` executed each of `mutants`.
    pub fn record_test(&mut self, test: TestId, mutants: impl IntoIterator<Item = MutantId>) {
        for mutant in mutants {
            self.covering
                .entry(mutant)
                .or_insert_with(TestsGuidList::no_test)
                .insert(test);
        }
    }

    /// Record mutants executed outside any test: every test may reach them.
    pub fn record_static(&mut self, mutants: impl IntoIterator<Item = MutantId>) {
        for mutant in mutants {
            self.covering.insert(mutant, TestsGuidList::every_test());
        }
    }

    /// Covering tests for `mutant`; mutants never hit get the empty list.
    pub fn covering(&self, mutant: MutantId) -> TestsGuidList {
        self.covering.get(&mutant).cloned().unwrap_or_default()
    }

    /// Number of mutants hit by at least one test.
    pub fn covered_mutants(&self) -> usize {
        self.covering.len()
    }

    /// Write covering tests into every mutant of `mutants`.
    pub fn annotate(&self, mutants: &[Arc<Mutant>]) {
        for mutant in mutants {
            mutant.set_covering_tests(Some(self.covering(mutant.id())));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;

    #[test]
    fn lifecycle_follows_state_machine() {
        let mutant = Mutant::new(MutantId(1), "replace + with -");
        assert_eq!(mutant.status(), MutantStatus::NotRun);
        assert!(mutant.mark_pending());
        assert!(!mutant.mark_pending());
        assert_eq!(mutant.resolve(MutantStatus::Killed), Ok(MutantStatus::Killed));
        assert_eq!(
            mutant.resolve(MutantStatus::Survived),
            Err(MutantStatus::Killed)
        );
        assert!(!mutant.revert_to_not_run());
        assert_eq!(mutant.status(), MutantStatus::Killed);
    }

    #[test]
    fn resolving_twice_with_same_status_is_stable() {
        let mutant = Mutant::new(MutantId(2), "m");
        mutant.mark_pending();
        assert!(mutant.resolve_with(MutantStatus::Timeout, "first", None));
        assert!(!mutant.resolve_with(MutantStatus::Timeout, "second", None));
        assert_eq!(mutant.status(), MutantStatus::Timeout);
        assert_eq!(mutant.diagnostic().as_deref(), Some("first"));
    }

    #[test]
    fn non_terminal_resolution_is_rejected() {
        let mutant = Mutant::new(MutantId(3), "m");
        assert_eq!(
            mutant.resolve(MutantStatus::Pending),
            Err(MutantStatus::NotRun)
        );
    }

    #[test]
    fn reset_and_restore() {
        let mutant = Mutant::new(MutantId(4), "m");
        assert!(mutant.restore(
            MutantStatus::Killed,
            Some("boom".into()),
            Some(TestId::from_u128(8))
        ));
        assert!(!mutant.restore(MutantStatus::Survived, None, None));
        assert_eq!(mutant.killing_test(), Some(TestId::from_u128(8)));
        assert_eq!(mutant.diagnostic().as_deref(), Some("boom"));
        mutant.reset_for_retest();
        assert_eq!(mutant.status(), MutantStatus::NotRun);
        assert_eq!(mutant.killing_test(), None);
        assert!(mutant.mark_pending());
    }

    #[test]
    fn killed_status_is_never_visible_without_its_killing_test() {
        for round in 0..64u32 {
            let mutant = Arc::new(Mutant::new(MutantId(round), "m"));
            mutant.mark_pending();
            let resolver = {
                let mutant = mutant.clone();
                std::thread::spawn(move || {
                    mutant.resolve_with(MutantStatus::Killed, "failed", Some(TestId::from_u128(1)))
                })
            };
            while !mutant.is_resolved() {
                std::hint::spin_loop();
            }
            assert_eq!(mutant.killing_test(), Some(TestId::from_u128(1)));
            assert!(resolver.join().expect("resolver thread should join"));
        }
    }

    #[test]
    fn concurrent_resolutions_have_one_winner() {
        let mutant = Arc::new(Mutant::new(MutantId(5), "m"));
        mutant.mark_pending();
        let barrier = Arc::new(Barrier::new(4));
        let statuses = [
            MutantStatus::Killed,
            MutantStatus::Survived,
            MutantStatus::Timeout,
            MutantStatus::RuntimeError,
        ];
        let handles: Vec<_> = statuses
            .into_iter()
            .map(|status| {
                let mutant = mutant.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    mutant.resolve(status).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("resolver thread should join"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(mutant.is_resolved());
    }

    #[test]
    fn coverage_annotation_distinguishes_uncovered_and_static() {
        let t1 = TestId::from_u128(1);
        let t2 = TestId::from_u128(2);
        let mut coverage = TestCoverageInfos::new();
        coverage.record_test(t1, [MutantId(1), MutantId(2)]);
        coverage.record_test(t2, [MutantId(2)]);
        coverage.record_static([MutantId(3)]);

        let mutants: Vec<_> = (1..=4).map(|i| Mutant::new(MutantId(i), "m").shared()).collect();
        coverage.annotate(&mutants);

        assert_eq!(
            mutants[0].covering_tests(),
            Some(TestsGuidList::from_ids([t1]))
        );
        assert_eq!(
            mutants[1].covering_tests(),
            Some(TestsGuidList::from_ids([t1, t2]))
        );
        assert_eq!(
            mutants[2].covering_tests(),
            Some(TestsGuidList::every_test())
        );
        assert_eq!(mutants[3].covering_tests(), Some(TestsGuidList::no_test()));
    }

    #[test]
    fn definition_builds_runtime_mutant() {
        let def: MutantDefinition = serde_json::from_str(
            r#"{"id":12,"label":"flip sign","file":"calc.rs","line":4,"timeout_ms":250}"#,
        )
        .expect("definition should parse");
        let mutant = def.into_mutant();
        assert_eq!(mutant.id(), MutantId(12));
        assert_eq!(mutant.span().map(|s| s.line), Some(4));
        assert_eq!(mutant.timeout_override(), Some(Duration::from_millis(250)));
        assert_eq!(mutant.status(), MutantStatus::NotRun);
    }
}

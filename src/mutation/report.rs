//! Final status report handed to reporting sinks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::mutant::{Mutant, MutantId, MutantStatus, SourceSpan};
use super::testset::{TestId, TestSet};

/// Per-mutant report entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutantReport {
    /// Mutant id.
    pub id: MutantId,
    /// Human-readable label.
    pub label: String,
    /// Source location.
    #[serde(default)]
    pub span: Option<SourceSpan>,
    /// Final status.
    pub status: MutantStatus,
    /// Diagnostic recorded with the status.
    #[serde(default)]
    pub diagnostic: Option<String>,
    /// First test seen failing.
    #[serde(default)]
    pub killing_test: Option<TestId>,
    /// Name of the killing test, when known.
    #[serde(default)]
    pub killing_test_name: Option<String>,
    /// Covering tests; `None` when coverage was not captured or reached every test.
    #[serde(default)]
    pub covering_tests: Option<usize>,
}

impl MutantReport {
    /// Snapshot one mutant.
    pub fn from_mutant(mutant: &Mutant, tests: &TestSet) -> Self {
        let killing_test = mutant.killing_test();
        Self {
            id: mutant.id(),
            label: mutant.label().to_string(),
            span: mutant.span().cloned(),
            status: mutant.status(),
            diagnostic: mutant.diagnostic(),
            killing_test,
            killing_test_name: killing_test
                .filter(|id| tests.contains(id))
                .map(|id| tests.name_of(&id)),
            covering_tests: mutant
                .covering_tests()
                .filter(|c| !c.is_every_test())
                .map(|c| c.count(tests)),
        }
    }
}

/// Aggregated counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Total mutants.
    pub total: usize,
    /// Mutation score, percentage.
    pub mutation_score: f64,
    /// Killed mutants.
    pub killed: usize,
    /// Survived mutants.
    pub survived: usize,
    /// Timed-out mutants.
    pub timeout: usize,
    /// Mutants no test reaches.
    pub no_coverage: usize,
    /// Mutants whose run failed.
    pub runtime_error: usize,
    /// Mutants left unresolved.
    pub incomplete: usize,
}

impl RunSummary {
    /// Count statuses.
    pub fn from_statuses(statuses: impl IntoIterator<Item = MutantStatus>) -> Self {
        let mut out = Self::default();
        for status in statuses {
            out.total += 1;
            match status {
                MutantStatus::Killed => out.killed += 1,
                MutantStatus::Survived => out.survived += 1,
                MutantStatus::Timeout => out.timeout += 1,
                MutantStatus::NoCoverage => out.no_coverage += 1,
                MutantStatus::RuntimeError => out.runtime_error += 1,
                MutantStatus::NotRun | MutantStatus::Pending => out.incomplete += 1,
            }
        }

        let detected = out.killed + out.timeout;
        let scored = detected + out.survived + out.no_coverage;
        out.mutation_score = if scored > 0 {
            (detected as f64) * 100.0 / (scored as f64)
        } else {
            100.0
        };
        out
    }
}

/// Final per-mutant statuses of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Session id.
    pub session_id: String,
    /// Whether the session was cancelled.
    pub interrupted: bool,
    /// Tests discovered.
    pub test_count: usize,
    /// Aggregated counts.
    pub summary: RunSummary,
    /// One entry per mutant, in id order.
    pub mutants: Vec<MutantReport>,
}

impl StatusReport {
    /// Snapshot `mutants` after a session.
    pub fn collect(
        session_id: impl Into<String>,
        mutants: &[Arc<Mutant>],
        tests: &TestSet,
        interrupted: bool,
    ) -> Self {
        let mut entries: Vec<MutantReport> = mutants
            .iter()
            .map(|m| MutantReport::from_mutant(m, tests))
            .collect();
        entries.sort_by_key(|m| m.id);
        Self {
            session_id: session_id.into(),
            interrupted,
            test_count: tests.len(),
            summary: RunSummary::from_statuses(entries.iter().map(|m| m.status)),
            mutants: entries,
        }
    }

    /// Pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

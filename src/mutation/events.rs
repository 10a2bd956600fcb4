//! Event model for the append-only session journal.

use serde::{Deserialize, Serialize};

use super::mutant::{MutantId, MutantStatus};
use super::testset::TestId;

/// Journal event emitted during orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MutationEvent {
    /// New session started.
    SessionStarted {
        /// Session id.
        session_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Mutants handed to the session.
        mutants: usize,
        /// Tests discovered.
        tests: usize,
    },
    /// Mutant reached a terminal status.
    MutantResolved {
        /// Session id.
        session_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Mutant id.
        mutant_id: MutantId,
        /// Terminal status.
        status: MutantStatus,
        /// Diagnostic recorded with the status.
        #[serde(default)]
        diagnostic: Option<String>,
        /// First test seen failing.
        #[serde(default)]
        killing_test: Option<TestId>,
    },
    /// Session cancelled by signal or operator.
    SessionInterrupted {
        /// Session id.
        session_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Free-form reason.
        reason: String,
    },
    /// Session finished.
    SessionCompleted {
        /// Session id.
        session_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
    },
}

impl MutationEvent {
    /// Session the event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::MutantResolved { session_id, .. }
            | Self::SessionInterrupted { session_id, .. }
            | Self::SessionCompleted { session_id, .. } => session_id,
        }
    }
}

/// Current unix timestamp in milliseconds.
pub fn now_timestamp_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_else(|_| std::time::Duration::from_secs(0));
    (duration.as_secs() as i64)
        .saturating_mul(1000)
        .saturating_add(duration.subsec_millis() as i64)
}

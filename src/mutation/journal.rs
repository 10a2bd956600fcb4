//! Journal replay and status restoration.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use super::events::{MutationEvent, now_timestamp_ms};
use super::mutant::{Mutant, MutantId, MutantStatus};
use super::testset::TestId;

/// Last recorded outcome of one mutant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOutcome {
    /// Terminal status.
    pub status: MutantStatus,
    /// Diagnostic.
    pub diagnostic: Option<String>,
    /// Killing test.
    pub killing_test: Option<TestId>,
    /// Session that recorded it.
    pub session_id: String,
}

/// State materialized from a journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalSnapshot {
    /// Session ids in the order they started.
    pub sessions: Vec<String>,
    /// Latest outcome per mutant.
    pub outcomes: BTreeMap<MutantId, RecordedOutcome>,
    /// Number of malformed lines ignored.
    pub malformed_lines: usize,
    /// Whether the last session was interrupted.
    pub interrupted: bool,
    /// Whether the last session completed.
    pub completed: bool,
}

impl JournalSnapshot {
    /// Restore recorded statuses into `mutants` still at `NotRun`. Returns how many were
    /// restored.
    pub fn restore_into(&self, mutants: &[Arc<Mutant>]) -> usize {
        mutants
            .iter()
            .filter(|mutant| {
                self.outcomes.get(&mutant.id()).is_some_and(|recorded| {
                    mutant.restore(
                        recorded.status,
                        recorded.diagnostic.clone(),
                        recorded.killing_test,
                    )
                })
            })
            .count()
    }
}

/// Journal errors.
#[derive(Debug, Error)]
pub enum JournalError {
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Event encoding failure.
    #[error("failed to encode journal event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Replay a journal into a snapshot. Later outcomes replace earlier ones.
pub fn replay_events(path: &Path) -> Result<JournalSnapshot, JournalError> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut snapshot = JournalSnapshot::default();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<MutationEvent>(&line) else {
            snapshot.malformed_lines += 1;
            continue;
        };

        match event {
            MutationEvent::SessionStarted { session_id, .. } => {
                snapshot.sessions.push(session_id);
                snapshot.interrupted = false;
                snapshot.completed = false;
            }
            MutationEvent::MutantResolved {
                session_id,
                mutant_id,
                status,
                diagnostic,
                killing_test,
                ..
            } => {
                if status.is_terminal() {
                    snapshot.outcomes.insert(
                        mutant_id,
                        RecordedOutcome {
                            status,
                            diagnostic,
                            killing_test,
                            session_id,
                        },
                    );
                }
            }
            MutationEvent::SessionInterrupted { .. } => snapshot.interrupted = true,
            MutationEvent::SessionCompleted { .. } => snapshot.completed = true,
        }
    }

    Ok(snapshot)
}

/// Append one event as a JSONL line.
pub fn append_event(path: &Path, event: &MutationEvent) -> Result<(), JournalError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let json = serde_json::to_string(event)?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()?;
    Ok(())
}

/// Journal file bound to one session.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
    session_id: String,
}

impl Journal {
    /// Journal at `path` for a fresh session.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            session_id: Uuid::new_v4().to_string(),
        }
    }

    /// Journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Id of the current session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Replay earlier sessions; a missing file is an empty journal.
    pub fn replay(&self) -> Result<JournalSnapshot, JournalError> {
        match replay_events(&self.path) {
            Err(JournalError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(JournalSnapshot::default())
            }
            other => other,
        }
    }

    /// Record the session start.
    pub fn session_started(&self, mutants: usize, tests: usize) -> Result<(), JournalError> {
        append_event(
            &self.path,
            &MutationEvent::SessionStarted {
                session_id: self.session_id.clone(),
                timestamp_ms: now_timestamp_ms(),
                mutants,
                tests,
            },
        )
    }

    /// Record a mutant's terminal status. Non-terminal mutants are skipped.
    pub fn mutant_resolved(&self, mutant: &Mutant) -> Result<(), JournalError> {
        let status = mutant.status();
        if !status.is_terminal() {
            return Ok(());
        }
        append_event(
            &self.path,
            &MutationEvent::MutantResolved {
                session_id: self.session_id.clone(),
                timestamp_ms: now_timestamp_ms(),
                mutant_id: mutant.id(),
                status,
                diagnostic: mutant.diagnostic(),
                killing_test: mutant.killing_test(),
            },
        )
    }

    /// Record an interruption.
    pub fn session_interrupted(&self, reason: &str) -> Result<(), JournalError> {
        append_event(
            &self.path,
            &MutationEvent::SessionInterrupted {
                session_id: self.session_id.clone(),
                timestamp_ms: now_timestamp_ms(),
                reason: reason.to_string(),
            },
        )
    }

    /// Record completion.
    pub fn session_completed(&self) -> Result<(), JournalError> {
        append_event(
            &self.path,
            &MutationEvent::SessionCompleted {
                session_id: self.session_id.clone(),
                timestamp_ms: now_timestamp_ms(),
            },
        )
    }
}

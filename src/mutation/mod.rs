//! Coverage-driven mutant execution.
//!
//! The [`MutationOrchestrator`] discovers tests through a [`TestRunner`], calibrates timeouts from
//! an unmutated baseline, captures per-test coverage and then runs batches of mutants on a bounded
//! number of test hosts, resolving each [`Mutant`] to a terminal [`MutantStatus`].

pub mod channel;
pub mod config;
pub mod events;
pub mod host;
pub mod journal;
pub mod mutant;
pub mod protocol;
/// Final status report handed to reporting sinks.
pub mod report;
pub mod result;
pub mod runner;
pub mod scheduler;
pub mod testset;
pub mod timeout;

#[cfg(unix)]
pub use channel::ChannelListener;
pub use channel::{ChannelError, FrameDecoder, FramedChannel, Inbox, encode_frame};
pub use config::{CoverageMode, OrchestratorConfig};
pub use events::{MutationEvent, now_timestamp_ms};
pub use host::{HostCommand, HostSession, HostTestRunner};
pub use journal::{Journal, JournalError, JournalSnapshot, RecordedOutcome};
pub use mutant::{
    Mutant, MutantDefinition, MutantId, MutantStatus, SourceSpan, TestCoverageInfos,
};
pub use protocol::{ControlMessage, HostClient, HostMessage, PIPE_ENV, TestSelection};
pub use report::{MutantReport, RunSummary, StatusReport};
pub use result::{ModelError, TestRunResult};
pub use runner::{
    BatchRunResult, CoverageCapture, PlannedMutant, RunnerError, TestRunner, TestUpdate,
    TestUpdateHandler,
};
pub use scheduler::{
    BatchTracker, CancelToken, MutationOrchestrator, OrchestratorError, resolve_from_result,
    select_tests,
};
pub use testset::{TestDescription, TestId, TestSet, TestsGuidList};
pub use timeout::TimeoutValueCalculator;

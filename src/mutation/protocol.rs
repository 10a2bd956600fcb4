//! JSON messages exchanged with a test host over a [`FramedChannel`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::channel::{ChannelError, FramedChannel, Inbox};
use super::mutant::MutantId;
use super::testset::{TestDescription, TestId, TestsGuidList};

/// Environment variable carrying the orchestrator socket path to the host.
pub const PIPE_ENV: &str = "KITCHENSINK_PIPE";

/// Which tests a run should execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ids", rename_all = "snake_case")]
pub enum TestSelection {
    /// The whole suite.
    All,
    /// Only these tests.
    List(Vec<TestId>),
}

impl From<&TestsGuidList> for TestSelection {
    fn from(list: &TestsGuidList) -> Self {
        match list.explicit_ids() {
            None => Self::All,
            Some(ids) => Self::List(ids.iter().copied().collect()),
        }
    }
}

/// Orchestrator → host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Report every available test.
    Discover,
    /// Run tests with `mutant` active (`None` runs unmutated code).
    Run {
        /// Active mutation.
        mutant: Option<MutantId>,
        /// Tests to execute.
        tests: TestSelection,
        /// Report which mutants each test executes.
        #[serde(default)]
        capture_coverage: bool,
    },
    /// Skip the remaining tests of `mutant` and report completion.
    StopMutant {
        /// Mutant to stop.
        mutant: MutantId,
    },
    /// Exit.
    Shutdown,
}

/// Host → orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Answer to [`ControlMessage::Discover`].
    Discovered {
        /// Available tests.
        tests: Vec<TestDescription>,
    },
    /// One test finished.
    TestResult {
        /// Mutant active while the test ran; `None` for unmutated runs.
        #[serde(default)]
        mutant: Option<MutantId>,
        /// Test id.
        test: TestId,
        /// Pass/fail.
        passed: bool,
        /// Elapsed milliseconds.
        elapsed_ms: u64,
        /// Failure detail.
        #[serde(default)]
        message: Option<String>,
    },
    /// Mutants executed while `test` ran.
    Coverage {
        /// Test id.
        test: TestId,
        /// Mutants hit.
        mutants: Vec<MutantId>,
    },
    /// Mutants executed outside of any test.
    StaticCoverage {
        /// Mutants hit.
        mutants: Vec<MutantId>,
    },
    /// A run finished, either normally or after [`ControlMessage::StopMutant`].
    RunCompleted {
        /// Mutant the run was for; `None` for unmutated runs.
        #[serde(default)]
        mutant: Option<MutantId>,
    },
}

impl HostMessage {
    /// Parse one channel payload.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Host-side end of the channel, for test hosts written in Rust.
#[derive(Debug)]
pub struct HostClient {
    channel: FramedChannel,
    inbox: Inbox,
}

impl HostClient {
    /// Wrap an established channel.
    pub fn new(channel: FramedChannel, inbox: Inbox) -> Self {
        Self { channel, inbox }
    }

    /// Connect to the socket named by [`PIPE_ENV`].
    #[cfg(unix)]
    pub async fn connect_from_env(timeout: Duration) -> Result<Self, ChannelError> {
        let path = std::env::var_os(PIPE_ENV).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("{PIPE_ENV} is not set"))
        })?;
        let (channel, inbox) =
            FramedChannel::connect(std::path::Path::new(&path), timeout).await?;
        Ok(Self::new(channel, inbox))
    }

    /// Next orchestrator command; `None` once the orchestrator is gone. Undecodable
    /// payloads are skipped.
    pub async fn next_command(&mut self) -> Option<ControlMessage> {
        loop {
            let text = self.inbox.recv().await?;
            match serde_json::from_str(&text) {
                Ok(command) => return Some(command),
                Err(err) => tracing::warn!(%err, "ignoring undecodable control message"),
            }
        }
    }

    /// Send one host message.
    pub async fn send(&self, message: &HostMessage) -> Result<(), ChannelError> {
        let text = serde_json::to_string(message).map_err(std::io::Error::other)?;
        self.channel.send(&text).await
    }

    /// Close the channel.
    pub async fn close(&self) {
        self.channel.close().await;
    }
}

//! Process-backed [`TestRunner`]: one test host per operation, driven over a framed channel.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::channel::{ChannelError, FramedChannel, Inbox};
use super::config::OrchestratorConfig;
use super::mutant::{Mutant, TestCoverageInfos};
use super::protocol::{ControlMessage, HostMessage, PIPE_ENV, TestSelection};
use super::result::TestRunResult;
use super::runner::{
    BatchRunResult, CoverageCapture, PlannedMutant, RunnerError, TestRunner, TestUpdate,
    TestUpdateHandler,
};
use super::testset::{TestId, TestSet, TestsGuidList};

static SOCKET_SEQUENCE: AtomicU64 = AtomicU64::new(0);

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How to launch a test host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCommand {
    /// Executable.
    pub program: PathBuf,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, defaults to the current one.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl HostCommand {
    /// Launch `program` without arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Append arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Default)]
struct RunTally {
    executed: TestsGuidList,
    failing: TestsGuidList,
    durations: BTreeMap<TestId, Duration>,
    failures: Vec<String>,
}

impl RunTally {
    fn record(&mut self, test: TestId, passed: bool, elapsed_ms: u64, message: Option<String>) {
        self.executed.insert(test);
        self.durations.insert(test, Duration::from_millis(elapsed_ms));
        if !passed {
            self.failing.insert(test);
            self.failures
                .push(message.unwrap_or_else(|| format!("test {test} failed")));
        }
    }

    fn finish(self, elapsed: Duration, total_tests: usize) -> TestRunResult {
        let result = if self.failing.is_empty() {
            TestRunResult::passed(self.executed, elapsed, total_tests)
        } else {
            TestRunResult::failed(
                self.executed,
                self.failing,
                self.failures.join("\n"),
                elapsed,
                total_tests,
            )
        };
        result.with_test_durations(self.durations)
    }
}

enum Next {
    Message(HostMessage),
    Closed,
    TimedOut,
}

/// One connected host: its channel, and its process when this side launched it.
#[derive(Debug)]
pub struct HostSession {
    label: String,
    channel: FramedChannel,
    inbox: Inbox,
    child: Option<Child>,
    #[cfg(unix)]
    _listener: Option<super::channel::ChannelListener>,
}

impl HostSession {
    /// Session over an already connected channel (in-process hosts, tests).
    pub fn from_channel(label: impl Into<String>, channel: FramedChannel, inbox: Inbox) -> Self {
        Self {
            label: label.into(),
            channel,
            inbox,
            child: None,
            #[cfg(unix)]
            _listener: None,
        }
    }

    async fn command(&self, message: &ControlMessage) -> Result<(), RunnerError> {
        let text = serde_json::to_string(message)
            .map_err(|err| RunnerError::Protocol(err.to_string()))?;
        self.channel.send(&text).await?;
        Ok(())
    }

    async fn next_message(&mut self, deadline: Option<Instant>) -> Next {
        loop {
            let received = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.inbox.recv()).await
                {
                    Ok(received) => received,
                    Err(_) => return Next::TimedOut,
                },
                None => self.inbox.recv().await,
            };
            let Some(text) = received else {
                return Next::Closed;
            };
            match HostMessage::parse(&text) {
                Ok(message) => return Next::Message(message),
                Err(err) => warn!(host = %self.label, %err, "ignoring undecodable host message"),
            }
        }
    }

    /// Ask the host for its tests.
    pub async fn discover(&mut self, ceiling: Option<Duration>) -> Result<TestSet, RunnerError> {
        self.command(&ControlMessage::Discover).await?;
        let deadline = ceiling.map(|c| Instant::now() + c);
        loop {
            match self.next_message(deadline).await {
                Next::Message(HostMessage::Discovered { tests }) => {
                    return Ok(tests.into_iter().collect());
                }
                Next::Message(other) => {
                    debug!(host = %self.label, ?other, "ignoring message while discovering");
                }
                Next::Closed => {
                    return Err(RunnerError::HostCrashed(
                        "channel closed during discovery".to_string(),
                    ));
                }
                Next::TimedOut => {
                    return Err(RunnerError::Timeout(ceiling.unwrap_or_default()));
                }
            }
        }
    }

    /// Run the whole suite unmutated, optionally collecting coverage.
    pub async fn run_unmutated(
        &mut self,
        tests: &TestSet,
        capture_coverage: bool,
        ceiling: Option<Duration>,
    ) -> Result<CoverageCapture, RunnerError> {
        self.command(&ControlMessage::Run {
            mutant: None,
            tests: TestSelection::All,
            capture_coverage,
        })
        .await?;

        let started = Instant::now();
        let deadline = ceiling.map(|c| started + c);
        let mut tally = RunTally::default();
        let mut coverage = TestCoverageInfos::new();
        loop {
            match self.next_message(deadline).await {
                Next::Message(HostMessage::TestResult {
                    mutant: None,
                    test,
                    passed,
                    elapsed_ms,
                    message,
                }) => tally.record(test, passed, elapsed_ms, message),
                Next::Message(HostMessage::Coverage { test, mutants }) => {
                    coverage.record_test(test, mutants);
                }
                Next::Message(HostMessage::StaticCoverage { mutants }) => {
                    coverage.record_static(mutants);
                }
                Next::Message(HostMessage::RunCompleted { mutant: None }) => break,
                Next::Message(other) => {
                    debug!(host = %self.label, ?other, "ignoring message during unmutated run");
                }
                Next::Closed => {
                    return Err(RunnerError::HostCrashed(
                        "channel closed during unmutated run".to_string(),
                    ));
                }
                Next::TimedOut => {
                    return Err(RunnerError::Timeout(ceiling.unwrap_or_default()));
                }
            }
        }

        Ok(CoverageCapture {
            result: tally.finish(started.elapsed(), tests.len()),
            coverage,
        })
    }

    /// Run each planned mutant in turn.
    ///
    /// A mutant that misses its deadline is recorded as timed out and the host is killed;
    /// mutants after it are left out of the result.
    pub async fn run_batch(
        &mut self,
        tests: &TestSet,
        batch: &[PlannedMutant],
        handler: &dyn TestUpdateHandler,
    ) -> Result<BatchRunResult, RunnerError> {
        let mut out = BatchRunResult::default();

        'mutants: for planned in batch {
            if planned.mutant.is_resolved() {
                continue;
            }
            let id = planned.mutant.id();
            let active = [id];
            if let Err(err) = self
                .command(&ControlMessage::Run {
                    mutant: Some(id),
                    tests: TestSelection::from(&planned.tests),
                    capture_coverage: false,
                })
                .await
            {
                return self.host_failure(out, err.to_string());
            }

            let started = Instant::now();
            let deadline = started + planned.timeout;
            let mut tally = RunTally::default();
            let mut stopped = false;
            loop {
                match self.next_message(Some(deadline)).await {
                    Next::Message(HostMessage::TestResult {
                        mutant: Some(mutant),
                        test,
                        passed,
                        elapsed_ms,
                        message,
                    }) if mutant == id => {
                        tally.record(test, passed, elapsed_ms, message);
                        let none = TestsGuidList::no_test();
                        let wanted = handler.on_update(TestUpdate {
                            mutants: &active,
                            failing: &tally.failing,
                            executed: &tally.executed,
                            timed_out: &none,
                        });
                        let finished = tally.executed.is_included(&planned.tests, tests);
                        if !wanted && !stopped && !finished {
                            stopped = true;
                            debug!(host = %self.label, mutant = %id, "mutant resolved early; stopping its tests");
                            if let Err(err) =
                                self.command(&ControlMessage::StopMutant { mutant: id }).await
                            {
                                return self.host_failure(out, err.to_string());
                            }
                        }
                    }
                    Next::Message(HostMessage::RunCompleted {
                        mutant: Some(mutant),
                    }) if mutant == id => {
                        out.results
                            .insert(id, tally.finish(started.elapsed(), tests.len()));
                        continue 'mutants;
                    }
                    Next::Message(other) => {
                        debug!(
                            host = %self.label,
                            mutant = %id,
                            ?other,
                            "ignoring message outside the active mutant run"
                        );
                    }
                    Next::TimedOut => {
                        let executed_ids = tally.executed.resolve(tests);
                        let still_running = TestsGuidList::from_ids(
                            planned
                                .tests
                                .resolve(tests)
                                .into_iter()
                                .filter(|t| !executed_ids.contains(t)),
                        );
                        handler.on_update(TestUpdate {
                            mutants: &active,
                            failing: &tally.failing,
                            executed: &tally.executed,
                            timed_out: &still_running,
                        });
                        warn!(
                            host = %self.label,
                            mutant = %id,
                            timeout = ?planned.timeout,
                            "mutant run timed out; killing host"
                        );
                        out.results.insert(
                            id,
                            TestRunResult::timed_out(
                                tally.executed,
                                tally.failing,
                                still_running,
                                started.elapsed(),
                                tests.len(),
                            ),
                        );
                        self.kill().await;
                        return Ok(out);
                    }
                    Next::Closed => {
                        return self.host_failure(
                            out,
                            format!("channel closed while mutant {id} was running"),
                        );
                    }
                }
            }
        }

        Ok(out)
    }

    fn host_failure(
        &self,
        mut out: BatchRunResult,
        message: String,
    ) -> Result<BatchRunResult, RunnerError> {
        if out.results.is_empty() {
            return Err(RunnerError::HostCrashed(message));
        }
        warn!(host = %self.label, %message, "host failed part-way through batch");
        out.host_error = Some(message);
        Ok(out)
    }

    async fn kill(&mut self) {
        self.channel.close().await;
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// Ask the host to exit and reap it.
    pub async fn shutdown(mut self) {
        let _ = self.command(&ControlMessage::Shutdown).await;
        self.channel.close().await;
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(host = %self.label, %status, "host exited"),
                Ok(Err(err)) => debug!(host = %self.label, %err, "waiting for host failed"),
                Err(_) => {
                    warn!(host = %self.label, "host ignored shutdown; killing it");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

/// Launches a [`HostCommand`] per operation and talks to it over a Unix socket.
#[derive(Debug, Clone)]
pub struct HostTestRunner {
    command: Arc<HostCommand>,
    socket_dir: PathBuf,
    connect_timeout: Duration,
    connect_attempts: u32,
    ceiling: Option<Duration>,
}

impl HostTestRunner {
    /// Runner for `command` using the connection settings of `config`.
    pub fn new(command: HostCommand, config: &OrchestratorConfig) -> Self {
        Self {
            command: Arc::new(command),
            socket_dir: std::env::temp_dir(),
            connect_timeout: config.connect_timeout(),
            connect_attempts: config.connect_attempts.max(1),
            ceiling: config.initial_run_ceiling(),
        }
    }

    /// Place sockets under `dir` instead of the system temp directory.
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    #[cfg(unix)]
    async fn open_session(&self, label: String) -> Result<HostSession, RunnerError> {
        use super::channel::ChannelListener;

        let mut last_error = None;
        for attempt in 1..=self.connect_attempts {
            let seq = SOCKET_SEQUENCE.fetch_add(1, Ordering::SeqCst);
            let path = self
                .socket_dir
                .join(format!("kitchensink-{}-{seq}.sock", std::process::id()));
            let listener = ChannelListener::bind(&path)?;

            let mut cmd = tokio::process::Command::new(&self.command.program);
            cmd.args(&self.command.args)
                .envs(&self.command.env)
                .env(PIPE_ENV, &path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::inherit())
                .kill_on_drop(true);
            if let Some(dir) = &self.command.working_dir {
                cmd.current_dir(dir);
            }
            let mut child = cmd.spawn().map_err(RunnerError::Spawn)?;

            let accepted = tokio::select! {
                accepted = listener.accept(self.connect_timeout) => accepted,
                status = child.wait() => {
                    let detail = match status {
                        Ok(status) => format!("host exited with {status} before connecting"),
                        Err(err) => format!("host vanished before connecting: {err}"),
                    };
                    return Err(RunnerError::HostCrashed(detail));
                }
            };

            match accepted {
                Ok((channel, inbox)) => {
                    debug!(host = %label, attempt, "host connected");
                    return Ok(HostSession {
                        label,
                        channel,
                        inbox,
                        child: Some(child),
                        _listener: Some(listener),
                    });
                }
                Err(err @ ChannelError::ConnectTimeout { .. }) => {
                    warn!(host = %label, attempt, %err, "host did not connect in time");
                    let _ = child.kill().await;
                    last_error = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(RunnerError::ConnectTimeout {
            attempts: self.connect_attempts,
            source: last_error.unwrap_or(ChannelError::Closed),
        })
    }

    #[cfg(not(unix))]
    async fn open_session(&self, _label: String) -> Result<HostSession, RunnerError> {
        Err(RunnerError::Spawn(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "process test hosts need Unix domain sockets",
        )))
    }
}

impl TestRunner for HostTestRunner {
    async fn discover_tests(&self) -> Result<TestSet, RunnerError> {
        let mut session = self.open_session("discovery".to_string()).await?;
        let discovered = session.discover(self.ceiling).await;
        session.shutdown().await;
        let tests = discovered?;
        info!(tests = tests.len(), "tests discovered");
        Ok(tests)
    }

    async fn run_baseline(&self, tests: &TestSet) -> Result<TestRunResult, RunnerError> {
        let mut session = self.open_session("baseline".to_string()).await?;
        let run = session.run_unmutated(tests, false, self.ceiling).await;
        session.shutdown().await;
        Ok(run?.result)
    }

    async fn capture_coverage(
        &self,
        tests: &TestSet,
        mutants: &[Arc<Mutant>],
    ) -> Result<CoverageCapture, RunnerError> {
        let mut session = self.open_session("coverage".to_string()).await?;
        let run = session.run_unmutated(tests, true, self.ceiling).await;
        session.shutdown().await;
        let capture = run?;
        debug!(
            mutants = mutants.len(),
            covered = capture.coverage.covered_mutants(),
            "coverage captured"
        );
        Ok(capture)
    }

    async fn run_batch(
        &self,
        slot: usize,
        tests: &TestSet,
        batch: &[PlannedMutant],
        handler: &dyn TestUpdateHandler,
    ) -> Result<BatchRunResult, RunnerError> {
        let mut session = self.open_session(format!("slot-{slot}")).await?;
        let outcome = session.run_batch(tests, batch, handler).await;
        session.shutdown().await;
        outcome
    }
}

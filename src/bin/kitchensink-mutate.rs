use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use kitchensink_mutants::mutation::{
    CancelToken, CoverageMode, HostCommand, HostTestRunner, Journal, MutantDefinition,
    MutationOrchestrator, OrchestratorConfig, RunSummary,
};

#[derive(Debug, Parser)]
#[command(name = "kitchensink-mutate")]
#[command(about = "Run externally generated mutants against a test host")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Test every mutant of a mutant list and write the status report.
    Run {
        /// JSON array of mutants (`id`, `label`, `file`, `line`, `column`).
        #[arg(long)]
        mutants: PathBuf,
        /// Test host executable.
        #[arg(long)]
        host: PathBuf,
        /// Argument passed to the host; repeatable.
        #[arg(long = "host-arg", allow_hyphen_values = true)]
        host_args: Vec<String>,
        /// Number of hosts running at once.
        #[arg(long)]
        concurrency: Option<usize>,
        /// Coverage capture mode.
        #[arg(long, value_enum, default_value = "per-test")]
        coverage: CoverageArg,
        /// Session journal; earlier results recorded there are not re-run.
        #[arg(long)]
        journal: Option<PathBuf>,
        /// Ignore statuses recorded in the journal.
        #[arg(long)]
        retest_all: bool,
        /// Write the report here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Summarize the statuses recorded in a journal.
    Status {
        /// Session journal.
        #[arg(long)]
        journal: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CoverageArg {
    /// Run every test against every mutant.
    Off,
    /// Run only covering tests.
    PerTest,
}

impl From<CoverageArg> for CoverageMode {
    fn from(arg: CoverageArg) -> Self {
        match arg {
            CoverageArg::Off => CoverageMode::Off,
            CoverageArg::PerTest => CoverageMode::PerTest,
        }
    }
}

const EXIT_INTERRUPTED: u8 = 130;

fn load_mutants(path: &Path) -> Result<Vec<MutantDefinition>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read mutant list {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse mutant list {}", path.display()))
}

fn install_ctrlc(cancel: CancelToken) -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("kitchensink-mutate: interrupt received; stopping test hosts");
        cancel.cancel();
    })
    .context("failed to install Ctrl-C handler")
}

async fn run(command: Command) -> Result<ExitCode> {
    match command {
        Command::Run {
            mutants,
            host,
            host_args,
            concurrency,
            coverage,
            journal,
            retest_all,
            output,
        } => {
            let mut config = OrchestratorConfig::default()
                .with_env_overrides()
                .with_coverage(coverage.into())
                .with_retest_all(retest_all);
            if let Some(concurrency) = concurrency {
                config = config.with_concurrency(concurrency);
            }
            if let Some(journal) = journal {
                config = config.with_journal_path(journal);
            }

            let mutants: Vec<_> = load_mutants(&mutants)?
                .into_iter()
                .map(|def| def.into_mutant().shared())
                .collect();
            let runner = HostTestRunner::new(HostCommand::new(host).with_args(host_args), &config);
            let mut orchestrator = MutationOrchestrator::new(runner, config);
            install_ctrlc(orchestrator.cancel_token())?;

            let report = orchestrator.run_session(&mutants).await?;
            let json = report.to_json_pretty()?;
            match output {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("failed to write report {}", path.display()))?,
                None => println!("{json}"),
            }

            let summary = &report.summary;
            eprintln!(
                "summary: killed={}, survived={}, timeout={}, no_coverage={}, runtime_error={}, mutation_score={:.2}%",
                summary.killed,
                summary.survived,
                summary.timeout,
                summary.no_coverage,
                summary.runtime_error,
                summary.mutation_score
            );
            if report.interrupted {
                return Ok(ExitCode::from(EXIT_INTERRUPTED));
            }
        }
        Command::Status { journal } => {
            let snapshot = Journal::open(journal).replay()?;
            let summary = RunSummary::from_statuses(snapshot.outcomes.values().map(|o| o.status));
            println!("sessions: {}", snapshot.sessions.len());
            println!("completed: {}", snapshot.completed);
            println!("interrupted: {}", snapshot.interrupted);
            println!("malformed_lines: {}", snapshot.malformed_lines);
            println!(
                "summary: killed={}, survived={}, timeout={}, no_coverage={}, runtime_error={}, mutation_score={:.2}%",
                summary.killed,
                summary.survived,
                summary.timeout,
                summary.no_coverage,
                summary.runtime_error,
                summary.mutation_score
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("kitchensink-mutate: {err:#}");
            ExitCode::FAILURE
        }
    }
}

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use concolic_explore::selection::SelectionPolicy;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "concolic")]
#[command(about = "Round-based concolic test generation driven by an external oracle")]
#[command(version)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate test cases for the project in PROJECT_DIR.
    Run(RunArgs),
    /// Re-execute a finished run against a coverage build and write a CSV.
    Replay(ReplayArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Directory holding `concolic.toml` and the instrumented target.
    pub project_dir: PathBuf,

    /// Seed input: JSON (`{"args": [...]}` or `["a", "b"]`) or `@file.json`.
    /// Repeatable.
    #[arg(long = "seed", required_unless_present = "resume", conflicts_with = "resume")]
    pub seeds: Vec<String>,

    /// Continue the run stored in this directory.
    #[arg(long, value_name = "RUN_DIR")]
    pub resume: Option<PathBuf>,

    /// Directory for the new run's state.
    #[arg(long, required_unless_present = "resume", conflicts_with = "resume")]
    pub out: Option<PathBuf>,

    /// Rounds to run in this session.
    #[arg(long)]
    pub rounds: Option<u64>,

    #[arg(long)]
    pub selection: Option<SelectionPolicy>,

    /// Per-execution timeout in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Stop once coverage has not grown for this many seconds.
    #[arg(long, value_name = "SECS")]
    pub plateau_slot: Option<u64>,

    /// Expansions per round.
    #[arg(long)]
    pub parallel_num: Option<usize>,

    /// Wall-clock cap for the session in seconds.
    #[arg(long, value_name = "SECS")]
    pub overall_timeout: Option<u64>,

    /// Stop once cumulative oracle cost reaches this many units.
    #[arg(long, value_name = "UNITS")]
    pub max_cost: Option<f64>,

    #[arg(long)]
    pub rng_seed: Option<u64>,

    /// Oracle program and its arguments; takes the rest of the command line.
    #[arg(long, required = true, num_args = 1.., allow_hyphen_values = true, value_name = "CMD")]
    pub oracle_cmd: Vec<String>,
}

#[derive(Args)]
pub struct ReplayArgs {
    /// Run directory written by `concolic run`.
    pub run_dir: PathBuf,
    /// Project directory with the coverage-instrumented build.
    pub project_dir: PathBuf,
    /// CSV file to write.
    pub output_csv: PathBuf,

    /// Coverage script printing `l_per,l_abs,b_per,b_abs,hits`.
    #[arg(long)]
    pub cov_script: Option<PathBuf>,

    /// Per-execution timeout in seconds.
    #[arg(long, value_name = "SECS", default_value_t = concolic_core::replay::DEFAULT_REPLAY_TIMEOUT_SECS)]
    pub timeout: u64,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: cannot start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Command::Run(args) => commands::run::execute(args).await,
            Command::Replay(args) => commands::replay::execute(args).await,
        }
    });

    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

//! Command-line parsing and dispatch for the `covis` operator tool.

use std::io;
use std::time::Duration;

use anyhow::anyhow;
use clap::{Args, Parser, Subcommand, ValueEnum};
use covis_app::{Services, spawn_event_log};
use covis_app::bootstrap::logging_config;
use covis_config::{ConfigLoader, Settings};
use tracing::debug;
use url::Url;

use crate::commands::dump::handle_dump;
use crate::commands::process::handle_process;
use crate::commands::rezip::{handle_queue_rezip, validate_hosts};
use crate::error::{CliError, CliResult};

const EVENT_LOG_GRACE: Duration = Duration::from_secs(2);

/// Parses CLI arguments, executes the requested command, and reports errors.
/// Returns the process exit code.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {}", err.display_message());
            err.exit_code()
        }
    }
}

async fn execute(cli: Cli) -> CliResult<()> {
    let settings = ConfigLoader::new()
        .load()
        .map_err(|err| CliError::validation(format!("{:#}", anyhow!(err))))?;
    let settings = apply_overrides(settings, &cli.global)?;
    covis_telemetry::init_logging(&logging_config(&settings, "covis"))
        .map_err(CliError::failure)?;

    preflight(&cli.command, &settings)?;
    let services = Services::connect(settings).await?;
    let event_log = spawn_event_log(services.dispatcher().events());
    let result = dispatch(cli.command, &services, cli.global.output, &mut io::stdout()).await;
    drop(services);
    if tokio::time::timeout(EVENT_LOG_GRACE, event_log).await.is_err() {
        debug!("event log still draining at exit");
    }
    result
}

/// Checks that need no collaborator and must fail before any is contacted.
pub(crate) fn preflight(command: &Command, settings: &Settings) -> CliResult<()> {
    match command {
        Command::QueueRezip(args) => validate_hosts(args, &settings.host_registry()),
        Command::Process(_) | Command::Dump => Ok(()),
    }
}

pub(crate) async fn dispatch<W: io::Write + Send>(
    command: Command,
    services: &Services,
    format: OutputFormat,
    out: &mut W,
) -> CliResult<()> {
    match command {
        Command::QueueRezip(args) => handle_queue_rezip(services, &args, format, out).await,
        Command::Process(args) => handle_process(services, &args, format, out).await,
        Command::Dump => handle_dump(services, out).await,
    }
}

/// Apply `--dbhost` and `--log` on top of the loaded settings.
pub(crate) fn apply_overrides(mut settings: Settings, global: &GlobalArgs) -> CliResult<Settings> {
    if let Some(host) = &global.dbhost {
        settings.database_url = with_database_host(&settings.database_url, host)?;
    }
    if let Some(level) = &global.log {
        settings.logging.level.clone_from(level);
    }
    Ok(settings)
}

fn with_database_host(database_url: &str, host: &str) -> CliResult<String> {
    let mut url = Url::parse(database_url).map_err(|err| {
        CliError::validation(format!("database URL '{database_url}' is invalid: {err}"))
    })?;
    url.set_host(Some(host))
        .map_err(|err| CliError::validation(format!("database host '{host}' is invalid: {err}")))?;
    Ok(url.to_string())
}

#[derive(Parser)]
#[command(name = "covis", about = "Operator CLI for COVIS run relocation and processing")]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) global: GlobalArgs,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Args, Debug, Default)]
pub(crate) struct GlobalArgs {
    #[arg(long, global = true, help = "Catalog database host, replacing the configured one")]
    pub(crate) dbhost: Option<String>,
    #[arg(long, global = true, value_name = "LEVEL", help = "Log level directive")]
    pub(crate) log: Option<String>,
    #[arg(
        long = "output",
        alias = "format",
        global = true,
        value_enum,
        default_value_t = OutputFormat::Table,
        help = "Select output format for commands that render structured data"
    )]
    pub(crate) output: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Queue relocation of runs missing from the destination host.
    QueueRezip(QueueRezipArgs),
    /// Submit one processing job.
    Process(ProcessArgs),
    /// Print the catalog as JSON, oldest run first.
    Dump,
}

#[derive(Args, Debug)]
pub(crate) struct QueueRezipArgs {
    #[arg(long = "dest-host", default_value = "COVIS-NAS")]
    pub(crate) dest_host: String,
    #[arg(long, default_value_t = 0, help = "Relocate at most this many runs; 0 means all")]
    pub(crate) count: usize,
    #[arg(long = "dry-run", conflicts_with = "run_local")]
    pub(crate) dry_run: bool,
    #[arg(long = "run-local", help = "Relocate in this process instead of queueing")]
    pub(crate) run_local: bool,
    #[arg(
        long = "skip-sole-source",
        value_name = "HOST",
        help = "Skip runs whose only copy is on HOST"
    )]
    pub(crate) skip_sole_source: Option<String>,
    #[arg(
        long = "skip-dmas",
        conflicts_with = "skip_sole_source",
        help = "Same as --skip-sole-source DMAS"
    )]
    pub(crate) skip_dmas: bool,
    #[arg(long = "catalog-sample", help = "Let the catalog draw the --count sample")]
    pub(crate) catalog_sample: bool,
    #[arg(long, help = "Seed for reproducible sampling")]
    pub(crate) seed: Option<u64>,
}

#[derive(Args, Debug)]
pub(crate) struct ProcessArgs {
    /// Input: local path, `s3://bucket/key`, or `db://basename`.
    pub(crate) input: String,
    /// Output: local directory or `s3://bucket/prefix`.
    pub(crate) output: String,
    #[arg(long = "run-local", help = "Process in this process instead of queueing")]
    pub(crate) run_local: bool,
}

#[derive(Copy, Clone, Debug, Default, ValueEnum, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    #[default]
    Table,
    Json,
}

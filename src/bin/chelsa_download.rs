use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use chelsa_download::app::{App, DownloadOptions};
use chelsa_download::config::ConfigLoader;
use chelsa_download::domain::{Kind, Variable};
use chelsa_download::error::ChelsaError;
use chelsa_download::orchestrator::{CancelFlag, RunSummary};
use chelsa_download::output::{self, JsonOutput, LogSink, OutputMode};
use chelsa_download::tui::Tui;

const EXIT_ENTRIES_FAILED: u8 = 4;

#[derive(Parser)]
#[command(name = "chelsa-download")]
#[command(about = "Prepare CHELSA file lists and download AOI-clipped rasters")]
#[command(version, author)]
struct Cli {
    /// Config file (default: $CHELSA_DOWNLOAD_CONFIG or ~/.chelsa-download.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, short, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[arg(long, short, global = true)]
    verbose: bool,

    /// Print JSON results instead of the dashboard
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Build per-variable list files and metadata from a remote listing")]
    PrepareLists(PrepareArgs),
    #[command(about = "Download and clip CHELSA-TraCE21k files")]
    DownloadTrace(DownloadArgs),
    #[command(about = "Download and clip CHELSA v2.1 present-day files")]
    DownloadPresent(DownloadArgs),
    #[command(about = "Show prepared lists and whether they are fresh")]
    ListVars(KindArgs),
}

#[derive(Args)]
struct PrepareArgs {
    #[arg(long, value_enum)]
    kind: Kind,

    /// Listing document (rclone lsjson output) instead of a live listing
    #[arg(long)]
    source_json: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct KindArgs {
    #[arg(long, value_enum)]
    kind: Kind,
}

#[derive(Args)]
struct DownloadArgs {
    /// Restrict to a variable (repeatable), e.g. bio01 or pr
    #[arg(long = "var")]
    variables: Vec<Variable>,

    /// Maximum number of entries across all selected lists
    #[arg(long)]
    limit: Option<usize>,

    /// Re-download and overwrite existing outputs
    #[arg(long)]
    force: bool,

    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    max_workers: Option<u16>,

    /// Proceed with lists whose digest or count no longer matches
    #[arg(long)]
    allow_stale: bool,
}

impl DownloadArgs {
    fn options(self) -> DownloadOptions {
        DownloadOptions {
            variables: self.variables,
            limit: self.limit,
            force: self.force,
            max_workers: self.max_workers.map(usize::from),
            allow_stale: self.allow_stale,
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<ChelsaError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &ChelsaError) -> u8 {
    match error {
        ChelsaError::MissingConfig(_)
        | ChelsaError::ConfigRead(_)
        | ChelsaError::ConfigParse(_)
        | ChelsaError::Configuration(_)
        | ChelsaError::InvalidKind(_)
        | ChelsaError::InvalidVariable(_)
        | ChelsaError::NoLists { .. }
        | ChelsaError::MetadataMissing(_)
        | ChelsaError::MetadataParse { .. }
        | ChelsaError::StaleManifest { .. }
        | ChelsaError::Aoi { .. }
        | ChelsaError::UnsupportedCrs { .. }
        | ChelsaError::Reprojection(_) => 2,
        ChelsaError::MissingTool(_) | ChelsaError::Listing(_) | ChelsaError::HttpSetup(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    let cli = Cli::parse();
    let output_mode = if cli.non_interactive || !std::io::stdout().is_terminal() {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    init_tracing(&cli, output_mode);

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let app = App::new(config);

    match cli.command {
        Commands::PrepareLists(args) => {
            let report = app.prepare_lists(args.kind, args.source_json.as_deref(), &LogSink)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_report(&report).into_diagnostic()?,
                OutputMode::Interactive => output::print_report_text(&report),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::ListVars(args) => {
            let result = app.list_vars(args.kind)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_list_vars(&result).into_diagnostic()?,
                OutputMode::Interactive => output::print_list_vars_text(&result),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::DownloadTrace(args) => run_download(app, Kind::Trace, args.options(), output_mode),
        Commands::DownloadPresent(args) => {
            run_download(app, Kind::Present, args.options(), output_mode)
        }
    }
}

fn init_tracing(cli: &Cli, output_mode: OutputMode) {
    let default_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else if matches!(output_mode, OutputMode::Interactive)
        && matches!(
            cli.command,
            Commands::DownloadTrace(_) | Commands::DownloadPresent(_)
        )
    {
        // The dashboard owns the terminal; only errors go to stderr.
        "error"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_download(
    app: App,
    kind: Kind,
    options: DownloadOptions,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        eprintln!("interrupt received, finishing active entries...");
        handler_flag.cancel();
    }) {
        warn!("failed to install interrupt handler: {err}");
    }

    let summary = match output_mode {
        OutputMode::NonInteractive => {
            let summary = app.download(kind, &options, cancel, &LogSink)?;
            JsonOutput::print_summary(&summary).into_diagnostic()?;
            summary
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(&format!("download {kind}"), cancel.clone());
            let summary = tui.run(move |sink| app.download(kind, &options, cancel, sink))?;
            output::print_summary_text(&summary);
            summary
        }
    };
    Ok(exit_code(&summary))
}

fn exit_code(summary: &RunSummary) -> ExitCode {
    if summary.has_failures() {
        ExitCode::from(EXIT_ENTRIES_FAILED)
    } else {
        ExitCode::SUCCESS
    }
}

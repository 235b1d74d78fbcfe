//! tscope - record, inspect and export Tealium utag debugging sessions
//!
//! Drives the tealscope-core relay against a SQLite store in the data
//! directory. Page messages are fed in as JSON lines with `tscope ingest`.

#![forbid(unsafe_code)]

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use tealscope_core::config::{CONFIG_ENV, Config, DATA_DIR_ENV};
use tealscope_core::logging::{LogConfig, init_logging};
use tealscope_core::snapshots::SnapshotKind;

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Plain,
    /// Machine-readable JSON
    Json,
}

#[derive(Parser)]
#[command(name = "tscope")]
#[command(author, version, about = "Record, inspect and export Tealium utag debugging sessions")]
#[command(propagate_version = true)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true, env = CONFIG_ENV, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Data directory holding the session database
    #[arg(long, global = true, env = DATA_DIR_ENV, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Plain)]
    format: OutputFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage recording sessions
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Feed protocol messages (one JSON object per line) through the relay
    Ingest {
        /// Input file, or `-` for stdin
        input: String,

        /// URL of the page the messages came from
        #[arg(long, value_name = "URL")]
        tab_url: Option<String>,
    },

    /// Print the log entries of a session
    Logs {
        /// Session to print (default: current, else last)
        session_id: Option<String>,

        /// Re-sort by the composite order key before printing
        #[arg(long)]
        sorted: bool,
    },

    /// Build a case file
    Export {
        /// Session to export (default: current, else last)
        #[arg(long = "session", value_name = "ID")]
        session_id: Option<String>,

        /// Leave out the log timeline
        #[arg(long)]
        no_logger: bool,

        /// Leave out the consent snapshot
        #[arg(long)]
        no_consent: bool,

        /// Leave out the iQ profile snapshot
        #[arg(long)]
        no_iq: bool,

        /// Strip URL queries/fragments and consent signal values
        #[arg(long)]
        redact: bool,

        /// Write to a file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Deliver a JSON payload to the collector with retry
    Send {
        /// Payload file, or `-` for stdin
        input: String,
    },

    /// Show storage usage against the quota
    Quota {
        /// Run an eviction pass now
        #[arg(long)]
        enforce: bool,
    },

    /// Manage cached tab snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
}

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Start recording (stops any active session first)
    Start {
        /// Session label
        #[arg(long)]
        name: Option<String>,

        /// Page URL being debugged
        #[arg(long)]
        url: Option<String>,
    },
    /// Stop the active session
    Stop,
    /// Show recording state
    Status,
    /// List stored sessions, oldest first
    List,
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Store a snapshot captured elsewhere
    Import {
        /// consent, storage, iq or utag
        kind: SnapshotKind,

        /// JSON file, or `-` for stdin
        input: String,

        /// Tab key to file it under
        #[arg(long, default_value = "tab-0")]
        tab: String,

        /// Page URL the snapshot was taken on
        #[arg(long)]
        url: Option<String>,
    },
}

fn log_config(config: &Config, verbose: u8) -> LogConfig {
    let mut log = LogConfig::from(&config.general);
    match verbose {
        0 => {}
        1 => log.level = "debug".to_string(),
        _ => log.level = "trace".to_string(),
    }
    log
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::resolve(cli.config.as_deref(), None, cli.data_dir.as_deref())
        .context("Failed to load configuration")?;
    init_logging(&log_config(&config, cli.verbose)).context("Failed to initialize logging")?;

    let ctx = commands::Context {
        config,
        format: cli.format,
    };

    match cli.command {
        Commands::Session { command } => commands::session(&ctx, command).await,
        Commands::Ingest { input, tab_url } => commands::ingest(&ctx, &input, tab_url).await,
        Commands::Logs { session_id, sorted } => commands::logs(&ctx, session_id, sorted).await,
        Commands::Export {
            session_id,
            no_logger,
            no_consent,
            no_iq,
            redact,
            output,
        } => {
            let options = tealscope_core::casefile::ExportOptions {
                include_logger: !no_logger,
                include_consent: !no_consent,
                include_iq: !no_iq,
                redact,
                session_id,
            };
            commands::export(&ctx, &options, output.as_deref()).await
        }
        Commands::Send { input } => commands::send(&ctx, &input).await,
        Commands::Quota { enforce } => commands::quota(&ctx, enforce).await,
        Commands::Snapshot { command } => commands::snapshot(&ctx, command).await,
    }
}

fn report_error(err: &anyhow::Error) {
    eprintln!("Error: {err:#}");
    let remediation = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<tealscope_core::Error>())
        .and_then(tealscope_core::Error::remediation)
        .or_else(|| {
            err.chain()
                .find_map(|cause| cause.downcast_ref::<tealscope_core::error::ConfigError>())
                .map(tealscope_core::error::ConfigError::remediation)
        })
        .or_else(|| {
            err.chain()
                .find_map(|cause| cause.downcast_ref::<tealscope_core::error::DispatchError>())
                .map(tealscope_core::error::DispatchError::remediation)
        });
    if let Some(remediation) = remediation {
        eprintln!();
        eprint!("{}", remediation.render_plain());
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

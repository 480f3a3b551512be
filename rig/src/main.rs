//! rig - run commands and copy files across an acceptance-test host
//! inventory.

#![forbid(unsafe_code)]

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rig_common::{LogConfig, init_logging};

#[derive(Parser)]
#[command(name = "rig")]
#[command(author, version, about = "rig - acceptance-test host orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Inventory file (default: ~/.config/rig/hosts.toml)
    #[arg(short, long, global = true, env = "RIG_INVENTORY")]
    inventory: Option<PathBuf>,

    /// Log what would run without touching any host
    #[arg(long, global = true)]
    dry_run: bool,

    /// Print one JSON object per host result on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Which hosts to act on and how.
#[derive(Args, Debug, Clone, Default)]
pub struct HostSelection {
    /// Comma-separated host names (default: every inventory host)
    #[arg(long, value_delimiter = ',')]
    pub hosts: Vec<String>,

    /// Act on every selected host at once
    #[arg(long)]
    pub parallel: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List inventory hosts
    Hosts,

    /// Run a command on hosts
    Exec {
        #[command(flatten)]
        selection: HostSelection,

        /// Accept any exit code
        #[arg(long)]
        accept_all: bool,

        /// Comma-separated exit codes to accept (default: 0)
        #[arg(long, value_delimiter = ',')]
        exit_codes: Vec<i32>,

        /// Environment variable for the command (KEY=VALUE, repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Request a pseudo-terminal
        #[arg(long)]
        pty: bool,

        /// Text piped to the command's stdin
        #[arg(long)]
        stdin: Option<String>,

        /// Command and arguments, after `--`
        #[arg(last = true, required = true, value_name = "CMD")]
        command: Vec<String>,
    },

    /// Copy a local file or directory to hosts
    CopyTo {
        #[command(flatten)]
        selection: HostSelection,

        /// Path component to skip (repeatable)
        #[arg(long)]
        ignore: Vec<String>,

        /// File with one ignore pattern per line (`#` comments)
        #[arg(long)]
        ignore_file: Option<PathBuf>,

        /// Local file or directory
        source: PathBuf,

        /// Remote destination
        target: String,
    },

    /// Copy a remote file or directory from hosts
    CopyFrom {
        #[command(flatten)]
        selection: HostSelection,

        /// Remote file or directory
        source: String,

        /// Local directory to copy into
        target_dir: PathBuf,
    },

    /// Check that hosts accept commands
    Probe {
        #[command(flatten)]
        selection: HostSelection,
    },
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let inventory = commands::load_inventory(cli.inventory.as_deref(), cli.dry_run)?;

    match cli.command {
        Commands::Hosts => commands::list_hosts(&inventory),
        Commands::Exec {
            selection,
            accept_all,
            exit_codes,
            env,
            pty,
            stdin,
            command,
        } => {
            let request = commands::ExecArgs {
                accept_all,
                exit_codes,
                env,
                pty,
                stdin,
                command,
            };
            commands::exec(&inventory, &selection, &request, cli.json).await
        }
        Commands::CopyTo {
            selection,
            ignore,
            ignore_file,
            source,
            target,
        } => {
            commands::copy_to(
                &inventory,
                &selection,
                &source,
                &target,
                ignore,
                ignore_file.as_deref(),
                cli.json,
            )
            .await
        }
        Commands::CopyFrom {
            selection,
            source,
            target_dir,
        } => commands::copy_from(&inventory, &selection, &source, &target_dir, cli.json).await,
        Commands::Probe { selection } => commands::probe(&inventory, &selection).await,
    }
}

//! Subcommand implementations.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use colored::Colorize;
use rig_common::config::EnvParser;
use rig_common::util::parse_ignore_file;
use rig_common::{
    Command, CommandResult, ExecOptions, HarnessError, Host, Inventory, Logger, RunMode,
    TracingSink, on_hosts,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::HostSelection;

/// Command-line arguments of `rig exec`.
#[derive(Debug, Clone, Default)]
pub struct ExecArgs {
    pub accept_all: bool,
    pub exit_codes: Vec<i32>,
    pub env: Vec<(String, String)>,
    pub pty: bool,
    pub stdin: Option<String>,
    pub command: Vec<String>,
}

impl ExecArgs {
    fn command(&self) -> Result<Command> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("no command given");
        };
        let command = self
            .env
            .iter()
            .fold(Command::new(program).args(args), |cmd, (key, value)| {
                cmd.env(key, value)
            });
        Ok(command)
    }

    fn options(&self) -> ExecOptions {
        let mut options = ExecOptions::new();
        options.pty = self.pty;
        options.stdin = self.stdin.clone();
        options.accept_all_exit_codes = self.accept_all;
        if !self.exit_codes.is_empty() {
            options = options.acceptable_exit_codes(self.exit_codes.iter().copied());
        }
        options
    }
}

/// Load the inventory and apply `RIG_*` overrides and the `--dry-run` flag.
pub fn load_inventory(path: Option<&Path>, dry_run: bool) -> Result<Inventory> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Inventory::default_path()?,
    };
    let mut inventory = Inventory::load(&path)
        .with_context(|| format!("Failed to load inventory {}", path.display()))?;
    let overrides = inventory
        .options
        .apply_env(&mut EnvParser::new())
        .context("Invalid RIG_* environment")?;
    if !overrides.is_empty() {
        debug!(vars = ?overrides, "environment overrides applied");
    }
    if dry_run {
        inventory.options.dry_run = true;
    }
    debug!(path = %path.display(), hosts = inventory.len(), "inventory ready");
    Ok(inventory)
}

/// Hosts named by `selection`, in inventory order, and how to run them.
fn select_hosts(inventory: &Inventory, selection: &HostSelection) -> Result<(Vec<Host>, RunMode)> {
    let options = Arc::new(inventory.options.clone());
    let logger = Logger::new(Arc::new(TracingSink)).with_color(options.color);
    let hosts: Vec<Host> = inventory
        .select(&selection.hosts)?
        .into_iter()
        .map(|(name, config)| Host::new(name, config, options.clone(), logger.clone()))
        .collect();
    if hosts.is_empty() {
        bail!("No hosts selected; the inventory is empty");
    }
    let mode = if selection.parallel {
        RunMode::Parallel
    } else {
        options.run_mode
    };
    Ok((hosts, mode))
}

async fn close_all(hosts: &mut [Host]) {
    for host in hosts {
        host.close().await;
    }
}

pub fn list_hosts(inventory: &Inventory) -> Result<()> {
    let (hosts, _) = select_hosts(inventory, &HostSelection::default())?;
    println!(
        "{}",
        format!(
            "{:<20} {:<24} {:<14} {:<10} ADDRESS",
            "NAME", "PLATFORM", "FAMILY", "TRANSPORT"
        )
        .bold()
    );
    for host in &hosts {
        let address = host.targets().addresses().join(", ");
        println!(
            "{:<20} {:<24} {:<14} {:<10} {address}",
            host.name(),
            host.platform().name(),
            host.platform().family().to_string(),
            host.transport_kind().to_string(),
        );
    }
    Ok(())
}

pub async fn exec(
    inventory: &Inventory,
    selection: &HostSelection,
    args: &ExecArgs,
    json: bool,
) -> Result<()> {
    let command = args.command()?;
    let options = args.options();
    let (mut hosts, mode) = select_hosts(inventory, selection)?;

    let (command, options) = (&command, &options);
    let outcome = on_hosts(hosts.as_mut_slice(), mode, |host| async move {
        host.exec(command, options).await
    })
    .await;
    close_all(&mut hosts).await;

    let results = outcome.context("Command failed")?;
    report(&results, json)
}

pub async fn copy_to(
    inventory: &Inventory,
    selection: &HostSelection,
    source: &Path,
    target: &str,
    mut ignore: Vec<String>,
    ignore_file: Option<&Path>,
    json: bool,
) -> Result<()> {
    if let Some(file) = ignore_file {
        let patterns = parse_ignore_file(file)
            .with_context(|| format!("Failed to read ignore file {}", file.display()))?;
        ignore.extend(patterns);
    }
    let ignore = (!ignore.is_empty()).then_some(ignore);
    let ignore = ignore.as_deref();
    let (mut hosts, mode) = select_hosts(inventory, selection)?;

    let outcome = on_hosts(hosts.as_mut_slice(), mode, |host| async move {
        host.do_copy_to(source, target, ignore).await
    })
    .await;
    close_all(&mut hosts).await;

    let results = outcome.context("Copy failed")?;
    report(&results, json)
}

pub async fn copy_from(
    inventory: &Inventory,
    selection: &HostSelection,
    source: &str,
    target_dir: &Path,
    json: bool,
) -> Result<()> {
    let (mut hosts, mode) = select_hosts(inventory, selection)?;
    // One subdirectory per host so copies of the same path do not collide.
    let per_host = hosts.len() > 1;

    let outcome = on_hosts(hosts.as_mut_slice(), mode, |host| async move {
        let dir = if per_host {
            target_dir.join(host.name())
        } else {
            target_dir.to_path_buf()
        };
        host.do_copy_from(source, &dir).await
    })
    .await;
    close_all(&mut hosts).await;

    let results = outcome.context("Copy failed")?;
    report(&results, json)
}

pub async fn probe(inventory: &Inventory, selection: &HostSelection) -> Result<()> {
    let (mut hosts, mode) = select_hosts(inventory, selection)?;
    let dry_run = inventory.options.dry_run;

    let outcomes = on_hosts(hosts.as_mut_slice(), mode, |host| async move {
        let result = host
            .exec(&Command::new("echo").arg("ok"), &ExecOptions::new().silent())
            .await;
        Ok::<_, HarnessError>((host.name().to_string(), probe_status(result, dry_run)))
    })
    .await?;
    close_all(&mut hosts).await;

    let mut unreachable = 0;
    for (name, status) in &outcomes {
        match status {
            Ok(note) => println!("{name}: {}", note.green()),
            Err(reason) => {
                unreachable += 1;
                println!("{name}: {} ({reason})", "unreachable".red());
            }
        }
    }
    if unreachable > 0 {
        bail!("{unreachable} of {} host(s) unreachable", outcomes.len());
    }
    Ok(())
}

fn probe_status(
    result: Result<CommandResult, HarnessError>,
    dry_run: bool,
) -> Result<&'static str, String> {
    match result {
        Ok(_) if dry_run => Ok("skipped (dry run)"),
        Ok(result) if result.stdout().trim() == "ok" => Ok("reachable"),
        Ok(result) => Err(format!(
            "unexpected reply {:?}, exit {:?}",
            result.stdout().trim(),
            result.exit_code
        )),
        Err(err) => Err(err.to_string()),
    }
}

/// Per-host outcome printed by `--json`.
#[derive(Debug, Serialize)]
struct ResultSummary<'a> {
    host: &'a str,
    command: &'a str,
    exit_code: Option<i32>,
    stdout: &'a str,
    stderr: &'a str,
}

impl<'a> From<&'a CommandResult> for ResultSummary<'a> {
    fn from(result: &'a CommandResult) -> Self {
        Self {
            host: &result.host,
            command: &result.command,
            exit_code: result.exit_code,
            stdout: result.stdout(),
            stderr: result.stderr(),
        }
    }
}

fn report(results: &[CommandResult], json: bool) -> Result<()> {
    for result in results {
        if json {
            println!("{}", serde_json::to_string(&ResultSummary::from(result))?);
            continue;
        }
        let code = result
            .exit_code
            .map_or_else(|| "none".to_string(), |c| c.to_string());
        info!(host = %result.host, exit_code = %code, "{}", result.command);
    }
    info!("{} host(s) done", results.len());
    Ok(())
}

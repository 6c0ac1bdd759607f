//! Addonhost - operator CLI.
//!
//! Inspects an addon bundle directory without running any addon code.
//!
//! Usage: addonhost [OPTIONS] <COMMAND> [DIR]
//!
//! Commands:
//!   check      Discover, audit and resolve; print states and load order
//!   audit      Print the compliance audit report
//!   resolve    Print the dependency resolution
//!
//! Options:
//!   --config PATH    Use PATH instead of ~/.addonhost/config.toml
//!   --json           Emit JSON instead of text
//!   --version, -v    Show version
//!
//! DIR overrides `addons_dir` from the configuration. Exits with status 1
//! when any addon failed.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use serde::Serialize;

use addonhost::addons::{
    AddonManager, AddonState, AuditReport, DiscoveryReport, EntryPoints, Resolution,
    TokioScheduler,
};
use addonhost::config::HostConfig;
use addonhost::logging;

/// Version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "Usage: addonhost [--config PATH] [--json] <check|audit|resolve> [DIR]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Check,
    Audit,
    Resolve,
}

#[derive(Debug)]
struct Options {
    command: Command,
    config: Option<PathBuf>,
    dir: Option<PathBuf>,
    json: bool,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut command = None;
    let mut config = None;
    let mut dir = None;
    let mut json = false;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => json = true,
            "--config" => {
                let path = iter.next().ok_or("--config requires a path")?;
                config = Some(PathBuf::from(path));
            }
            "check" if command.is_none() => command = Some(Command::Check),
            "audit" if command.is_none() => command = Some(Command::Audit),
            "resolve" if command.is_none() => command = Some(Command::Resolve),
            other if other.starts_with('-') => return Err(format!("unknown option '{}'", other)),
            other if command.is_some() && dir.is_none() => dir = Some(PathBuf::from(other)),
            other => return Err(format!("unexpected argument '{}'", other)),
        }
    }

    Ok(Options {
        command: command.ok_or("missing command")?,
        config,
        dir,
        json,
    })
}

#[derive(Serialize)]
struct CheckOutput<'a> {
    states: BTreeMap<String, AddonState>,
    load_order: &'a [String],
    report: &'a DiscoveryReport,
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-v") {
        println!("addonhost v{}", VERSION);
        return ExitCode::SUCCESS;
    }

    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}\n{}", e, USAGE);
            return ExitCode::from(2);
        }
    };

    match run(&options) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("addonhost: {}", e);
            ExitCode::from(1)
        }
    }
}

/// Runs the command. Returns false when any addon failed.
fn run(options: &Options) -> Result<bool, Box<dyn std::error::Error>> {
    let mut config = match &options.config {
        Some(path) => HostConfig::load_from(path)?,
        None => HostConfig::load()?,
    };
    if let Some(dir) = &options.dir {
        config.addons_dir = dir.clone();
    }

    logging::init(&config.log, &config.data_root, true)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let scheduler = Arc::new(TokioScheduler::new(runtime.handle().clone()));
    let session = config.session_builder(scheduler)?.build();

    let mut manager = AddonManager::new(session, Arc::new(EntryPoints::new()), &config.addons_dir)
        .with_audit_enforcement(config.audit.enforce);
    let report = manager.discover()?;
    let states = manager.session().states().snapshot();

    match (options.command, options.json) {
        (Command::Check, true) => {
            let output = CheckOutput {
                states: states.clone(),
                load_order: manager.load_order(),
                report: &report,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        (Command::Check, false) => print_check(&states, &report),
        (Command::Audit, true) => println!("{}", serde_json::to_string_pretty(&report.audit)?),
        (Command::Audit, false) => print_audit(&report.audit),
        (Command::Resolve, true) => {
            println!("{}", serde_json::to_string_pretty(&report.resolution)?);
        }
        (Command::Resolve, false) => print_resolution(&report.resolution),
    }

    Ok(!states.values().any(|s| *s == AddonState::Failed))
}

fn print_check(states: &BTreeMap<String, AddonState>, report: &DiscoveryReport) {
    println!("Addons ({}):", states.len());
    for (id, state) in states {
        println!("  {:<32} {}", id, state);
    }
    for skipped in &report.skipped {
        println!("  skipped {}: {}", skipped.file, skipped.reason);
    }
    println!();
    print_resolution(&report.resolution);
    let fatal = report.audit.fatal_addons();
    if !fatal.is_empty() {
        println!();
        println!("Audit blocked: {}", fatal.into_iter().collect::<Vec<_>>().join(", "));
    }
}

fn print_audit(audit: &AuditReport) {
    if audit.violations.is_empty() {
        println!("No compliance findings.");
        return;
    }
    for violation in &audit.violations {
        let severity = if violation.kind.is_fatal() { "FATAL" } else { "advisory" };
        println!("[{}] {}", severity, violation);
    }
}

fn print_resolution(resolution: &Resolution) {
    println!("Load order: {}", resolution.order.join(" -> "));
    for (id, failure) in &resolution.failures {
        println!("  failed {}: {}", id, failure);
    }
    for warning in &resolution.warnings {
        println!("  warning {}", warning);
    }
}

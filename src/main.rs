use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod atomic;
mod cache;
mod cli;
mod config;
mod error;
mod invoker;
mod manifest;
mod orchestrator;
mod selector;
mod template;

use cli::{Command, ConfigArgs, ConfigSource, RootArgs, RunArgs};
use config::{
    builtin_config, validate_config, DeployConfig, Profile, CLIENT_ENV, DEFAULT_CLIENT,
    LOCAL_CONFIG_FILE,
};
use invoker::ProcessInvoker;
use orchestrator::{DeployReport, Orchestrator};

fn main() -> Result<()> {
    let args = RootArgs::parse();

    let verbose = matches!(&args.command, Command::Run(run) if run.verbose);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    match args.command {
        Command::Run(args) => cmd_run(args),
        Command::Config(args) => cmd_config(args),
    }
}

fn cmd_run(args: RunArgs) -> Result<()> {
    let (config, origin) = load_config(&args.source)?;
    tracing::info!(%origin, "using deployment config");

    let client = resolve_client(args.client.as_deref(), config.client.as_deref());
    let mut invoker = ProcessInvoker::from_command(&client, &config.json_flag)?;
    let root = match args.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };

    let report = Orchestrator::new(&mut invoker, &root).run(&config)?;
    print_report(&report, args.json)
}

fn cmd_config(args: ConfigArgs) -> Result<()> {
    let (config, _) = load_config(&args.source)?;
    let text = serde_json::to_string_pretty(&config).context("serialize config")?;
    let Some(out) = &args.out else {
        println!("{text}");
        return Ok(());
    };
    if out.exists() && !args.force {
        return Err(anyhow!(
            "{} already exists; pass --force to overwrite",
            out.display()
        ));
    }
    atomic::write_atomic(out, format!("{text}\n").as_bytes())?;
    println!("Wrote config to {}", out.display());
    Ok(())
}

/// Resolve the config: explicit path, built-in profile, local file, user file, default profile.
fn load_config(source: &ConfigSource) -> Result<(DeployConfig, String)> {
    let (config, origin) = if let Some(path) = &source.config {
        (read_config(path)?, path.display().to_string())
    } else if let Some(profile) = source.profile {
        (builtin_config(profile), format!("built-in {profile:?} profile"))
    } else if let Some(path) = discover_config_file() {
        (read_config(&path)?, path.display().to_string())
    } else {
        (builtin_config(Profile::Node), "built-in Node profile".to_string())
    };
    validate_config(&config).with_context(|| format!("validate config from {origin}"))?;
    Ok((config, origin))
}

fn discover_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.is_file() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("chainboot").join("config.json"))
        .filter(|path| path.is_file())
}

fn read_config(path: &Path) -> Result<DeployConfig> {
    let bytes = std::fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse config {}", path.display()))
}

/// Client command with fallback: explicit arg > config > env var > default.
fn resolve_client(explicit: Option<&str>, configured: Option<&str>) -> String {
    explicit
        .or(configured)
        .map(|s| s.to_string())
        .or_else(|| std::env::var(CLIENT_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CLIENT.to_string())
}

fn print_report(report: &DeployReport, json: bool) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(report).context("serialize report")?;
        println!("{text}");
        return Ok(());
    }
    for line in &report.lines {
        println!("{}: {}", line.label, line.value);
    }
    Ok(())
}

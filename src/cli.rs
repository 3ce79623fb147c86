//! CLI argument parsing for the deployment bootstrap.
//!
//! The CLI only picks a config, a client and a root directory; everything a
//! run does is described by the config itself.
use crate::config::Profile;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "chainboot",
    version,
    about = "Publish packages and bootstrap on-chain node state",
    after_help = "Examples:\n  chainboot run\n  chainboot run --profile token-node --root sui/dev\n  chainboot run --config deploy.json --client 'sui client --client.config ./client.yaml'\n  chainboot config --profile token-node --out chainboot.json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Config(ConfigArgs),
}

/// Where the deployment description comes from.
#[derive(Args, Debug, Clone)]
pub struct ConfigSource {
    /// JSON deployment config (defaults to ./chainboot.json, then the user config dir)
    #[arg(long, value_name = "PATH", conflicts_with = "profile")]
    pub config: Option<PathBuf>,

    /// Built-in deployment profile
    #[arg(long, value_enum)]
    pub profile: Option<Profile>,
}

#[derive(Parser, Debug)]
#[command(about = "Publish (or reuse) packages and run the bootstrap steps")]
pub struct RunArgs {
    #[command(flatten)]
    pub source: ConfigSource,

    /// Client command, e.g. "sui client" (overrides config and CHAINBOOT_CLIENT)
    #[arg(long, value_name = "CMD")]
    pub client: Option<String>,

    /// Directory the config's search roots are relative to
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,

    /// Log every step at debug level
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Print or write the effective deployment config")]
pub struct ConfigArgs {
    #[command(flatten)]
    pub source: ConfigSource,

    /// Write the config here instead of stdout
    #[arg(long, value_name = "PATH")]
    pub out: Option<PathBuf>,

    /// Overwrite an existing file at --out
    #[arg(long, requires = "out")]
    pub force: bool,
}

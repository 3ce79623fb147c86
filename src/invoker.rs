//! External client invocation.
//!
//! Every client call runs to completion, requests JSON output, and either
//! yields the decoded document or fails with the captured output attached.
//! Calls are never retried: a mutating call may have landed on chain even
//! when the client reports failure.
use crate::error::{DeployError, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

/// One client call: argument tokens plus an optional working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(args: Vec<String>) -> Self {
        Self { args, cwd: None }
    }

    pub fn in_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// First token, e.g. `publish` or `call`.
    pub fn subcommand(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or_default()
    }
}

/// Seam between the orchestrator and the process that does the work.
pub trait CommandInvoker {
    fn invoke(&mut self, invocation: &Invocation) -> Result<Value>;
}

/// Runs the configured client binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    program: PathBuf,
    prefix: Vec<String>,
    json_flag: String,
    display_prefix: Vec<String>,
}

impl ProcessInvoker {
    /// Resolve `client` (a shell-words command such as `sui client`) on PATH.
    pub fn from_command(client: &str, json_flag: &str) -> Result<Self> {
        let words = shell_words::split(client).map_err(|err| {
            DeployError::InvalidConfig(format!("parse client command `{client}`: {err}"))
        })?;
        let Some((program, prefix)) = words.split_first() else {
            return Err(DeployError::InvalidConfig(
                "client command is empty".to_string(),
            ));
        };
        let resolved = which::which(program).map_err(|source| DeployError::ClientNotFound {
            program: program.clone(),
            source,
        })?;
        Ok(Self {
            program: resolved,
            prefix: prefix.to_vec(),
            json_flag: json_flag.to_string(),
            display_prefix: words,
        })
    }

    fn command_line(&self, invocation: &Invocation) -> String {
        let words = self
            .display_prefix
            .iter()
            .chain(&invocation.args)
            .chain(std::iter::once(&self.json_flag));
        shell_words::join(words)
    }
}

impl CommandInvoker for ProcessInvoker {
    fn invoke(&mut self, invocation: &Invocation) -> Result<Value> {
        let command_line = self.command_line(invocation);
        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix)
            .args(&invocation.args)
            .arg(&self.json_flag);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }

        tracing::info!(
            subcommand = invocation.subcommand(),
            command = %command_line,
            "client call"
        );
        let start = Instant::now();
        let output = command.output().map_err(|source| DeployError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        let elapsed_ms = start.elapsed().as_millis();
        tracing::info!(
            elapsed_ms,
            stdout_bytes = output.stdout.len(),
            success = output.status.success(),
            "client call complete"
        );

        if !output.status.success() {
            return Err(DeployError::ExternalCommand {
                command: command_line,
                status: output.status.to_string(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        // Ids are copied verbatim into later calls, so invalid UTF-8 is rejected, not replaced.
        let stdout = match String::from_utf8(output.stdout) {
            Ok(stdout) => stdout,
            Err(err) => {
                return Err(DeployError::MalformedOutput {
                    command: command_line,
                    stdout: String::from_utf8_lossy(err.as_bytes()).to_string(),
                    source: Box::new(err.utf8_error()),
                });
            }
        };
        serde_json::from_str(&stdout).map_err(|source| DeployError::MalformedOutput {
            command: command_line,
            stdout,
            source: Box::new(source),
        })
    }
}

//! Error taxonomy for a deployment run.
//!
//! Every variant is fatal: the orchestrator never catches and retries, so the
//! variants exist to tell the operator *where* a run stopped.
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("package `{package}` not found; looked in:\n{}", render_candidates(.candidates))]
    SourceNotFound {
        package: String,
        candidates: Vec<PathBuf>,
    },

    #[error("client program `{program}` not found on PATH")]
    ClientNotFound {
        program: String,
        #[source]
        source: which::Error,
    },

    #[error("failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    ExternalCommand {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("`{command}` produced output that is not JSON: {source}\nstdout:\n{stdout}")]
    MalformedOutput {
        command: String,
        stdout: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{context}: output has no `{path}` (missing at `{missing}`)")]
    UnexpectedOutputShape {
        context: String,
        path: String,
        missing: String,
    },

    #[error("cache file {} is not valid JSON; delete it to publish again", .path.display())]
    CacheCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("step `{step}` references unbound name `{{{name}}}`")]
    UnboundVariable { step: String, name: String },

    #[error("invalid template `{template}`: {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("{} failed for {}", .action, .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DeployError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DeployError::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

fn render_candidates(candidates: &[PathBuf]) -> String {
    candidates
        .iter()
        .map(|path| format!("  {}", path.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, DeployError>;

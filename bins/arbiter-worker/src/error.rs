use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Staging failures in the submission workspace
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create directory {path}: {source}", path = .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}", path = .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to resolve {path}: {source}", path = .path.display())]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures invoking the external compile and judge scripts.
/// A compile script that runs and reports failure is not an error here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no command configured for the {0} script")]
    EmptyCommand(&'static str),

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("`{command}` exited with {status}")]
    ExitStatus { command: String, status: ExitStatus },

    #[error("malformed judge output: {0}")]
    MalformedOutput(#[from] serde_json::Error),
}

/// Anything that aborts a pipeline run with an internal error
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

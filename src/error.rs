//! Error types for a launch invocation.
//!
//! Fatal kinds unwind the whole invocation. Per-node kinds carry the command
//! line they belong to so a failure is never attributed to the wrong node.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::command::CommandError;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("launch target must be an absolute path: {0}")]
    InvalidTarget(PathBuf),

    #[error("unsupported launch file extension '{extension}' (expected one of {accepted})")]
    UnsupportedExtension { extension: String, accepted: String },

    #[error(
        "the ROS core did not become ready within {0:?}; try starting `roscore` manually and launch again"
    )]
    CoreTimeout(Duration),

    #[error("launch evaluation failed, reproduce with `{command}`:\n{output}")]
    Evaluator { command: String, output: String },

    #[error("failed to parse node command `{line}`: {source}")]
    Command {
        line: String,
        #[source]
        source: CommandError,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("the debugger could not be started for `{node}`")]
    DebuggerRejected { node: String },

    #[error("{0} is not executable")]
    NotExecutable(PathBuf),

    #[error("{0} is not readable")]
    NotReadable(PathBuf),

    #[error("host request failed: {0}")]
    Host(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = LaunchError> = std::result::Result<T, E>;

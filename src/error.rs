use std::path::PathBuf;

use thiserror::Error;

use crate::process_manager::ChildState;

/// Configuration-level failures. These abort a run before any process is launched;
/// per-scenario failures are recorded in the run result instead.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("unknown scenario '{id}' (known: {})", known.join(", "))]
    UnknownScenario { id: String, known: Vec<String> },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no files matching '{pattern}' under {}", dir.display())]
    NoFilesMatched { dir: PathBuf, pattern: String },

    #[error("data directory {} does not exist", .0.display())]
    MissingDataDir(PathBuf),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("{role} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        role: String,
        from: ChildState,
        to: ChildState,
    },
}

//! Shared types, errors, and configuration for the SubTract pipeline engine.
//!
//! This crate provides the foundational types used across all other SubTract crates:
//! - `SubtractError` — unified error taxonomy, plus `CommandError` and `StepError`
//! - `WorkItem` — one (subject, optional session) processing unit
//! - `StepResult` — immutable outcome of one step for one work item
//! - `SubtractConfig` — explicit, immutable run configuration

pub mod config;
pub mod item;
pub mod result;

pub use config::{
    DispatchConfig, DispatchMode, LayoutConfig, PathConfig, ProcessingConfig, RoiConfig,
    SubtractConfig, DEFAULT_STEPS,
};
pub use item::WorkItem;
pub use result::{StepOutputs, StepResult};

use std::path::{Path, PathBuf};

/// Unified error type for all SubTract subsystems.
#[derive(Debug, thiserror::Error)]
pub enum SubtractError {
    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Required path does not exist: {}", .0.display())]
    MissingPath(PathBuf),

    #[error("Invalid subject filter '{pattern}': {message}")]
    InvalidFilter { pattern: String, message: String },

    // === Execution Errors ===
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Step '{step}' failed for {item}: {message}")]
    Step {
        step: String,
        item: String,
        message: String,
    },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("{0}")]
    Other(String),
}

/// A convenience alias for `Result<T, SubtractError>`.
pub type Result<T> = std::result::Result<T, SubtractError>;

// ---------------------------------------------------------------------------
// CommandError — structured external-tool failure
// ---------------------------------------------------------------------------

/// Failure of a dispatched external command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The command ran and exited with a non-zero status.
    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    Exited {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The command (or its environment wrapper) could not be launched.
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    pub fn command(&self) -> &str {
        match self {
            CommandError::Exited { command, .. } | CommandError::Spawn { command, .. } => command,
        }
    }

    /// Exit code of the failed process, if it ran at all.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Exited { exit_code, .. } => Some(*exit_code),
            CommandError::Spawn { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// StepError — expected step failures
// ---------------------------------------------------------------------------

/// Failures a step anticipates and converts into a failed [`StepResult`].
///
/// Anything outside these categories is returned as a [`SubtractError`] from
/// `Step::execute` and translated by the runner instead.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("Missing prerequisite: {}", .0.display())]
    MissingPrerequisite(PathBuf),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Failed(String),
}

impl StepError {
    pub fn missing(path: impl Into<PathBuf>) -> Self {
        StepError::MissingPrerequisite(path.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }

    /// Short category tag recorded in step metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::MissingPrerequisite(_) => "missing_prerequisite",
            StepError::Command(_) => "command_failed",
            StepError::Io { .. } => "io",
            StepError::Failed(_) => "failed",
        }
    }
}

/// Attach the offending path to an `io::Result`.
pub trait IoContext<T> {
    fn at(self, path: &Path) -> std::result::Result<T, StepError>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> std::result::Result<T, StepError> {
        self.map_err(|source| StepError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_display_includes_exit_code_and_stderr() {
        let err = CommandError::Exited {
            command: "dwidenoise in.nii.gz out.nii.gz".into(),
            exit_code: 3,
            stderr: "bad header".into(),
        };
        assert_eq!(
            err.to_string(),
            "`dwidenoise in.nii.gz out.nii.gz` exited with code 3: bad header"
        );
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(err.command(), "dwidenoise in.nii.gz out.nii.gz");
    }

    #[test]
    fn spawn_error_has_no_exit_code() {
        let err = CommandError::Spawn {
            command: "conda".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(err.exit_code(), None);
        assert!(err.to_string().starts_with("failed to launch `conda`"));
    }

    #[test]
    fn step_error_kinds() {
        assert_eq!(StepError::missing("/x").kind(), "missing_prerequisite");
        assert_eq!(StepError::failed("nope").kind(), "failed");
        let cmd: StepError = CommandError::Exited {
            command: "eddy".into(),
            exit_code: 1,
            stderr: String::new(),
        }
        .into();
        assert_eq!(cmd.kind(), "command_failed");
    }

    #[test]
    fn io_context_records_path() {
        let res: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = res.at(Path::new("/data/sub-01")).unwrap_err();
        assert_eq!(err.to_string(), "IO error at /data/sub-01: denied");
    }

    #[test]
    fn error_display() {
        let err = SubtractError::MissingPath(PathBuf::from("/missing"));
        assert_eq!(err.to_string(), "Required path does not exist: /missing");

        let err = SubtractError::Step {
            step: "eddy".into(),
            item: "sub-01".into(),
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "Step 'eddy' failed for sub-01: boom");
    }
}

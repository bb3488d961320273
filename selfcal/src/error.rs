//! Error taxonomy of the pipeline control core.
//!
//! Every fatal error unwinds to the controller, which finalizes the run
//! workspace before reporting it. Cancellation is carried as its own variant
//! so it is never mistaken for a tool failure.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Run directory and artifact I/O failures. Raised before any tool runs.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Failed to create run directory {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Run directory {0} already exists and is not empty")]
    NotEmpty(PathBuf),

    #[error("Run directory {path} is not writable: {source}")]
    NotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Missing or unusable input datasets. Raised before any cycle starts.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("No input measurement sets given")]
    Empty,

    #[error("Input measurement set not found: {0}")]
    Missing(PathBuf),

    #[error("Failed to copy {from} into the run directory: {source}")]
    Copy {
        from: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Merging the input measurement sets failed: {0}")]
    MergeRejected(#[source] ToolExecutionError),
}

/// Failure of one external tool invocation.
#[derive(Debug, thiserror::Error)]
pub enum ToolExecutionError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with code {} after {duration:.2?}", display_code(.exit_code))]
    NonZeroExit {
        program: String,
        /// `None` when the process was terminated by a signal
        exit_code: Option<i32>,
        duration: Duration,
    },

    #[error("Failed while waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} was cancelled after {duration:.2?}")]
    Cancelled { program: String, duration: Duration },
}

impl ToolExecutionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ToolExecutionError::Cancelled { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ToolExecutionError::NonZeroExit { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn program(&self) -> &str {
        match self {
            ToolExecutionError::Spawn { program, .. }
            | ToolExecutionError::NonZeroExit { program, .. }
            | ToolExecutionError::Wait { program, .. }
            | ToolExecutionError::Cancelled { program, .. } => program,
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "<signal>".to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Tool(ToolExecutionError),

    #[error("Run cancelled by operator")]
    Cancelled,
}

impl From<ToolExecutionError> for PipelineError {
    fn from(err: ToolExecutionError) -> Self {
        if err.is_cancelled() {
            PipelineError::Cancelled
        } else {
            PipelineError::Tool(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_tool_error_maps_to_cancelled() {
        let err = ToolExecutionError::Cancelled {
            program: "wsclean".to_string(),
            duration: Duration::from_secs(1),
        };
        assert!(matches!(PipelineError::from(err), PipelineError::Cancelled));
    }

    #[test]
    fn test_non_zero_exit_message() {
        let err = ToolExecutionError::NonZeroExit {
            program: "DP3".to_string(),
            exit_code: Some(1),
            duration: Duration::from_millis(1500),
        };
        assert_eq!(err.exit_code(), Some(1));
        assert!(err.to_string().starts_with("DP3 exited with code 1"));

        let killed = ToolExecutionError::NonZeroExit {
            program: "DP3".to_string(),
            exit_code: None,
            duration: Duration::ZERO,
        };
        assert!(killed.to_string().contains("<signal>"));
        assert!(matches!(PipelineError::from(killed), PipelineError::Tool(_)));
    }
}

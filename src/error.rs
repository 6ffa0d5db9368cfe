//! Error types for the download engine.
//!
//! Run-level failures (`DownloadError`) are resolved into a task status by the
//! task itself. Command-level failures (`TaskError`) are returned to whoever
//! issued the command. Persistence failures are logged and never fatal.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::models::DownloadStatus;

/// Outcome of a single run attempt of the external tool.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("yt-dlp exited with {}", describe_exit(.code))]
    ExternalTool { code: Option<i32>, stderr: String },

    #[error("download was cancelled")]
    Cancelled,

    #[error("failed to start {}: {source}", display_path(.program))]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while supervising yt-dlp: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP transfer failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected failure during download: {0}")]
    Unexpected(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

fn display_path(path: &std::path::Path) -> std::path::Display<'_> {
    path.display()
}

/// Errors returned by task commands (start, pause, resume, cancel, remove, retry).
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("download {0} not found")]
    NotFound(Uuid),

    #[error("cannot {action} download {id} while it is {status:?}")]
    InvalidState {
        id: Uuid,
        status: DownloadStatus,
        action: &'static str,
    },

    #[error("cannot resume download {id}: missing {field}")]
    Precondition { id: Uuid, field: &'static str },

    #[error("the same media and format is already downloading as {0}")]
    Duplicate(Uuid),
}

/// History file read/write failures.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("history file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("history file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to replace history file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_tool_message_includes_exit_code() {
        let err = DownloadError::ExternalTool {
            code: Some(1),
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "yt-dlp exited with exit code 1");

        let err = DownloadError::ExternalTool {
            code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("terminated by signal"));
    }

    #[test]
    fn test_precondition_names_missing_field() {
        let id = Uuid::nil();
        let err = TaskError::Precondition {
            id,
            field: "source_url",
        };
        assert!(err.to_string().contains("missing source_url"));
    }
}

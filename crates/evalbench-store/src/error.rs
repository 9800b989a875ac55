use std::path::PathBuf;

use thiserror::Error;

use crate::ledger::CorrectionError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised while reading or writing run artifacts.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize run: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid run artifact {path}: {source}")]
    InvalidArtifact {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run id {run_id} exists in several sessions ({}); specify a session", sessions.join(", "))]
    AmbiguousRun {
        run_id: String,
        sessions: Vec<String>,
    },

    #[error("Run id {run_id} already exists in session {session}")]
    DuplicateRunId { session: String, run_id: String },

    #[error("Invalid name '{0}': must be non-empty and contain no path separators")]
    InvalidName(String),

    #[error("No result for {0} in run")]
    ResultNotFound(String),

    #[error(transparent)]
    Correction(#[from] CorrectionError),
}

pub(crate) fn io_err(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.into();
    move |source| StoreError::Io { path, source }
}

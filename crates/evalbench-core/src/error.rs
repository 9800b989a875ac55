use evalbench_store::StoreError;
use evalbench_types::Run;
use thiserror::Error;

/// A selector could not be turned into a task set. Nothing runs when this is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("Malformed selector '{0}'")]
    Malformed(String),

    #[error("No eval definitions found under '{0}'")]
    UnknownSource(String),

    #[error("Unknown identifier(s) in {path}: {}", identifiers.join(", "))]
    Unresolved {
        path: String,
        identifiers: Vec<String>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Eval {path}::{function} is already registered")]
    Duplicate { path: String, function: String },

    /// Two definitions would produce the same task identity.
    #[error("Eval {path}::{function} collides with {existing}::{function}: both use dataset '{dataset}'")]
    DuplicateTask {
        path: String,
        function: String,
        dataset: String,
        existing: String,
    },

    #[error("Eval {path}::{function} declares case id '{case_id}' more than once")]
    DuplicateCase {
        path: String,
        function: String,
        case_id: String,
    },
}

/// Errors fatal to a whole engine invocation. Trial failures never surface here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Selector(#[from] SelectorError),

    /// The run completed but could not be persisted; the in-memory run is kept.
    #[error("Run {} finished but could not be saved: {source}", run.run_id)]
    Storage {
        run: Box<Run>,
        #[source]
        source: StoreError,
    },

    #[error("Could not open run store: {0}")]
    StoreUnavailable(#[source] StoreError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompareError {
    #[error("Comparison needs at least two runs, got {0}")]
    TooFewRuns(usize),
}

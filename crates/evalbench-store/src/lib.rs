//! evalbench-store: filesystem persistence for evaluation runs.
//!
//! Layout: `<root>/<session_name>/<run_name>_<run_id>.json`. Every write goes
//! through a temp file in the session directory followed by a rename, so
//! readers never observe a partially written artifact.

mod error;
pub mod ledger;
mod names;
mod recorder;
mod registry;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::{StoreError, StoreResult};
pub use ledger::{apply_correction, CorrectionError, ScoreField};
pub use names::{generate_run_id, generate_run_name};
pub use registry::SessionInfo;

use error::io_err;

/// Handle to a persisted run artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRef {
    pub session_name: String,
    pub run_name: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
}

/// Single-writer, multi-reader store rooted at a directory.
#[derive(Debug)]
pub struct RunStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl RunStore {
    /// Open a store at `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(io_err(&root))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session: &str) -> PathBuf {
        self.root.join(session)
    }
}

/// Session and run names become path components.
pub(crate) fn validate_name(name: &str) -> StoreResult<()> {
    let bad = name.trim().is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if bad {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Splits a `{run_name}_{run_id}` file stem. Run ids never contain `_`.
pub(crate) fn split_artifact_stem(stem: &str) -> Option<(&str, &str)> {
    let (name, id) = stem.rsplit_once('_')?;
    if name.is_empty() || id.is_empty() {
        return None;
    }
    Some((name, id))
}

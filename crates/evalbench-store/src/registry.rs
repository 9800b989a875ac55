use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use evalbench_types::Run;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::io_err;
use crate::{split_artifact_stem, RunRef, RunStore, StoreError, StoreResult};

/// A session and the runs recorded under it, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub runs: Vec<RunRef>,
}

/// Artifact file found in a session directory, identified by its file name only.
#[derive(Debug, Clone)]
pub(crate) struct ArtifactFile {
    pub run_id: String,
    pub path: PathBuf,
}

/// The fields of a run needed for listing; `results` is skipped.
#[derive(Deserialize)]
struct RunHeader {
    session_name: String,
    run_name: String,
    run_id: String,
    created_at: DateTime<Utc>,
}

impl RunStore {
    /// Names of all sessions, sorted.
    pub fn session_names(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.root).map_err(io_err(&self.root))?;
        for entry in entries {
            let entry = entry.map_err(io_err(&self.root))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    pub fn sessions(&self) -> StoreResult<Vec<SessionInfo>> {
        self.session_names()?
            .into_iter()
            .map(|name| {
                let runs = self.runs(&name)?;
                Ok(SessionInfo { name, runs })
            })
            .collect()
    }

    /// Runs in `session`, ordered by creation time. Artifacts that can't be
    /// read are logged and left out so the rest of the session stays usable.
    pub fn runs(&self, session: &str) -> StoreResult<Vec<RunRef>> {
        if !self.session_dir(session).is_dir() {
            return Err(StoreError::SessionNotFound(session.to_string()));
        }
        let mut runs: Vec<RunRef> = self
            .scan_session(session)?
            .into_iter()
            .filter_map(|a| match read_header(&a.path) {
                Ok(run) => Some(run),
                Err(err) => {
                    warn!(session, path = %a.path.display(), error = %err, "skipping unreadable artifact");
                    None
                }
            })
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.run_id.cmp(&b.run_id)));
        Ok(runs)
    }

    /// Look up a run by id, or by name. When several runs share a name the
    /// most recent one wins.
    pub fn find_run(&self, session: &str, name_or_id: &str) -> StoreResult<RunRef> {
        let runs = self.runs(session)?;
        if let Some(r) = runs.iter().find(|r| r.run_id == name_or_id) {
            return Ok(r.clone());
        }
        runs.into_iter()
            .rev()
            .find(|r| r.run_name == name_or_id || format!("{}_{}", r.run_name, r.run_id) == name_or_id)
            .ok_or_else(|| StoreError::RunNotFound(format!("{session}/{name_or_id}")))
    }

    pub fn load(&self, run: &RunRef) -> StoreResult<Run> {
        Self::load_path(&run.path)
    }

    /// Load an artifact directly from a path, independent of any store root.
    pub fn load_path(path: impl AsRef<Path>) -> StoreResult<Run> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(io_err(path))?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::InvalidArtifact {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Artifact files in a session directory. Temp files and foreign files are skipped.
    pub(crate) fn scan_session(&self, session: &str) -> StoreResult<Vec<ArtifactFile>> {
        let dir = self.session_dir(session);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(io_err(&dir))? {
            let path = entry.map_err(io_err(&dir))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            if let Some((_, run_id)) = split_artifact_stem(stem) {
                found.push(ArtifactFile {
                    run_id: run_id.to_string(),
                    path: path.clone(),
                });
            }
        }
        Ok(found)
    }
}

fn read_header(path: &Path) -> StoreResult<RunRef> {
    let bytes = std::fs::read(path).map_err(io_err(path))?;
    let header: RunHeader = serde_json::from_slice(&bytes).map_err(|source| StoreError::InvalidArtifact {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(RunRef {
        session_name: header.session_name,
        run_name: header.run_name,
        run_id: header.run_id,
        created_at: header.created_at,
        path: path.to_path_buf(),
    })
}

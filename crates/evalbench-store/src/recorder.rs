use std::io::Write;
use std::path::Path;
use std::sync::PoisonError;

use evalbench_types::Run;
use tempfile::NamedTempFile;
use tracing::info;

use crate::error::io_err;
use crate::names::generate_run_id;
use crate::{validate_name, RunRef, RunStore, StoreError, StoreResult};

impl RunStore {
    /// Generate a run id not yet used in `session`.
    pub fn allocate_run_id(&self, session: &str) -> StoreResult<String> {
        let taken = self.scan_session(session)?;
        loop {
            let id = generate_run_id();
            if !taken.iter().any(|a| a.run_id == id) {
                return Ok(id);
            }
        }
    }

    /// Persist a finished run as `<session>/<run_name>_<run_id>.json`.
    ///
    /// Fails if the run id is already present in the session; an artifact is
    /// never overwritten by `record`.
    pub fn record(&self, run: &Run) -> StoreResult<RunRef> {
        validate_name(&run.session_name)?;
        validate_name(&run.run_name)?;
        validate_run_id(&run.run_id)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = self.session_dir(&run.session_name);
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        if self.scan_session(&run.session_name)?.iter().any(|a| a.run_id == run.run_id) {
            return Err(StoreError::DuplicateRunId {
                session: run.session_name.clone(),
                run_id: run.run_id.clone(),
            });
        }

        let path = dir.join(format!("{}.json", run.artifact_name()));
        write_atomic(&dir, &path, run, false)?;
        info!(
            event = "run.recorded",
            session = %run.session_name,
            run_id = %run.run_id,
            path = %path.display(),
            results = run.results.len(),
        );
        Ok(RunRef {
            session_name: run.session_name.clone(),
            run_name: run.run_name.clone(),
            run_id: run.run_id.clone(),
            created_at: run.created_at,
            path,
        })
    }

    /// Change a run's name. Only the `run_name` field and the file name change.
    ///
    /// Without `session`, the run id must be unique across all sessions.
    pub fn rename_run(&self, run_id: &str, new_name: &str, session: Option<&str>) -> StoreResult<RunRef> {
        validate_name(new_name)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let sessions = match session {
            Some(s) => {
                if !self.session_dir(s).is_dir() {
                    return Err(StoreError::SessionNotFound(s.to_string()));
                }
                vec![s.to_string()]
            }
            None => self.session_names()?,
        };

        let mut matches = Vec::new();
        for s in sessions {
            for artifact in self.scan_session(&s)? {
                if artifact.run_id == run_id {
                    matches.push((s.clone(), artifact));
                }
            }
        }

        let (session_name, artifact) = match matches.len() {
            0 => return Err(StoreError::RunNotFound(run_id.to_string())),
            1 => matches.remove(0),
            _ => {
                return Err(StoreError::AmbiguousRun {
                    run_id: run_id.to_string(),
                    sessions: matches.into_iter().map(|(s, _)| s).collect(),
                })
            }
        };

        let mut run = Self::load_path(&artifact.path)?;
        let old_name = std::mem::replace(&mut run.run_name, new_name.to_string());
        let dir = self.session_dir(&session_name);
        let new_path = dir.join(format!("{}.json", run.artifact_name()));

        if new_path != artifact.path && new_path.exists() {
            return Err(StoreError::DuplicateRunId {
                session: session_name,
                run_id: run_id.to_string(),
            });
        }
        // Rewrite in place, then move: readers never see the run under two names.
        write_atomic(&dir, &artifact.path, &run, true)?;
        if new_path != artifact.path {
            std::fs::rename(&artifact.path, &new_path).map_err(io_err(&new_path))?;
        }

        info!(event = "run.renamed", session = %session_name, run_id = %run_id, from = %old_name, to = %new_name);
        Ok(RunRef {
            session_name,
            run_name: run.run_name,
            run_id: run.run_id,
            created_at: run.created_at,
            path: new_path,
        })
    }

    /// Overwrite an existing artifact in place (used by the correction ledger).
    pub(crate) fn rewrite(&self, path: &Path, run: &Run) -> StoreResult<()> {
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::RunNotFound(path.display().to_string()))?;
        write_atomic(dir, path, run, true)
    }
}

fn validate_run_id(run_id: &str) -> StoreResult<()> {
    if run_id.is_empty() || run_id.contains('_') {
        return Err(StoreError::InvalidName(run_id.to_string()));
    }
    validate_name(run_id)
}

/// Write to a temp file in `dir`, fsync, then rename onto `path`.
fn write_atomic(dir: &Path, path: &Path, run: &Run, clobber: bool) -> StoreResult<()> {
    let json = serde_json::to_vec_pretty(run)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    tmp.write_all(&json).map_err(io_err(path))?;
    tmp.as_file().sync_all().map_err(io_err(path))?;

    let persisted = if clobber {
        tmp.persist(path)
    } else {
        tmp.persist_noclobber(path)
    };
    persisted.map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

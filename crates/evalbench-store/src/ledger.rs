//! Correction ledger: human edits to persisted scores.
//!
//! Every edit appends a [`CorrectionEntry`] to the result's
//! `correction_history` before the new value is applied. Entries are never
//! edited or removed, so the history is the record of what the grader said
//! versus what a reviewer decided.

use std::fmt;
use std::str::FromStr;
use std::sync::PoisonError;

use chrono::Utc;
use evalbench_types::{CorrectionEntry, ResultEntry, Score, TaskKey};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::{RunRef, RunStore, StoreError, StoreResult};

#[derive(Debug, Error, PartialEq)]
pub enum CorrectionError {
    #[error("Unknown correction field '{0}': expected scores.<key>.<passed|value|notes>")]
    UnknownField(String),

    #[error("Field {field} expects {expected}, got {got}")]
    WrongType {
        field: String,
        expected: &'static str,
        got: Value,
    },

    #[error("Correction would leave score '{0}' with neither value nor passed")]
    EmptyScore(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreAttr {
    Passed,
    Value,
    Notes,
}

/// Parsed form of `scores.<key>.<attr>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreField {
    pub key: String,
    pub attr: ScoreAttr,
}

impl FromStr for ScoreField {
    type Err = CorrectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || CorrectionError::UnknownField(s.to_string());
        let rest = s.strip_prefix("scores.").ok_or_else(unknown)?;
        let (key, attr) = rest.rsplit_once('.').ok_or_else(unknown)?;
        if key.is_empty() {
            return Err(unknown());
        }
        let attr = match attr {
            "passed" => ScoreAttr::Passed,
            "value" => ScoreAttr::Value,
            "notes" => ScoreAttr::Notes,
            _ => return Err(unknown()),
        };
        Ok(Self { key: key.to_string(), attr })
    }
}

impl fmt::Display for ScoreField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attr = match self.attr {
            ScoreAttr::Passed => "passed",
            ScoreAttr::Value => "value",
            ScoreAttr::Notes => "notes",
        };
        write!(f, "scores.{}.{attr}", self.key)
    }
}

/// Apply a reviewer's value to one score field of `entry`, appending the
/// ledger entry. `before` is taken from the first score under the key. A
/// missing score is created when the new value is non-null.
pub fn apply_correction(
    entry: &mut ResultEntry,
    field: &ScoreField,
    after: Value,
) -> Result<CorrectionEntry, CorrectionError> {
    let field_name = field.to_string();
    let wrong_type = |expected| CorrectionError::WrongType {
        field: field_name.clone(),
        expected,
        got: after.clone(),
    };

    let scores = &mut entry.result.scores;
    let idx = match scores.iter().position(|s| s.key == field.key) {
        Some(idx) => idx,
        None => {
            scores.push(Score {
                key: field.key.clone(),
                value: None,
                passed: None,
                notes: None,
            });
            scores.len() - 1
        }
    };

    let mut updated = scores[idx].clone();
    let before = match field.attr {
        ScoreAttr::Passed => {
            let new = match &after {
                Value::Null => None,
                Value::Bool(b) => Some(*b),
                _ => return Err(rollback(scores, idx, wrong_type("a boolean or null"))),
            };
            let old = std::mem::replace(&mut updated.passed, new);
            old.map(Value::Bool).unwrap_or(Value::Null)
        }
        ScoreAttr::Value => {
            let new = match &after {
                Value::Null => None,
                Value::Number(n) => n.as_f64(),
                _ => return Err(rollback(scores, idx, wrong_type("a number or null"))),
            };
            let old = std::mem::replace(&mut updated.value, new);
            old.map(Value::from).unwrap_or(Value::Null)
        }
        ScoreAttr::Notes => {
            let new = match &after {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                _ => return Err(rollback(scores, idx, wrong_type("a string or null"))),
            };
            let old = std::mem::replace(&mut updated.notes, new);
            old.map(Value::String).unwrap_or(Value::Null)
        }
    };

    // Every score under the key takes the new value, so a result carrying
    // duplicates (e.g. an evaluator also keyed `pass`) follows the reviewer.
    let amended: Vec<(usize, Score)> = scores
        .iter()
        .enumerate()
        .filter(|(_, score)| score.key == field.key)
        .map(|(i, score)| {
            let mut next = score.clone();
            match field.attr {
                ScoreAttr::Passed => next.passed = updated.passed,
                ScoreAttr::Value => next.value = updated.value,
                ScoreAttr::Notes => next.notes = updated.notes.clone(),
            }
            (i, next)
        })
        .collect();
    if amended.iter().any(|(_, next)| next.validate().is_err()) {
        return Err(rollback(scores, idx, CorrectionError::EmptyScore(field.key.clone())));
    }
    for (i, next) in amended {
        scores[i] = next;
    }

    let correction = CorrectionEntry {
        field: field_name,
        before,
        after,
        timestamp: Utc::now(),
    };
    entry.result.correction_history.push(correction.clone());
    Ok(correction)
}

/// Drops a placeholder score pushed for a key that didn't exist yet.
fn rollback(scores: &mut Vec<Score>, idx: usize, err: CorrectionError) -> CorrectionError {
    if scores[idx].validate().is_err() {
        scores.remove(idx);
    }
    err
}

impl RunStore {
    /// Apply a correction to a persisted run and rewrite the artifact atomically.
    /// Summary counters are recomputed since a pass flag may have changed.
    pub fn correct(
        &self,
        run: &RunRef,
        task: &TaskKey,
        field: &str,
        after: Value,
    ) -> StoreResult<CorrectionEntry> {
        let field: ScoreField = field.parse()?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut body = self.load(run)?;
        let entry = body
            .results
            .iter_mut()
            .find(|r| r.key() == *task)
            .ok_or_else(|| StoreError::ResultNotFound(task.to_string()))?;
        let correction = apply_correction(entry, &field, after)?;
        body.refresh_summary();
        self.rewrite(&run.path, &body)?;

        info!(
            event = "result.corrected",
            run_id = %run.run_id,
            task = %task,
            field = %correction.field,
            before = %correction.before,
            after = %correction.after,
        );
        Ok(correction)
    }
}

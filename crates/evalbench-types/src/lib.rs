//! evalbench-types: the persisted data model shared by the engine and the store.

mod run;
mod score;
mod trace;

pub use run::{CorrectionEntry, ErrorKind, EvalOutcome, ResultEntry, Run, RunSummary, TaskKey};
pub use score::{Score, ScoreError, DEFAULT_SCORE_KEY};
pub use trace::{TokenUsage, Trace, TraceBuilder};

/// Short human-readable rendering of a score, e.g. `pass=✓` or `accuracy=0.750`.
pub fn score_preview(score: &Score) -> String {
	run::score_preview(score)
}

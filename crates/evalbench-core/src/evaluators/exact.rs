use anyhow::Result;
use async_trait::async_trait;
use evalbench_types::Score;

use crate::grading::{Evaluator, TrialRecord};

/// Output must equal the reference exactly.
pub struct ExactMatch;

#[async_trait]
impl Evaluator for ExactMatch {
	fn name(&self) -> &str {
		"exact_match"
	}

	async fn evaluate(&self, trial: &TrialRecord) -> Result<Score> {
		let passed = trial.reference == trial.output;
		Ok(Score::pass_fail(self.name(), passed).with_value(if passed { 1.0 } else { 0.0 }))
	}
}

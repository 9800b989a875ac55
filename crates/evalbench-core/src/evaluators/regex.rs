use anyhow::Result;
use async_trait::async_trait;
use evalbench_types::Score;
use regex::Regex;

use crate::grading::{value_text, Evaluator, TrialRecord};

/// Checks if output matches a regex pattern.
pub struct RegexMatch {
	pattern: Regex,
}

impl RegexMatch {
	pub fn new(pattern: &str) -> Result<Self> {
		Ok(Self {
			pattern: Regex::new(pattern)?,
		})
	}
}

#[async_trait]
impl Evaluator for RegexMatch {
	fn name(&self) -> &str {
		"regex"
	}

	async fn evaluate(&self, trial: &TrialRecord) -> Result<Score> {
		let output = value_text(&trial.output);
		let score = match self.pattern.captures(&output) {
			Some(caps) => {
				let groups: Vec<&str> = caps.iter().skip(1).flatten().map(|m| m.as_str()).collect();
				let score = Score::pass_fail(self.name(), true);
				if groups.is_empty() {
					score
				} else {
					score.with_notes(format!("captures: {}", groups.join(", ")))
				}
			}
			None => Score::pass_fail(self.name(), false)
				.with_notes(format!("output does not match /{}/", self.pattern.as_str())),
		};
		Ok(score)
	}
}

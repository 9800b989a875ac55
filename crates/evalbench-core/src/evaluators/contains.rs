use anyhow::Result;
use async_trait::async_trait;
use evalbench_types::Score;

use crate::grading::{value_text, Evaluator, TrialRecord};

/// Checks if output contains a substring.
pub struct Contains {
    substring: String,
    case_sensitive: bool,
}

impl Contains {
    /// Creates a case-sensitive contains evaluator.
    pub fn new(substring: impl Into<String>) -> Self {
        Self {
            substring: substring.into(),
            case_sensitive: true,
        }
    }

    /// Creates a case-insensitive contains evaluator.
    pub fn case_insensitive(substring: impl Into<String>) -> Self {
        Self {
            substring: substring.into(),
            case_sensitive: false,
        }
    }
}

#[async_trait]
impl Evaluator for Contains {
    fn name(&self) -> &str {
        "contains"
    }

    async fn evaluate(&self, trial: &TrialRecord) -> Result<Score> {
        let output = value_text(&trial.output);
        let found = if self.case_sensitive {
            output.contains(&self.substring)
        } else {
            output.to_lowercase().contains(&self.substring.to_lowercase())
        };

        let mut score = Score::pass_fail(self.name(), found);
        if !found {
            score = score.with_notes(format!("'{}' not found in output", self.substring));
        }
        Ok(score)
    }
}

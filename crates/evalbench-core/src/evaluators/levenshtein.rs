use anyhow::Result;
use async_trait::async_trait;
use evalbench_types::Score;
use strsim::levenshtein;

use crate::grading::{value_text, Evaluator, TrialRecord};

/// Normalized edit-distance similarity between output and reference.
pub struct Levenshtein {
    pub min_similarity: f64,
}

impl Levenshtein {
    pub fn new(min_similarity: f64) -> Self {
        Self { min_similarity }
    }
}

#[async_trait]
impl Evaluator for Levenshtein {
    fn name(&self) -> &str {
        "levenshtein"
    }

    async fn evaluate(&self, trial: &TrialRecord) -> Result<Score> {
        let e = value_text(&trial.reference);
        let o = value_text(&trial.output);
        let max_len = e.chars().count().max(o.chars().count()).max(1) as f64;
        let similarity = 1.0 - (levenshtein(&e, &o) as f64 / max_len);
        Ok(Score::numeric(self.name(), similarity).with_passed(similarity >= self.min_similarity))
    }
}

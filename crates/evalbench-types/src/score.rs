use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key used for the pass indicator when a score doesn't name one.
pub const DEFAULT_SCORE_KEY: &str = "pass";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoreError {
	#[error("score '{0}' must carry a value or a passed flag")]
	Empty(String),

	/// NaN and infinities don't survive a JSON round trip.
	#[error("score '{key}' has non-finite value {value}")]
	NonFinite { key: String, value: f64 },
}

/// A single named metric. At least one of `value` / `passed` is always set,
/// and `value` is finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawScore")]
pub struct Score {
	pub key: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub value: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub passed: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub notes: Option<String>,
}

impl Score {
	pub fn new(
		key: impl Into<String>,
		value: Option<f64>,
		passed: Option<bool>,
		notes: Option<String>,
	) -> Result<Self, ScoreError> {
		let score = Self { key: key.into(), value, passed, notes };
		score.validate()?;
		Ok(score)
	}

	/// Boolean score.
	pub fn pass_fail(key: impl Into<String>, passed: bool) -> Self {
		Self { key: key.into(), value: None, passed: Some(passed), notes: None }
	}

	/// Numeric score. A non-finite `value` is caught by [`Score::validate`].
	pub fn numeric(key: impl Into<String>, value: f64) -> Self {
		Self { key: key.into(), value: Some(value), passed: None, notes: None }
	}

	/// Passing score under [`DEFAULT_SCORE_KEY`].
	pub fn pass() -> Self {
		Self::pass_fail(DEFAULT_SCORE_KEY, true)
	}

	/// Failing score under [`DEFAULT_SCORE_KEY`].
	pub fn fail(notes: impl Into<String>) -> Self {
		Self::pass_fail(DEFAULT_SCORE_KEY, false).with_notes(notes)
	}

	pub fn with_value(mut self, value: f64) -> Self {
		self.value = Some(value);
		self
	}

	pub fn with_passed(mut self, passed: bool) -> Self {
		self.passed = Some(passed);
		self
	}

	pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
		self.notes = Some(notes.into());
		self
	}

	/// Re-checks the value/passed invariant after a field was edited in place.
	pub fn validate(&self) -> Result<(), ScoreError> {
		if self.value.is_none() && self.passed.is_none() {
			return Err(ScoreError::Empty(self.key.clone()));
		}
		match self.value {
			Some(value) if !value.is_finite() => Err(ScoreError::NonFinite { key: self.key.clone(), value }),
			_ => Ok(()),
		}
	}
}

#[derive(Deserialize)]
struct RawScore {
	#[serde(default = "default_key")]
	key: String,
	#[serde(default)]
	value: Option<f64>,
	#[serde(default)]
	passed: Option<bool>,
	#[serde(default)]
	notes: Option<String>,
}

fn default_key() -> String {
	DEFAULT_SCORE_KEY.to_string()
}

impl TryFrom<RawScore> for Score {
	type Error = ScoreError;

	fn try_from(raw: RawScore) -> Result<Self, Self::Error> {
		Score::new(raw.key, raw.value, raw.passed, raw.notes)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_empty_score() {
		assert_eq!(Score::new("accuracy", None, None, None), Err(ScoreError::Empty("accuracy".into())));
	}

	#[test]
	fn rejects_non_finite_values() {
		assert!(matches!(
			Score::new("ratio", Some(f64::NAN), None, None),
			Err(ScoreError::NonFinite { .. })
		));
		assert!(Score::numeric("ratio", f64::INFINITY).validate().is_err());
		assert!(Score::numeric("ratio", 0.5).validate().is_ok());
	}

	#[test]
	fn deserialize_defaults_key() {
		let score: Score = serde_json::from_str(r#"{"passed": true}"#).unwrap();
		assert_eq!(score.key, DEFAULT_SCORE_KEY);
		assert_eq!(score.passed, Some(true));
	}

	#[test]
	fn deserialize_rejects_missing_value_and_passed() {
		let err = serde_json::from_str::<Score>(r#"{"key": "x", "notes": "n"}"#);
		assert!(err.is_err());
	}

	#[test]
	fn serialize_skips_unset_fields() {
		let json = serde_json::to_value(Score::numeric("latency", 0.5)).unwrap();
		assert_eq!(json, serde_json::json!({"key": "latency", "value": 0.5}));
	}
}

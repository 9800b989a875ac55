use anyhow::Result;
use async_trait::async_trait;
use evalbench_types::Score;
use jsonschema::JSONSchema;
use serde_json::Value;

use crate::grading::{Evaluator, TrialRecord};

/// Validates that output is JSON, optionally against a schema or the
/// reference's structure.
pub struct JsonValid {
	schema: Option<JSONSchema>,
	strict: bool,
}

impl JsonValid {
	/// Only checks that the output is (or parses as) JSON.
	pub fn new() -> Self {
		Self {
			schema: None,
			strict: false,
		}
	}

	/// Returns an error if the schema itself is invalid.
	pub fn with_schema(schema: Value) -> Result<Self> {
		let compiled = JSONSchema::compile(&schema)
			.map_err(|e| anyhow::anyhow!("Invalid JSON schema: {}", e))?;
		Ok(Self {
			schema: Some(compiled),
			strict: false,
		})
	}

	/// Requires the same keys and value types as the reference.
	pub fn strict() -> Self {
		Self {
			schema: None,
			strict: true,
		}
	}
}

impl Default for JsonValid {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Evaluator for JsonValid {
	fn name(&self) -> &str {
		"json"
	}

	async fn evaluate(&self, trial: &TrialRecord) -> Result<Score> {
		// String outputs are treated as serialized JSON.
		let parsed = match &trial.output {
			Value::String(s) => match serde_json::from_str::<Value>(s) {
				Ok(v) => v,
				Err(e) => {
					return Ok(Score::pass_fail(self.name(), false).with_notes(format!("invalid JSON: {e}")));
				}
			},
			other => other.clone(),
		};

		if let Some(schema) = &self.schema {
			let errors: Vec<String> = match schema.validate(&parsed) {
				Ok(()) => Vec::new(),
				Err(errors) => errors.map(|e| format!("{}: {}", e.instance_path, e)).collect(),
			};
			let score = Score::pass_fail(self.name(), errors.is_empty());
			return Ok(if errors.is_empty() { score } else { score.with_notes(errors.join("; ")) });
		}

		if self.strict {
			let matches = same_structure(&trial.reference, &parsed);
			let score = Score::pass_fail(self.name(), matches);
			return Ok(if matches {
				score
			} else {
				score.with_notes("structure differs from reference")
			});
		}

		Ok(Score::pass_fail(self.name(), true))
	}
}

/// Same keys and value types, values ignored.
fn same_structure(expected: &Value, actual: &Value) -> bool {
	match (expected, actual) {
		(Value::Object(e), Value::Object(a)) => {
			e.len() == a.len()
				&& e.iter().all(|(key, e_val)| a.get(key).is_some_and(|a_val| same_structure(e_val, a_val)))
		}
		(Value::Array(e), Value::Array(a)) => {
			e.len() == a.len() && e.iter().zip(a).all(|(x, y)| same_structure(x, y))
		}
		(Value::String(_), Value::String(_))
		| (Value::Number(_), Value::Number(_))
		| (Value::Bool(_), Value::Bool(_))
		| (Value::Null, Value::Null) => true,
		_ => false,
	}
}

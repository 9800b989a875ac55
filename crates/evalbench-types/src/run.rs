use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabled::{Table, Tabled};

use crate::score::{Score, DEFAULT_SCORE_KEY};

/// Identity of a task across runs: (dataset, function, case_id?).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
	pub dataset: String,
	pub function: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub case_id: Option<String>,
}

impl TaskKey {
	pub fn new(dataset: impl Into<String>, function: impl Into<String>, case_id: Option<String>) -> Self {
		Self { dataset: dataset.into(), function: function.into(), case_id }
	}
}

impl fmt::Display for TaskKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}::{}", self.dataset, self.function)?;
		if let Some(case) = &self.case_id {
			write!(f, "@{case}")?;
		}
		Ok(())
	}
}

/// Why a trial produced no output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	/// The target returned an error.
	Execution,
	/// The trial exceeded its timeout and was cancelled.
	Timeout,
	/// The target panicked.
	Panic,
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			ErrorKind::Execution => "ExecutionError",
			ErrorKind::Timeout => "TimeoutError",
			ErrorKind::Panic => "PanicError",
		};
		f.write_str(name)
	}
}

/// A human amendment to a persisted field. Never edited once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionEntry {
	pub field: String,
	pub before: Value,
	pub after: Value,
	pub timestamp: DateTime<Utc>,
}

/// The `result` object of a persisted result entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalOutcome {
	pub input: Value,
	pub output: Value,
	#[serde(default)]
	pub reference: Value,
	#[serde(default)]
	pub scores: Vec<Score>,
	#[serde(default)]
	pub error: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_kind: Option<ErrorKind>,
	/// Seconds spent in the target.
	#[serde(default)]
	pub latency: Option<f64>,
	#[serde(default)]
	pub metadata: Value,
	#[serde(default)]
	pub trace_data: Value,
	#[serde(default)]
	pub correction_history: Vec<CorrectionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
	pub function: String,
	pub dataset: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub case_id: Option<String>,
	#[serde(default)]
	pub labels: Vec<String>,
	pub result: EvalOutcome,
}

impl ResultEntry {
	pub fn key(&self) -> TaskKey {
		TaskKey::new(&self.dataset, &self.function, self.case_id.clone())
	}

	/// True when at least one score carries `primary_key` and every such score passed.
	pub fn passed(&self, primary_key: &str) -> bool {
		let mut primary = self.result.scores.iter().filter(|s| s.key == primary_key).peekable();
		primary.peek().is_some() && primary.all(|s| s.passed == Some(true))
	}

	pub fn errored(&self) -> bool {
		self.result.error.is_some()
	}

	pub fn score(&self, key: &str) -> Option<&Score> {
		self.result.scores.iter().find(|s| s.key == key)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunSummary {
	pub total: usize,
	pub passed: usize,
	pub errored: usize,
}

impl RunSummary {
	pub fn pass_rate(&self) -> f64 {
		if self.total == 0 {
			0.0
		} else {
			self.passed as f64 / self.total as f64
		}
	}
}

/// Immutable snapshot of one execution pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
	pub session_name: String,
	pub run_name: String,
	pub run_id: String,
	pub created_at: DateTime<Utc>,
	#[serde(default = "default_primary_key")]
	pub primary_key: String,
	#[serde(default)]
	pub interrupted: bool,
	pub total_evaluations: usize,
	pub total_passed: usize,
	pub total_errors: usize,
	pub results: Vec<ResultEntry>,
}

fn default_primary_key() -> String {
	DEFAULT_SCORE_KEY.to_string()
}

impl Run {
	pub fn summarize(results: &[ResultEntry], primary_key: &str) -> RunSummary {
		RunSummary {
			total: results.len(),
			passed: results.iter().filter(|r| r.passed(primary_key)).count(),
			errored: results.iter().filter(|r| r.errored()).count(),
		}
	}

	pub fn summary(&self) -> RunSummary {
		RunSummary {
			total: self.total_evaluations,
			passed: self.total_passed,
			errored: self.total_errors,
		}
	}

	/// Recomputes the counters from the current results.
	pub fn refresh_summary(&mut self) {
		let summary = Self::summarize(&self.results, &self.primary_key);
		self.total_evaluations = summary.total;
		self.total_passed = summary.passed;
		self.total_errors = summary.errored;
	}

	/// `{run_name}_{run_id}`, the artifact's file stem.
	pub fn artifact_name(&self) -> String {
		format!("{}_{}", self.run_name, self.run_id)
	}

	pub fn find(&self, key: &TaskKey) -> Option<&ResultEntry> {
		self.results.iter().find(|r| &r.key() == key)
	}

	pub fn summary_table(&self) -> String {
		let rows: Vec<ResultRow> = self
			.results
			.iter()
			.map(|r| ResultRow::new(r, &self.primary_key))
			.collect();
		let table = Table::new(rows).to_string();
		let summary = self.summary();
		let mut text = format!(
			"{}\n\nRun: {} ({})  Session: {}\nTotal: {}  Passed: {}  Errors: {}  Pass rate: {:.1}%\n",
			table,
			self.run_name,
			self.run_id,
			self.session_name,
			summary.total,
			summary.passed,
			summary.errored,
			summary.pass_rate() * 100.0
		);
		if self.interrupted {
			text.push_str("Run was interrupted; results are partial.\n");
		}
		text
	}
}

#[derive(Tabled)]
struct ResultRow {
	function: String,
	case: String,
	passed: String,
	scores: String,
	error: String,
	latency: String,
}

impl ResultRow {
	fn new(entry: &ResultEntry, primary_key: &str) -> Self {
		let passed = if entry.passed(primary_key) { "✓" } else { "✗" };
		let scores = entry
			.result
			.scores
			.iter()
			.map(score_preview)
			.collect::<Vec<_>>()
			.join(" ");
		Self {
			function: entry.function.clone(),
			case: entry.case_id.clone().unwrap_or_else(|| "-".to_string()),
			passed: passed.to_string(),
			scores,
			error: truncate(entry.result.error.clone().unwrap_or_default(), 48),
			latency: entry
				.result
				.latency
				.map(|l| format!("{l:.2}s"))
				.unwrap_or_else(|| "-".to_string()),
		}
	}
}

pub(crate) fn score_preview(score: &Score) -> String {
	match (score.passed, score.value) {
		(Some(p), Some(v)) => format!("{}={}({v:.3})", score.key, if p { "✓" } else { "✗" }),
		(Some(p), None) => format!("{}={}", score.key, if p { "✓" } else { "✗" }),
		(None, Some(v)) => format!("{}={v:.3}", score.key),
		(None, None) => score.key.clone(),
	}
}

/// Truncates to `max_len` characters, appending an ellipsis when cut.
pub(crate) fn truncate(s: String, max_len: usize) -> String {
	if s.chars().count() <= max_len {
		return s;
	}
	let mut truncated = s.chars().take(max_len.saturating_sub(1)).collect::<String>();
	truncated.push('…');
	truncated
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn entry(function: &str, scores: Vec<Score>, error: Option<&str>) -> ResultEntry {
		ResultEntry {
			function: function.to_string(),
			dataset: "math".to_string(),
			case_id: None,
			labels: vec![],
			result: EvalOutcome {
				input: json!("2+2"),
				output: json!("4"),
				reference: json!("4"),
				scores,
				error: error.map(str::to_string),
				error_kind: error.map(|_| ErrorKind::Execution),
				latency: Some(0.01),
				metadata: Value::Null,
				trace_data: Value::Null,
				correction_history: vec![],
			},
		}
	}

	#[test]
	fn summarize_counts_primary_key_only() {
		let results = vec![
			entry("a", vec![Score::pass()], None),
			entry("b", vec![Score::fail("boom")], Some("boom")),
			entry("c", vec![Score::pass_fail("other", true)], None),
			entry("d", vec![Score::pass(), Score::numeric("accuracy", 0.2)], None),
		];
		let summary = Run::summarize(&results, DEFAULT_SCORE_KEY);
		assert_eq!(summary, RunSummary { total: 4, passed: 2, errored: 1 });
	}

	#[test]
	fn truncate_marks_cut_text() {
		assert_eq!(truncate("short".into(), 8), "short");
		assert_eq!(truncate("a much longer error".into(), 8), "a much …");
	}

	#[test]
	fn task_key_display() {
		let key = TaskKey::new("math", "addition", Some("c1".into()));
		assert_eq!(key.to_string(), "math::addition@c1");
	}

	#[test]
	fn artifact_json_shape() {
		let run = Run {
			session_name: "s".into(),
			run_name: "brave-otter".into(),
			run_id: "abc123".into(),
			created_at: Utc::now(),
			primary_key: DEFAULT_SCORE_KEY.into(),
			interrupted: false,
			total_evaluations: 1,
			total_passed: 1,
			total_errors: 0,
			results: vec![entry("a", vec![Score::pass()], None)],
		};
		let v = serde_json::to_value(&run).unwrap();
		assert_eq!(v["results"][0]["result"]["scores"][0], json!({"key": "pass", "passed": true}));
		assert_eq!(v["results"][0]["result"]["error"], Value::Null);
		assert_eq!(run.artifact_name(), "brave-otter_abc123");
		let back: Run = serde_json::from_value(v).unwrap();
		assert_eq!(back, run);
	}
}

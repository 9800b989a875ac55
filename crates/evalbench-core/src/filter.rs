//! Post-hoc filtering of persisted results.

use std::fmt;
use std::str::FromStr;

use evalbench_types::{ResultEntry, Run};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Neq,
}

impl CompareOp {
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Gt => lhs > rhs,
            CompareOp::Gte => lhs >= rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Lte => lhs <= rhs,
            CompareOp::Eq => (lhs - rhs).abs() < f64::EPSILON,
            CompareOp::Neq => (lhs - rhs).abs() >= f64::EPSILON,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Eq => "==",
            CompareOp::Neq => "!=",
        }
    }
}

/// Numeric condition on a score's value, written `key>=0.5`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreFilter {
    pub key: String,
    pub op: CompareOp,
    pub value: f64,
}

impl FromStr for ScoreFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Two-character operators first so `>=` isn't read as `>`.
        const OPS: [(&str, CompareOp); 6] = [
            (">=", CompareOp::Gte),
            ("<=", CompareOp::Lte),
            ("==", CompareOp::Eq),
            ("!=", CompareOp::Neq),
            (">", CompareOp::Gt),
            ("<", CompareOp::Lt),
        ];
        for (symbol, op) in OPS {
            if let Some((key, value)) = s.split_once(symbol) {
                let key = key.trim();
                if key.is_empty() {
                    return Err(format!("missing score key in '{s}'"));
                }
                let value = value
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| format!("invalid number in '{s}': {e}"))?;
                return Ok(Self { key: key.to_string(), op, value });
            }
        }
        Err(format!("expected KEY<op>VALUE with one of > >= < <= == != in '{s}'"))
    }
}

impl fmt::Display for ScoreFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.key, self.op.symbol(), self.value)
    }
}

/// Pass/fail condition on a score, written `key=true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassFilter {
    pub key: String,
    pub passed: bool,
}

impl FromStr for PassFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, flag) = s.split_once('=').ok_or_else(|| format!("expected KEY=true|false in '{s}'"))?;
        let passed = match flag.trim() {
            "true" | "pass" | "passed" => true,
            "false" | "fail" | "failed" => false,
            other => return Err(format!("expected true or false, got '{other}'")),
        };
        Ok(Self { key: key.trim().to_string(), passed })
    }
}

/// All set conditions must hold for a result to be kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultFilter {
    pub datasets: Vec<String>,
    pub exclude_datasets: Vec<String>,
    pub labels: Vec<String>,
    pub exclude_labels: Vec<String>,
    /// Case-insensitive substring over names, labels, input, output and reference.
    pub search: Option<String>,
    pub has_error: Option<bool>,
    pub has_trace: Option<bool>,
    pub has_url: Option<bool>,
    pub has_messages: Option<bool>,
    pub score_filters: Vec<ScoreFilter>,
    pub pass_filters: Vec<PassFilter>,
    pub limit: Option<usize>,
}

impl ResultFilter {
    pub fn matches(&self, entry: &ResultEntry) -> bool {
        let trace = &entry.result.trace_data;
        (self.datasets.is_empty() || self.datasets.contains(&entry.dataset))
            && !self.exclude_datasets.contains(&entry.dataset)
            && (self.labels.is_empty() || entry.labels.iter().any(|l| self.labels.contains(l)))
            && !entry.labels.iter().any(|l| self.exclude_labels.contains(l))
            && self.search.as_deref().map_or(true, |q| search_matches(entry, q))
            && flag_matches(self.has_error, entry.errored())
            && flag_matches(self.has_trace, !trace.is_null())
            && flag_matches(self.has_url, trace.get("url").is_some_and(|v| !v.is_null()))
            && flag_matches(self.has_messages, trace.get("messages").is_some_and(|v| !v.is_null()))
            && self.score_filters.iter().all(|f| {
                entry
                    .result
                    .scores
                    .iter()
                    .any(|s| s.key == f.key && s.value.is_some_and(|v| f.op.holds(v, f.value)))
            })
            && self.pass_filters.iter().all(|f| {
                entry
                    .result
                    .scores
                    .iter()
                    .any(|s| s.key == f.key && s.passed == Some(f.passed))
            })
    }

    pub fn apply<'a>(&self, run: &'a Run) -> Vec<&'a ResultEntry> {
        let kept = run.results.iter().filter(|r| self.matches(r));
        match self.limit {
            Some(n) => kept.take(n).collect(),
            None => kept.collect(),
        }
    }
}

fn flag_matches(wanted: Option<bool>, actual: bool) -> bool {
    wanted.map_or(true, |w| w == actual)
}

fn search_matches(entry: &ResultEntry, query: &str) -> bool {
    let query = query.to_lowercase();
    let hit = |s: &str| s.to_lowercase().contains(&query);
    let hit_value = |v: &Value| match v {
        Value::Null => false,
        Value::String(s) => hit(s),
        other => hit(&other.to_string()),
    };
    hit(&entry.function)
        || hit(&entry.dataset)
        || entry.case_id.as_deref().is_some_and(hit)
        || entry.labels.iter().any(|l| hit(l))
        || hit_value(&entry.result.input)
        || hit_value(&entry.result.output)
        || hit_value(&entry.result.reference)
}

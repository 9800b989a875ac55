//! Built-in code-based evaluators. Each produces one score keyed by its name.

mod contains;
mod exact;
mod json;
mod levenshtein;
mod regex;

pub use contains::Contains;
pub use exact::ExactMatch;
pub use json::JsonValid;
pub use levenshtein::Levenshtein;
pub use self::regex::RegexMatch;

#[cfg(test)]
pub(crate) fn test_trial(output: serde_json::Value, reference: serde_json::Value) -> crate::grading::TrialRecord {
    crate::grading::TrialRecord {
        key: evalbench_types::TaskKey::new("test", "case", None),
        trial: 0,
        input: serde_json::Value::Null,
        output,
        reference,
        metadata: serde_json::Value::Null,
        trace_data: serde_json::Value::Null,
        error: None,
        latency: 0.0,
    }
}

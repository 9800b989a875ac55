//! Grading pipeline: inline checks first, then post-hoc evaluators.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use evalbench_types::{Score, TaskKey, DEFAULT_SCORE_KEY};
use futures::FutureExt;
use serde_json::Value;
use tracing::warn;

/// A finished trial as seen by checks and evaluators.
#[derive(Debug, Clone)]
pub struct TrialRecord {
    pub key: TaskKey,
    pub trial: usize,
    pub input: Value,
    pub output: Value,
    pub reference: Value,
    pub metadata: Value,
    pub trace_data: Value,
    pub error: Option<String>,
    pub latency: f64,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Key of the score this evaluator produces.
    fn name(&self) -> &str;
    async fn evaluate(&self, trial: &TrialRecord) -> Result<Score>;
}

/// Wrap a synchronous closure as an `Evaluator`.
pub fn evaluator_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn Evaluator>
where
    F: Fn(&TrialRecord) -> Result<Score> + Send + Sync + 'static,
{
    struct FnEvaluator<F> {
        name: String,
        f: F,
    }

    #[async_trait]
    impl<F> Evaluator for FnEvaluator<F>
    where
        F: Fn(&TrialRecord) -> Result<Score> + Send + Sync + 'static,
    {
        fn name(&self) -> &str {
            &self.name
        }

        async fn evaluate(&self, trial: &TrialRecord) -> Result<Score> {
            (self.f)(trial)
        }
    }

    Arc::new(FnEvaluator { name: name.into(), f })
}

type Predicate = dyn Fn(&TrialRecord) -> bool + Send + Sync;

/// Assertion-style check. A failure becomes a failing `pass` score with
/// `message` as notes.
#[derive(Clone)]
pub struct Check {
    message: String,
    predicate: Arc<Predicate>,
}

impl Check {
    pub fn new<F>(message: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&TrialRecord) -> bool + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn output_equals_reference() -> Self {
        Self::new("output does not equal reference", |t| t.output == t.reference)
    }

    pub fn output_contains(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self::new(format!("output does not contain '{needle}'"), move |t| {
            value_text(&t.output).contains(&needle)
        })
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Debug for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Check").field("message", &self.message).finish()
    }
}

/// Grade one trial.
///
/// Checks are skipped when the target errored. Failed checks collapse into one
/// failing `pass` score whose notes list each message; a panicking check counts
/// as failed. Evaluator scores that fail validation are replaced by a failing
/// score under the evaluator's key. If every check passed and
/// nothing else produced a `pass` score, an implicit passing one is added; an
/// errored trial gets a failing `pass` score unless an evaluator supplied one.
/// With no checks at all, `pass` summarizes the evaluators' pass flags.
pub async fn grade(
    trial: &TrialRecord,
    checks: &[Check],
    evaluators: &[Arc<dyn Evaluator>],
    short_circuit: bool,
) -> Vec<Score> {
    let mut scores = Vec::new();
    let mut implicit_pass = false;

    if trial.error.is_none() && !checks.is_empty() {
        let mut failures = Vec::new();
        for check in checks {
            let held = std::panic::catch_unwind(AssertUnwindSafe(|| (check.predicate)(trial)));
            let failure = match held {
                Ok(true) => continue,
                Ok(false) => check.message.clone(),
                Err(payload) => {
                    let msg = panic_message(payload);
                    warn!(task = %trial.key, check = %check.message, error = %msg, "check panicked");
                    format!("check panicked: {msg}")
                }
            };
            failures.push(failure);
            if short_circuit {
                break;
            }
        }
        implicit_pass = failures.is_empty();
        if !implicit_pass {
            scores.push(Score::fail(failures.join("; ")));
        }
    }

    for evaluator in evaluators {
        let outcome = AssertUnwindSafe(evaluator.evaluate(trial)).catch_unwind().await;
        let err = match outcome {
            Ok(Ok(score)) => match score.validate() {
                Ok(()) => {
                    scores.push(score);
                    continue;
                }
                Err(invalid) => format!("invalid score: {invalid}"),
            },
            Ok(Err(err)) => format!("{err:#}"),
            Err(payload) => format!("evaluator panicked: {}", panic_message(payload)),
        };
        warn!(task = %trial.key, evaluator = evaluator.name(), error = %err, "evaluator failed");
        scores.push(Score::pass_fail(evaluator.name(), false).with_notes(format!("evaluator error: {err}")));
    }

    let has_default = scores.iter().any(|s| s.key == DEFAULT_SCORE_KEY);
    if let Some(err) = &trial.error {
        if !has_default {
            scores.insert(0, Score::fail(err.clone()));
        }
    } else if implicit_pass && !has_default {
        scores.insert(0, Score::pass());
    } else if checks.is_empty() && !has_default && scores.iter().any(|s| s.passed.is_some()) {
        let all = scores.iter().all(|s| s.passed != Some(false));
        scores.insert(0, Score::pass_fail(DEFAULT_SCORE_KEY, all));
    }
    scores
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Text form of a value: strings as-is, everything else as JSON.
pub fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        _ => v.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trial(output: Value, error: Option<&str>) -> TrialRecord {
        TrialRecord {
            key: TaskKey::new("math", "addition", None),
            trial: 0,
            input: json!("2+2"),
            output,
            reference: json!("4"),
            metadata: Value::Null,
            trace_data: Value::Null,
            error: error.map(str::to_string),
            latency: 0.0,
        }
    }

    #[tokio::test]
    async fn passing_check_yields_single_implicit_pass() {
        let scores = grade(&trial(json!("4"), None), &[Check::output_equals_reference()], &[], false).await;
        assert_eq!(scores, vec![Score::pass()]);
    }

    #[tokio::test]
    async fn failed_checks_share_one_pass_score() {
        let checks = [
            Check::output_equals_reference(),
            Check::output_contains("4"),
            Check::new("always fine", |_| true),
        ];
        let scores = grade(&trial(json!("5"), None), &checks, &[], false).await;
        assert_eq!(
            scores,
            vec![Score::fail("output does not equal reference; output does not contain '4'")]
        );

        let short = grade(&trial(json!("5"), None), &checks, &[], true).await;
        assert_eq!(short, vec![Score::fail("output does not equal reference")]);
    }

    #[tokio::test]
    async fn panicking_check_fails_the_trial() {
        let fragile = Check::new("output is empty text", |t| t.output.as_str().unwrap().is_empty());
        let numeric = evaluator_fn("length", |t| Ok(Score::numeric("length", value_text(&t.output).len() as f64)));
        let scores = grade(&trial(json!(1), None), &[fragile], &[numeric], false).await;

        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].key, "pass");
        assert_eq!(scores[0].passed, Some(false));
        assert!(scores[0].notes.as_deref().unwrap().starts_with("check panicked: "));
        assert_eq!(scores[1].value, Some(1.0));
    }

    #[tokio::test]
    async fn invalid_evaluator_scores_become_failures() {
        let nan = evaluator_fn("ratio", |_| Ok(Score::numeric("ratio", f64::NAN)));
        let empty = evaluator_fn("judge", |_| {
            Ok(Score { key: "judge".into(), value: None, passed: None, notes: None })
        });
        let scores = grade(&trial(json!("4"), None), &[Check::output_equals_reference()], &[nan, empty], false).await;

        assert_eq!(scores.len(), 3);
        assert!(scores.iter().all(|s| s.validate().is_ok()));
        assert_eq!(scores[1].key, "ratio");
        assert_eq!(scores[1].passed, Some(false));
        assert!(scores[1].notes.as_deref().unwrap().contains("invalid score"));
        assert_eq!(scores[2].key, "judge");
        assert_eq!(scores[2].passed, Some(false));
    }

    #[tokio::test]
    async fn error_produces_failing_pass_unless_evaluator_overrides() {
        let scores = grade(&trial(Value::Null, Some("boom")), &[Check::output_equals_reference()], &[], false).await;
        assert_eq!(scores, vec![Score::fail("boom")]);

        let lenient = evaluator_fn("pass", |_| Ok(Score::pass_fail("pass", true)));
        let scores = grade(&trial(Value::Null, Some("boom")), &[], &[lenient], false).await;
        assert_eq!(scores, vec![Score::pass_fail("pass", true)]);
    }

    #[tokio::test]
    async fn evaluator_error_is_attached_to_its_score() {
        let broken = evaluator_fn("judge", |_| anyhow::bail!("judge offline"));
        let numeric = evaluator_fn("length", |t| Ok(Score::numeric("length", value_text(&t.output).len() as f64)));
        let scores = grade(&trial(json!("4"), None), &[Check::output_equals_reference()], &[broken, numeric], false).await;

        assert_eq!(scores.len(), 3);
        assert_eq!(scores[0], Score::pass());
        assert_eq!(scores[1].key, "judge");
        assert_eq!(scores[1].passed, Some(false));
        assert_eq!(scores[1].notes.as_deref(), Some("evaluator error: judge offline"));
        assert_eq!(scores[2].value, Some(1.0));
    }

    #[tokio::test]
    async fn evaluator_flags_drive_pass_without_checks() {
        let exact = evaluator_fn("exact_match", |t| Ok(Score::pass_fail("exact_match", t.output == t.reference)));
        let numeric = evaluator_fn("length", |t| Ok(Score::numeric("length", value_text(&t.output).len() as f64)));

        let scores = grade(&trial(json!("4"), None), &[], &[exact.clone(), numeric.clone()], false).await;
        assert_eq!(scores[0], Score::pass());

        let scores = grade(&trial(json!("5"), None), &[], &[exact], false).await;
        assert_eq!(scores[0], Score::pass_fail("pass", false));

        let scores = grade(&trial(json!("5"), None), &[], &[numeric], false).await;
        assert!(scores.iter().all(|s| s.key != "pass"));
    }
}

//! Reduces trials into one result per task.

use evalbench_types::{EvalOutcome, ResultEntry, Score};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::registry::Task;
use crate::scheduler::TrialOutcome;

/// How a task's trials combine into its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialReduction {
    /// k=1: the result is trial 0.
    #[default]
    First,
    /// pass@k: a score key passes if any trial passed it.
    PassAtK,
    /// pass^k: a score key passes only if every trial passed it.
    PassHatK,
}

impl TrialReduction {
    fn as_str(self) -> &'static str {
        match self {
            TrialReduction::First => "first",
            TrialReduction::PassAtK => "pass_at_k",
            TrialReduction::PassHatK => "pass_hat_k",
        }
    }
}

/// Collapse a task's trials into its result. Returns `None` when no trial ran.
///
/// Under pass@k / pass^k each score key gets the boolean reduction over the
/// trials that produced it, and the arithmetic mean of their numeric values.
/// Output, trace and notes come from a representative trial: the first
/// passing one for pass@k, the first failing one for pass^k.
pub fn reduce_trials(task: &Task, mut trials: Vec<TrialOutcome>, primary_key: &str) -> Option<ResultEntry> {
    if trials.is_empty() {
        return None;
    }
    trials.sort_by_key(|t| t.trial);
    let reduction = task.reduction();

    if trials.len() == 1 || reduction == TrialReduction::First {
        let extra = (trials.len() > 1).then(|| trial_summary(&trials, reduction, primary_key));
        let first = trials.swap_remove(0);
        let outcome = outcome_from(task, first, extra);
        return Some(entry(task, outcome));
    }

    let passes: Vec<bool> = trials.iter().map(|t| trial_passed(t, primary_key)).collect();
    let rep = match reduction {
        TrialReduction::PassAtK => passes.iter().position(|p| *p),
        _ => passes.iter().position(|p| !*p),
    }
    .unwrap_or(0);

    let mut keys: Vec<&str> = Vec::new();
    for t in &trials {
        for s in &t.scores {
            if !keys.contains(&s.key.as_str()) {
                keys.push(&s.key);
            }
        }
    }

    let scores: Vec<Score> = keys
        .iter()
        .filter_map(|key| reduce_key(key, &trials, rep, reduction))
        .collect();

    let error = match reduction {
        TrialReduction::PassAtK if trials.iter().all(|t| t.error.is_some()) => Some(rep),
        TrialReduction::PassHatK => trials.iter().position(|t| t.error.is_some()),
        _ => None,
    };

    let latency = trials.iter().map(|t| t.latency).sum::<f64>() / trials.len() as f64;
    let summary = trial_summary(&trials, reduction, primary_key);
    let representative = &trials[rep];
    let outcome = EvalOutcome {
        input: task.input.clone(),
        output: representative.output.clone(),
        reference: task.reference.clone(),
        scores,
        error: error.and_then(|i| trials[i].error.clone()),
        error_kind: error.and_then(|i| trials[i].error_kind),
        latency: Some(latency),
        metadata: with_trials(representative.metadata.clone(), summary),
        trace_data: representative.trace_data.clone(),
        correction_history: Vec::new(),
    };
    Some(entry(task, outcome))
}

fn reduce_key(key: &str, trials: &[TrialOutcome], rep: usize, reduction: TrialReduction) -> Option<Score> {
    let mut flags = Vec::new();
    let mut values = Vec::new();
    for t in trials {
        let own: Vec<&Score> = t.scores.iter().filter(|s| s.key == key).collect();
        if own.iter().any(|s| s.passed.is_some()) {
            flags.push(own.iter().all(|s| s.passed != Some(false)));
        }
        values.extend(own.iter().filter_map(|s| s.value).filter(|v| v.is_finite()));
    }

    let passed = if flags.is_empty() {
        None
    } else if reduction == TrialReduction::PassAtK {
        Some(flags.iter().any(|p| *p))
    } else {
        Some(flags.iter().all(|p| *p))
    };
    let value = (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64);
    let notes = trials[rep]
        .scores
        .iter()
        .find(|s| s.key == key)
        .and_then(|s| s.notes.clone());

    Score::new(key, value, passed, notes).ok()
}

fn trial_passed(trial: &TrialOutcome, primary_key: &str) -> bool {
    let mut primary = trial.scores.iter().filter(|s| s.key == primary_key).peekable();
    primary.peek().is_some() && primary.all(|s| s.passed == Some(true))
}

fn trial_summary(trials: &[TrialOutcome], reduction: TrialReduction, primary_key: &str) -> Value {
    json!({
        "count": trials.len(),
        "reduction": reduction.as_str(),
        "passed": trials.iter().map(|t| trial_passed(t, primary_key)).collect::<Vec<_>>(),
        "latencies": trials.iter().map(|t| t.latency).collect::<Vec<_>>(),
    })
}

fn with_trials(metadata: Value, summary: Value) -> Value {
    let mut map = match metadata {
        Value::Object(m) => m,
        Value::Null => Map::new(),
        other => {
            let mut m = Map::new();
            m.insert("task".to_string(), other);
            m
        }
    };
    map.insert("trials".to_string(), summary);
    Value::Object(map)
}

fn outcome_from(task: &Task, trial: TrialOutcome, trials: Option<Value>) -> EvalOutcome {
    let metadata = match trials {
        Some(summary) => with_trials(trial.metadata, summary),
        None => trial.metadata,
    };
    EvalOutcome {
        input: task.input.clone(),
        output: trial.output,
        reference: task.reference.clone(),
        scores: trial.scores,
        error: trial.error,
        error_kind: trial.error_kind,
        latency: Some(trial.latency),
        metadata,
        trace_data: trial.trace_data,
        correction_history: Vec::new(),
    }
}

fn entry(task: &Task, result: EvalOutcome) -> ResultEntry {
    ResultEntry {
        function: task.key.function.clone(),
        dataset: task.key.dataset.clone(),
        case_id: task.key.case_id.clone(),
        labels: task.labels.clone(),
        result,
    }
}

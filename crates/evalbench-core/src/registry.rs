//! Explicit registry of eval definitions, populated at load time.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use evalbench_types::TaskKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::TrialReduction;
use crate::error::RegistryError;
use crate::grading::{Check, Evaluator};
use crate::target::Target;

/// One row of an eval's case list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalCase {
    #[serde(default)]
    pub id: Option<String>,
    pub input: Value,
    #[serde(default, alias = "expected")]
    pub reference: Value,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl EvalCase {
    pub fn new(input: Value, reference: Value) -> Self {
        Self {
            id: None,
            input,
            reference,
            labels: Vec::new(),
            metadata: Value::Null,
        }
    }

    pub fn with_id(id: impl Into<String>, input: Value, reference: Value) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(input, reference)
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }
}

/// A declared eval: a target plus how to feed and grade it.
pub struct EvalDefinition {
    pub source: String,
    pub function: String,
    pub dataset: String,
    pub labels: Vec<String>,
    pub input: Value,
    pub reference: Value,
    pub metadata: Value,
    pub cases: Vec<EvalCase>,
    pub target: Arc<dyn Target>,
    pub checks: Vec<Check>,
    pub evaluators: Vec<Arc<dyn Evaluator>>,
    pub trials: usize,
    pub timeout: Option<Duration>,
    pub reduction: TrialReduction,
    /// Stop running checks after the first failure.
    pub short_circuit: bool,
}

impl EvalDefinition {
    /// `dataset` defaults to the file stem of `source`.
    pub fn new(source: impl Into<String>, function: impl Into<String>, target: Arc<dyn Target>) -> Self {
        let source = normalize_path(&source.into());
        let dataset = Path::new(&source)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.clone());
        Self {
            source,
            function: function.into(),
            dataset,
            labels: Vec::new(),
            input: Value::Null,
            reference: Value::Null,
            metadata: Value::Null,
            cases: Vec::new(),
            target,
            checks: Vec::new(),
            evaluators: Vec::new(),
            trials: 1,
            timeout: None,
            reduction: TrialReduction::default(),
            short_circuit: false,
        }
    }

    pub fn dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = dataset.into();
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn reference(mut self, reference: Value) -> Self {
        self.reference = reference;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn cases<I>(mut self, cases: I) -> Self
    where
        I: IntoIterator<Item = EvalCase>,
    {
        self.cases = cases.into_iter().collect();
        self
    }

    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    pub fn trials(mut self, n: usize) -> Self {
        self.trials = n.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn reduction(mut self, reduction: TrialReduction) -> Self {
        self.reduction = reduction;
        self
    }

    pub fn short_circuit(mut self, enabled: bool) -> Self {
        self.short_circuit = enabled;
        self
    }

    /// Expand into tasks, one per case, or a single task when there are no cases.
    pub(crate) fn tasks(self: &Arc<Self>) -> Vec<Task> {
        if self.cases.is_empty() {
            return vec![Task {
                key: TaskKey::new(&self.dataset, &self.function, None),
                labels: self.labels.clone(),
                input: self.input.clone(),
                reference: self.reference.clone(),
                metadata: self.metadata.clone(),
                definition: Arc::clone(self),
            }];
        }
        self.cases
            .iter()
            .map(|case| {
                let mut labels = self.labels.clone();
                for l in &case.labels {
                    if !labels.contains(l) {
                        labels.push(l.clone());
                    }
                }
                Task {
                    key: TaskKey::new(&self.dataset, &self.function, case.id.clone()),
                    labels,
                    input: case.input.clone(),
                    reference: case.reference.clone(),
                    metadata: merge_metadata(&self.metadata, &case.metadata),
                    definition: Arc::clone(self),
                }
            })
            .collect()
    }

    pub(crate) fn has_case(&self, case_id: &str) -> bool {
        self.cases.iter().any(|c| c.id.as_deref() == Some(case_id))
    }
}

/// A resolved, immutable unit of work.
#[derive(Clone)]
pub struct Task {
    pub key: TaskKey,
    pub labels: Vec<String>,
    pub input: Value,
    pub reference: Value,
    pub metadata: Value,
    pub(crate) definition: Arc<EvalDefinition>,
}

impl Task {
    pub fn trials(&self) -> usize {
        self.definition.trials
    }

    /// Task-level timeout, falling back to `default`.
    pub fn timeout_or(&self, default: Option<Duration>) -> Option<Duration> {
        self.definition.timeout.or(default)
    }

    pub fn reduction(&self) -> TrialReduction {
        self.definition.reduction
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("key", &self.key)
            .field("labels", &self.labels)
            .field("input", &self.input)
            .field("trials", &self.trials())
            .finish()
    }
}

#[derive(Default)]
pub struct EvalRegistry {
    definitions: Vec<Arc<EvalDefinition>>,
}

impl EvalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cases without an id get their position as id so every case is addressable.
    /// `(dataset, function)` must be unique across sources since it is the task identity.
    pub fn register(&mut self, mut definition: EvalDefinition) -> Result<(), RegistryError> {
        if self.get(&definition.source, &definition.function).is_some() {
            return Err(RegistryError::Duplicate {
                path: definition.source,
                function: definition.function,
            });
        }
        if let Some(existing) = self
            .definitions
            .iter()
            .find(|d| d.dataset == definition.dataset && d.function == definition.function)
        {
            return Err(RegistryError::DuplicateTask {
                path: definition.source,
                function: definition.function,
                dataset: definition.dataset,
                existing: existing.source.clone(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for (idx, case) in definition.cases.iter_mut().enumerate() {
            let id = case.id.get_or_insert_with(|| idx.to_string());
            if !seen.insert(id.clone()) {
                return Err(RegistryError::DuplicateCase {
                    path: definition.source.clone(),
                    function: definition.function.clone(),
                    case_id: id.clone(),
                });
            }
        }
        self.definitions.push(Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, source: &str, function: &str) -> Option<&Arc<EvalDefinition>> {
        self.definitions
            .iter()
            .find(|d| d.source == source && d.function == function)
    }

    /// Definitions in registration order.
    pub fn definitions(&self) -> impl Iterator<Item = &Arc<EvalDefinition>> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Strips `./` prefixes and trailing slashes so selector paths and sources compare equal.
pub(crate) fn normalize_path(path: &str) -> String {
    let mut p = path.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    let p = p.trim_end_matches('/');
    if p.is_empty() || p == "." {
        String::new()
    } else {
        p.to_string()
    }
}

fn merge_metadata(base: &Value, case: &Value) -> Value {
    match (base, case) {
        (Value::Object(b), Value::Object(c)) => {
            let mut merged = b.clone();
            merged.extend(c.clone());
            Value::Object(merged)
        }
        (_, Value::Null) => base.clone(),
        _ => case.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::from_async_fn;
    use serde_json::json;

    fn echo() -> Arc<dyn Target> {
        from_async_fn(|input| {
            let input = input.clone();
            async move { Ok(input) }
        })
    }

    #[test]
    fn dataset_defaults_to_file_stem() {
        let def = EvalDefinition::new("./evals/math.yaml", "addition", echo());
        assert_eq!(def.source, "evals/math.yaml");
        assert_eq!(def.dataset, "math");
    }

    #[test]
    fn register_assigns_case_ids_and_rejects_duplicates() {
        let mut registry = EvalRegistry::new();
        let def = EvalDefinition::new("math.yaml", "addition", echo()).cases(vec![
            EvalCase::new(json!("1+1"), json!("2")),
            EvalCase::with_id("big", json!("9+9"), json!("18")),
        ]);
        registry.register(def).unwrap();
        let stored = registry.get("math.yaml", "addition").unwrap();
        assert_eq!(stored.cases[0].id.as_deref(), Some("0"));
        assert_eq!(stored.cases[1].id.as_deref(), Some("big"));

        let again = EvalDefinition::new("math.yaml", "addition", echo());
        assert!(matches!(registry.register(again), Err(RegistryError::Duplicate { .. })));
    }

    #[test]
    fn register_rejects_colliding_task_identity() {
        let mut registry = EvalRegistry::new();
        registry
            .register(EvalDefinition::new("evals/a.yaml", "capitals", echo()).dataset("qa"))
            .unwrap();
        let err = registry
            .register(EvalDefinition::new("evals/b.yaml", "capitals", echo()).dataset("qa"))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateTask {
                path: "evals/b.yaml".into(),
                function: "capitals".into(),
                dataset: "qa".into(),
                existing: "evals/a.yaml".into(),
            }
        );

        // Same stem in different directories collides too.
        registry.register(EvalDefinition::new("a/math.yaml", "add", echo())).unwrap();
        assert!(matches!(
            registry.register(EvalDefinition::new("b/math.yaml", "add", echo())),
            Err(RegistryError::DuplicateTask { .. })
        ));

        registry
            .register(EvalDefinition::new("evals/b.yaml", "capitals", echo()).dataset("geo"))
            .unwrap();
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn case_tasks_merge_labels_and_metadata() {
        let def = Arc::new(
            EvalDefinition::new("qa.yaml", "capitals", echo())
                .label("geo")
                .metadata(json!({"suite": "qa"}))
                .cases(vec![EvalCase {
                    metadata: json!({"difficulty": "easy"}),
                    ..EvalCase::with_id("fr", json!("France"), json!("Paris")).label("europe").label("geo")
                }]),
        );
        let tasks = def.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].labels, vec!["geo".to_string(), "europe".to_string()]);
        assert_eq!(tasks[0].metadata, json!({"suite": "qa", "difficulty": "easy"}));
        assert_eq!(tasks[0].key.to_string(), "qa::capitals@fr");
    }
}

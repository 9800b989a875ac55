//! YAML suite manifests: declarative evals for the CLI.
//!
//! ```yaml
//! dataset: qa
//! target:
//!   type: http
//!   url: http://localhost:8080/answer
//! evals:
//!   - function: capitals
//!     cases_file: capitals.jsonl
//!     checks:
//!       - type: output_equals_reference
//!     evaluators:
//!       - type: levenshtein
//!         threshold: 0.8
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::aggregate::TrialReduction;
use crate::evaluators::{Contains, ExactMatch, JsonValid, Levenshtein, RegexMatch};
use crate::grading::{Check, Evaluator};
use crate::registry::{EvalCase, EvalDefinition, EvalRegistry};
use crate::target::{echo, HttpMethod, HttpTarget, Target};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteManifest {
    #[serde(default)]
    pub dataset: Option<String>,
    pub target: TargetConfig,
    #[serde(default)]
    pub labels: Vec<String>,
    pub evals: Vec<EvalEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum TargetConfig {
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
    },
    Echo,
}

fn default_http_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalEntry {
    pub function: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Overrides the manifest-level target.
    #[serde(default)]
    pub target: Option<TargetConfig>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, alias = "expected")]
    pub reference: Value,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub cases: Vec<EvalCase>,
    /// JSONL, relative to the manifest.
    #[serde(default)]
    pub cases_file: Option<PathBuf>,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
    #[serde(default)]
    pub evaluators: Vec<EvaluatorConfig>,
    #[serde(default = "default_trials")]
    pub trials: usize,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub reduction: TrialReduction,
    #[serde(default)]
    pub short_circuit: bool,
}

fn default_trials() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum CheckConfig {
    OutputEqualsReference,
    OutputContains { needle: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorConfig {
    Exact,
    Levenshtein {
        threshold: f64,
    },
    Contains {
        substring: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    Regex {
        pattern: String,
    },
    Json {
        #[serde(default)]
        strict: bool,
    },
    JsonSchema {
        /// Schema file, relative to the manifest.
        path: PathBuf,
    },
}

impl TargetConfig {
    fn build(&self) -> Arc<dyn Target> {
        match self {
            TargetConfig::Http { url, method } => Arc::new(HttpTarget::new(url.clone(), HttpMethod::parse(method))),
            TargetConfig::Echo => echo(),
        }
    }
}

impl CheckConfig {
    fn build(&self) -> Check {
        match self {
            CheckConfig::OutputEqualsReference => Check::output_equals_reference(),
            CheckConfig::OutputContains { needle } => Check::output_contains(needle.clone()),
        }
    }
}

impl EvaluatorConfig {
    async fn build(&self, base: &Path) -> Result<Arc<dyn Evaluator>> {
        let evaluator: Arc<dyn Evaluator> = match self {
            EvaluatorConfig::Exact => Arc::new(ExactMatch),
            EvaluatorConfig::Levenshtein { threshold } => Arc::new(Levenshtein::new(*threshold)),
            EvaluatorConfig::Contains { substring, case_sensitive } => {
                if *case_sensitive {
                    Arc::new(Contains::new(substring.clone()))
                } else {
                    Arc::new(Contains::case_insensitive(substring.clone()))
                }
            }
            EvaluatorConfig::Regex { pattern } => Arc::new(RegexMatch::new(pattern)?),
            EvaluatorConfig::Json { strict } => {
                if *strict {
                    Arc::new(JsonValid::strict())
                } else {
                    Arc::new(JsonValid::new())
                }
            }
            EvaluatorConfig::JsonSchema { path } => {
                let path = base.join(path);
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Failed to read schema {:?}", path))?;
                let schema: Value = serde_json::from_str(&text)
                    .with_context(|| format!("Invalid JSON in schema {:?}", path))?;
                Arc::new(JsonValid::with_schema(schema)?)
            }
        };
        Ok(evaluator)
    }
}

/// Load one manifest into `registry`, returning how many evals it declared.
/// The manifest path, as given, becomes each definition's source.
pub async fn load_suite(path: impl AsRef<Path>, registry: &mut EvalRegistry) -> Result<usize> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read suite {:?}", path))?;
    let manifest: SuiteManifest =
        serde_yaml::from_str(&text).with_context(|| format!("Invalid suite manifest {:?}", path))?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    let source = path.to_string_lossy().replace('\\', "/");

    let count = manifest.evals.len();
    for entry in &manifest.evals {
        let definition = build_definition(&manifest, entry, &source, base)
            .await
            .with_context(|| format!("In eval '{}' of {:?}", entry.function, path))?;
        registry.register(definition)?;
    }
    debug!(suite = %source, evals = count, "suite loaded");
    Ok(count)
}

/// Load every `.yaml` / `.yml` manifest under `root` (or `root` itself if it is a file).
pub async fn load_suites(root: impl AsRef<Path>) -> Result<EvalRegistry> {
    let mut files = Vec::new();
    collect_manifests(root.as_ref(), &mut files)?;
    files.sort();

    let mut registry = EvalRegistry::new();
    for file in files {
        load_suite(&file, &mut registry).await?;
    }
    Ok(registry)
}

fn collect_manifests(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_file() {
        out.push(path.to_path_buf());
        return Ok(());
    }
    let entries = std::fs::read_dir(path).with_context(|| format!("Failed to read {:?}", path))?;
    for entry in entries {
        let entry_path = entry?.path();
        let hidden = entry_path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with('.'));
        if hidden {
            continue;
        }
        if entry_path.is_dir() {
            collect_manifests(&entry_path, out)?;
        } else if entry_path
            .extension()
            .is_some_and(|e| e == "yaml" || e == "yml")
        {
            out.push(entry_path);
        }
    }
    Ok(())
}

async fn build_definition(
    manifest: &SuiteManifest,
    entry: &EvalEntry,
    source: &str,
    base: &Path,
) -> Result<EvalDefinition> {
    let target = entry.target.as_ref().unwrap_or(&manifest.target).build();
    let mut def = EvalDefinition::new(source, entry.function.clone(), target)
        .input(entry.input.clone())
        .reference(entry.reference.clone())
        .metadata(entry.metadata.clone())
        .trials(entry.trials)
        .reduction(entry.reduction)
        .short_circuit(entry.short_circuit);
    if let Some(dataset) = &manifest.dataset {
        def = def.dataset(dataset.clone());
    }
    for label in manifest.labels.iter().chain(&entry.labels) {
        if !def.labels.contains(label) {
            def = def.label(label.clone());
        }
    }

    let mut cases = entry.cases.clone();
    if let Some(file) = &entry.cases_file {
        cases.extend(read_jsonl_cases(&base.join(file)).await?);
    }
    def = def.cases(cases);

    if let Some(secs) = entry.timeout_secs {
        let timeout = Duration::try_from_secs_f64(secs).map_err(|e| anyhow!("Invalid timeout_secs {secs}: {e}"))?;
        def = def.timeout(timeout);
    }
    for check in &entry.checks {
        def = def.check(check.build());
    }
    for evaluator in &entry.evaluators {
        def = def.evaluator(evaluator.build(base).await?);
    }
    Ok(def)
}

/// Each non-empty line is `{"id"?, "input", "reference"? | "expected"?, "labels"?, "metadata"?}`.
pub async fn read_jsonl_cases(path: &Path) -> Result<Vec<EvalCase>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    let mut cases = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .with_context(|| format!("Invalid JSON on line {}", idx + 1))?;
        let obj = value
            .as_object()
            .ok_or_else(|| anyhow!("Line {}: expected object", idx + 1))?;
        if !obj.contains_key("input") {
            bail!("Line {}: missing 'input'", idx + 1);
        }
        let case: EvalCase = serde_json::from_value(value)
            .with_context(|| format!("Line {}: invalid case", idx + 1))?;
        cases.push(case);
    }
    Ok(cases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, text).unwrap();
        path
    }

    #[tokio::test]
    async fn loads_inline_and_jsonl_cases() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "capitals.jsonl",
            "{\"id\": \"fr\", \"input\": \"France\", \"expected\": \"France\", \"labels\": [\"europe\"]}\n\n{\"input\": \"Peru\", \"reference\": \"Lima\"}\n",
        );
        let manifest = write(
            dir.path(),
            "qa.yaml",
            r#"
target:
  type: echo
labels: [geo]
evals:
  - function: capitals
    cases_file: capitals.jsonl
    cases:
      - id: jp
        input: Japan
        reference: Japan
    checks:
      - type: output_equals_reference
    trials: 2
    reduction: pass_at_k
    timeout_secs: 1.5
  - function: greeting
    input: hello
    evaluators:
      - type: contains
        substring: HELLO
"#,
        );

        let mut registry = EvalRegistry::new();
        assert_eq!(load_suite(&manifest, &mut registry).await.unwrap(), 2);

        let source = manifest.to_string_lossy().replace('\\', "/");
        let capitals = registry.get(&source, "capitals").unwrap();
        assert_eq!(capitals.dataset, "qa");
        assert_eq!(capitals.labels, vec!["geo".to_string()]);
        assert_eq!(capitals.cases.len(), 3);
        assert_eq!(capitals.cases[0].id.as_deref(), Some("jp"));
        assert_eq!(capitals.cases[1].labels, vec!["europe".to_string()]);
        assert_eq!(capitals.cases[2].id.as_deref(), Some("2"));
        assert_eq!(capitals.cases[2].reference, json!("Lima"));
        assert_eq!(capitals.trials, 2);
        assert_eq!(capitals.reduction, TrialReduction::PassAtK);
        assert_eq!(capitals.timeout, Some(Duration::from_millis(1500)));

        let greeting = registry.get(&source, "greeting").unwrap();
        assert_eq!(greeting.evaluators.len(), 1);
        assert_eq!(greeting.evaluators[0].name(), "contains");
    }

    #[tokio::test]
    async fn rejects_bad_jsonl_with_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "bad.jsonl", "{\"input\": 1}\n{\"reference\": 2}\n");
        let err = read_jsonl_cases(&file).await.unwrap_err();
        assert!(err.to_string().contains("Line 2"));
    }

    #[tokio::test]
    async fn invalid_regex_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write(
            dir.path(),
            "r.yaml",
            "target: {type: echo}\nevals:\n  - function: f\n    evaluators:\n      - {type: regex, pattern: \"(\"}\n",
        );
        let mut registry = EvalRegistry::new();
        assert!(load_suite(&manifest, &mut registry).await.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn walks_directories_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let suite = "target: {type: echo}\nevals:\n  - function: f\n";
        write(dir.path(), "b.yaml", suite);
        write(dir.path(), "nested/a.yml", suite);
        write(dir.path(), ".hidden/c.yaml", suite);
        write(dir.path(), "notes.txt", "ignored");

        let registry = load_suites(dir.path()).await.unwrap();
        let datasets: Vec<&str> = registry.definitions().map(|d| d.dataset.as_str()).collect();
        assert_eq!(datasets, vec!["b", "a"]);
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use evalbench_types::DEFAULT_SCORE_KEY;
use serde::{Deserialize, Serialize};

use crate::selector::SelectionFilter;

/// Options for one engine invocation. Loaded from YAML or built in code;
/// the CLI layers its flags on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub concurrency: usize,
    /// Default trial timeout for tasks that don't declare one.
    pub timeout_secs: Option<f64>,
    pub output_dir: PathBuf,
    /// When false the run is returned but never written.
    pub persist: bool,
    pub session_name: String,
    pub run_name: Option<String>,
    pub datasets: Vec<String>,
    pub exclude_datasets: Vec<String>,
    pub labels: Vec<String>,
    pub exclude_labels: Vec<String>,
    pub limit: Option<usize>,
    pub verbose: bool,
    pub primary_key: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            timeout_secs: None,
            output_dir: PathBuf::from(".evalbench/runs"),
            persist: true,
            session_name: "default".to_string(),
            run_name: None,
            datasets: Vec::new(),
            exclude_datasets: Vec::new(),
            labels: Vec::new(),
            exclude_labels: Vec::new(),
            limit: None,
            verbose: false,
            primary_key: DEFAULT_SCORE_KEY.to_string(),
        }
    }
}

impl RunConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: RunConfig = serde_yaml::from_str(yaml).context("Invalid run config")?;
        Ok(config.normalized())
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        Self::from_yaml_str(&text).with_context(|| format!("In {:?}", path))
    }

    fn normalized(mut self) -> Self {
        self.concurrency = self.concurrency.max(1);
        self
    }

    /// Run-level trial timeout. Non-positive or non-finite values mean none.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|s| *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }

    pub fn selection_filter(&self) -> SelectionFilter {
        SelectionFilter {
            datasets: self.datasets.clone(),
            exclude_datasets: self.exclude_datasets.clone(),
            labels: self.labels.clone(),
            exclude_labels: self.exclude_labels.clone(),
            limit: self.limit,
        }
    }
}

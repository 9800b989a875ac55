//! Align runs by task identity.

use evalbench_types::{score_preview, ResultEntry, Run, TaskKey};
use serde::{Deserialize, Serialize};
use tabled::builder::Builder;

use crate::error::CompareError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLabel {
    pub session_name: String,
    pub run_name: String,
    pub run_id: String,
}

/// One run's side of an aligned row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "entry", rename_all = "snake_case")]
pub enum Cell {
    Present(Box<ResultEntry>),
    Missing,
}

impl Cell {
    pub fn entry(&self) -> Option<&ResultEntry> {
        match self {
            Cell::Present(e) => Some(e),
            Cell::Missing => None,
        }
    }
}

/// Per-key metric across runs. Booleans count as 1.0 / 0.0 when a score has no value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub key: String,
    pub values: Vec<Option<f64>>,
    /// Difference from the first run that has a value.
    pub deltas: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub key: TaskKey,
    pub cells: Vec<Cell>,
    pub deltas: Vec<MetricDelta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub runs: Vec<RunLabel>,
    pub primary_key: String,
    pub rows: Vec<ComparisonRow>,
}

/// Join two or more runs on (dataset, function, case_id). Rows appear in
/// first-seen order across the runs as given; task sets may differ.
pub fn compare(runs: &[Run]) -> Result<Comparison, CompareError> {
    if runs.len() < 2 {
        return Err(CompareError::TooFewRuns(runs.len()));
    }

    let mut keys: Vec<TaskKey> = Vec::new();
    for run in runs {
        for r in &run.results {
            let key = r.key();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }

    let rows = keys
        .into_iter()
        .map(|key| {
            let cells: Vec<Cell> = runs
                .iter()
                .map(|run| match run.find(&key) {
                    Some(e) => Cell::Present(Box::new(e.clone())),
                    None => Cell::Missing,
                })
                .collect();
            let deltas = metric_deltas(&cells);
            ComparisonRow { key, cells, deltas }
        })
        .collect();

    Ok(Comparison {
        runs: runs
            .iter()
            .map(|r| RunLabel {
                session_name: r.session_name.clone(),
                run_name: r.run_name.clone(),
                run_id: r.run_id.clone(),
            })
            .collect(),
        primary_key: runs[0].primary_key.clone(),
        rows,
    })
}

fn metric_deltas(cells: &[Cell]) -> Vec<MetricDelta> {
    let mut keys: Vec<String> = Vec::new();
    for entry in cells.iter().filter_map(Cell::entry) {
        for s in &entry.result.scores {
            if !keys.contains(&s.key) {
                keys.push(s.key.clone());
            }
        }
    }

    keys.into_iter()
        .filter_map(|key| {
            let values: Vec<Option<f64>> = cells
                .iter()
                .map(|c| c.entry().and_then(|e| metric_value(e, &key)))
                .collect();
            if values.iter().flatten().count() < 2 {
                return None;
            }
            let baseline = values.iter().flatten().next().copied()?;
            let deltas = values.iter().map(|v| v.map(|v| v - baseline)).collect();
            Some(MetricDelta { key, values, deltas })
        })
        .collect()
}

/// Mean over all scores with `key` in the entry.
fn metric_value(entry: &ResultEntry, key: &str) -> Option<f64> {
    let values: Vec<f64> = entry
        .result
        .scores
        .iter()
        .filter(|s| s.key == key)
        .filter_map(|s| s.value.or(s.passed.map(|p| if p { 1.0 } else { 0.0 })))
        .collect();
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

impl Comparison {
    pub fn row(&self, key: &TaskKey) -> Option<&ComparisonRow> {
        self.rows.iter().find(|r| &r.key == key)
    }

    pub fn table(&self) -> String {
        let mut builder = Builder::default();
        let mut header = vec!["task".to_string()];
        header.extend(self.runs.iter().map(|r| format!("{} ({})", r.run_name, r.run_id)));
        header.push("deltas".to_string());
        builder.push_record(header);

        for row in &self.rows {
            let mut record = vec![row.key.to_string()];
            record.extend(row.cells.iter().map(|c| match c.entry() {
                None => "missing".to_string(),
                Some(e) => {
                    let mark = if e.passed(&self.primary_key) { "✓" } else { "✗" };
                    let scores: Vec<String> = e.result.scores.iter().map(score_preview).collect();
                    format!("{mark} {}", scores.join(" "))
                }
            }));
            let deltas: Vec<String> = row
                .deltas
                .iter()
                .map(|d| {
                    let parts: Vec<String> = d
                        .deltas
                        .iter()
                        .skip(1)
                        .map(|x| x.map(|x| format!("{x:+.3}")).unwrap_or_else(|| "-".to_string()))
                        .collect();
                    format!("{}: {}", d.key, parts.join(" "))
                })
                .collect();
            record.push(deltas.join("; "));
            builder.push_record(record);
        }
        builder.build().to_string()
    }
}

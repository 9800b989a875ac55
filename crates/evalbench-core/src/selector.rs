//! Selector resolution: `path::function[@case][,function[@case]...]` to tasks.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::SelectorError;
use crate::registry::{normalize_path, EvalRegistry, Task};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub function: String,
    pub case_id: Option<String>,
}

/// A parsed selector. An empty identifier list selects everything under `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub path: String,
    pub identifiers: Vec<Identifier>,
}

impl Selector {
    pub fn parse(selector: &str) -> Result<Self, SelectorError> {
        let malformed = || SelectorError::Malformed(selector.to_string());
        let (path, idents) = match selector.split_once("::") {
            Some((path, idents)) => (path, Some(idents)),
            None => (selector, None),
        };

        let mut identifiers = Vec::new();
        if let Some(idents) = idents {
            for raw in idents.split(',') {
                let raw = raw.trim();
                let (function, case_id) = match raw.split_once('@') {
                    Some((f, c)) => (f.trim(), Some(c.trim())),
                    None => (raw, None),
                };
                if function.is_empty() || case_id.is_some_and(str::is_empty) {
                    return Err(malformed());
                }
                identifiers.push(Identifier {
                    function: function.to_string(),
                    case_id: case_id.map(str::to_string),
                });
            }
        }

        Ok(Self {
            path: normalize_path(path),
            identifiers,
        })
    }
}

/// Filters applied after explicit selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionFilter {
    #[serde(default)]
    pub datasets: Vec<String>,
    #[serde(default)]
    pub exclude_datasets: Vec<String>,
    /// A task is kept if it carries any of these labels.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub exclude_labels: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SelectionFilter {
    pub fn matches(&self, task: &Task) -> bool {
        let dataset = &task.key.dataset;
        (self.datasets.is_empty() || self.datasets.contains(dataset))
            && !self.exclude_datasets.contains(dataset)
            && (self.labels.is_empty() || task.labels.iter().any(|l| self.labels.contains(l)))
            && !task.labels.iter().any(|l| self.exclude_labels.contains(l))
    }

    pub fn apply(&self, tasks: Vec<Task>) -> Vec<Task> {
        let kept = tasks.into_iter().filter(|t| self.matches(t));
        match self.limit {
            Some(n) => kept.take(n).collect(),
            None => kept.collect(),
        }
    }
}

/// Resolve a selector into an ordered, de-duplicated task list.
///
/// The path matches a definition's source exactly, or as a directory prefix;
/// an empty path matches everything. Every unknown function or case id is
/// reported in one error.
pub fn resolve(
    registry: &EvalRegistry,
    selector: &str,
    filter: &SelectionFilter,
) -> Result<Vec<Task>, SelectorError> {
    let parsed = Selector::parse(selector)?;
    let in_scope: Vec<_> = registry
        .definitions()
        .filter(|d| source_matches(&d.source, &parsed.path))
        .collect();
    if in_scope.is_empty() {
        return Err(SelectorError::UnknownSource(parsed.path));
    }

    let mut tasks = Vec::new();
    if parsed.identifiers.is_empty() {
        for def in &in_scope {
            tasks.extend(def.tasks());
        }
    } else {
        let mut unknown = Vec::new();
        for ident in &parsed.identifiers {
            let defs: Vec<_> = in_scope.iter().filter(|d| d.function == ident.function).collect();
            if defs.is_empty() {
                unknown.push(format!("function '{}'", ident.function));
                continue;
            }
            match &ident.case_id {
                None => defs.iter().for_each(|d| tasks.extend(d.tasks())),
                Some(case_id) => {
                    let mut found = false;
                    for def in defs.iter().filter(|d| d.has_case(case_id)) {
                        found = true;
                        tasks.extend(def.tasks().into_iter().filter(|t| t.key.case_id.as_deref() == Some(case_id)));
                    }
                    if !found {
                        unknown.push(format!("case '{}@{}'", ident.function, case_id));
                    }
                }
            }
        }
        if !unknown.is_empty() {
            return Err(SelectorError::Unresolved {
                path: parsed.path,
                identifiers: unknown,
            });
        }
    }

    let mut seen = HashSet::new();
    tasks.retain(|t| seen.insert(t.key.clone()));
    Ok(filter.apply(tasks))
}

fn source_matches(source: &str, path: &str) -> bool {
    path.is_empty()
        || source == path
        || source.strip_prefix(path).is_some_and(|rest| rest.starts_with('/'))
}

pub use evalbench_types::{TokenUsage, Trace, TraceBuilder};

use std::cell::RefCell;
use std::future::Future;

use serde_json::{Map, Value};

/// Everything a target reported while one trial was running.
#[derive(Debug, Default, Clone)]
pub struct TrialCapture {
    pub traces: Vec<Trace>,
    pub metadata: Map<String, Value>,
    pub trace_fields: Map<String, Value>,
}

impl TrialCapture {
    /// `trace_data` payload: reported fields plus a `traces` array, or null if nothing was reported.
    pub fn trace_data(&self) -> Value {
        if self.traces.is_empty() && self.trace_fields.is_empty() {
            return Value::Null;
        }
        let mut data = self.trace_fields.clone();
        if !self.traces.is_empty() {
            data.insert(
                "traces".to_string(),
                serde_json::to_value(&self.traces).unwrap_or(Value::Null),
            );
        }
        Value::Object(data)
    }

    /// Task metadata overlaid with what the target reported.
    pub fn merged_metadata(&self, base: &Value) -> Value {
        if self.metadata.is_empty() {
            return base.clone();
        }
        let mut merged = match base {
            Value::Object(m) => m.clone(),
            Value::Null => Map::new(),
            other => {
                let mut m = Map::new();
                m.insert("task".to_string(), other.clone());
                m
            }
        };
        merged.extend(self.metadata.clone());
        Value::Object(merged)
    }
}

tokio::task_local! {
    static CAPTURE: RefCell<TrialCapture>;
}

/// Run a future within a capture scope and return its output with what it reported.
pub async fn capture<F>(f: F) -> (F::Output, TrialCapture)
where
    F: Future,
{
    CAPTURE
        .scope(RefCell::new(TrialCapture::default()), async move {
            let output = f.await;
            let captured = CAPTURE.with(|c| c.take());
            (output, captured)
        })
        .await
}

/// Synchronous counterpart of [`capture`] for closures on threads the
/// trial's task-local doesn't reach, such as tokio's blocking pool.
pub(crate) fn capture_sync<R>(f: impl FnOnce() -> R) -> (R, TrialCapture) {
    CAPTURE.sync_scope(RefCell::new(TrialCapture::default()), || {
        let output = f();
        let captured = CAPTURE.with(|c| c.take());
        (output, captured)
    })
}

/// Merge reports gathered elsewhere into the current trial. No-op outside a trial.
pub(crate) fn absorb(captured: TrialCapture) {
    let _ = CAPTURE.try_with(|c| {
        let mut current = c.borrow_mut();
        current.traces.extend(captured.traces);
        current.metadata.extend(captured.metadata);
        current.trace_fields.extend(captured.trace_fields);
    });
}

/// Record a model/API call for the current trial. No-op outside a trial.
pub fn report_trace(trace: Trace) {
    let _ = CAPTURE.try_with(|c| c.borrow_mut().traces.push(trace));
}

/// Attach a metadata entry to the current trial's result.
pub fn set_metadata(key: impl Into<String>, value: Value) {
    let key = key.into();
    let _ = CAPTURE.try_with(|c| c.borrow_mut().metadata.insert(key, value));
}

/// Attach a top-level `trace_data` field (e.g. `messages`, `url`) to the current trial.
pub fn set_trace_field(key: impl Into<String>, value: Value) {
    let key = key.into();
    let _ = CAPTURE.try_with(|c| c.borrow_mut().trace_fields.insert(key, value));
}

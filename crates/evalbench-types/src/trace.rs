use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One model or API call made by a target while a trial was running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Span label chosen by the target (e.g. "plan", "tool:search")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub started_at: DateTime<Utc>,

    pub duration_ms: u64,

    /// Model name (e.g., "gpt-4o-mini")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub input: Value,

    pub output: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

impl Trace {
    /// Start timing a call; finish it with [`TraceBuilder::finish`].
    pub fn start(name: impl Into<String>) -> TraceBuilder {
        TraceBuilder {
            name: Some(name.into()),
            started_at: Utc::now(),
            model: None,
        }
    }
}

pub struct TraceBuilder {
    name: Option<String>,
    started_at: DateTime<Utc>,
    model: Option<String>,
}

impl TraceBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn finish(self, input: Value, output: Value, usage: Option<TokenUsage>) -> Trace {
        self.build(input, output, usage, None)
    }

    pub fn finish_with_error(self, input: Value, error: impl Into<String>) -> Trace {
        self.build(input, Value::Null, None, Some(error.into()))
    }

    fn build(
        self,
        input: Value,
        output: Value,
        usage: Option<TokenUsage>,
        error: Option<String>,
    ) -> Trace {
        let elapsed = Utc::now() - self.started_at;
        Trace {
            name: self.name,
            started_at: self.started_at,
            duration_ms: elapsed.num_milliseconds().max(0) as u64,
            model: self.model,
            input,
            output,
            usage,
            error,
        }
    }
}

use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::trace::{absorb, capture_sync};

/// The system under evaluation. Errors are recorded on the trial, never propagated.
#[async_trait]
pub trait Target: Send + Sync {
	async fn invoke(&self, input: &Value) -> Result<Value>;
}

/// Wrap an async closure as a `Target`.
pub fn from_async_fn<F, Fut>(f: F) -> Arc<dyn Target>
where
	F: Send + Sync + 'static + Fn(&Value) -> Fut,
	Fut: Future<Output = Result<Value>> + Send + 'static,
{
	struct AsyncFnTarget<F> {
		f: F,
	}

	#[async_trait]
	impl<F, Fut> Target for AsyncFnTarget<F>
	where
		F: Send + Sync + 'static + Fn(&Value) -> Fut,
		Fut: Future<Output = Result<Value>> + Send + 'static,
	{
		async fn invoke(&self, input: &Value) -> Result<Value> {
			(self.f)(input).await
		}
	}

	Arc::new(AsyncFnTarget { f })
}

/// Wrap a blocking closure as a `Target`. The call runs on tokio's blocking
/// pool; on timeout the trial is abandoned while the thread runs to completion.
/// Traces and metadata reported from the closure reach the trial as with
/// [`from_async_fn`].
pub fn from_fn<F>(f: F) -> Arc<dyn Target>
where
	F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
{
	struct BlockingTarget<F> {
		f: Arc<F>,
	}

	#[async_trait]
	impl<F> Target for BlockingTarget<F>
	where
		F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
	{
		async fn invoke(&self, input: &Value) -> Result<Value> {
			let f = Arc::clone(&self.f);
			let input = input.clone();
			match tokio::task::spawn_blocking(move || capture_sync(|| f(&input))).await {
				Ok((result, captured)) => {
					absorb(captured);
					result
				}
				// Re-raise so the scheduler records it as a panic.
				Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
				Err(err) => Err(err.into()),
			}
		}
	}

	Arc::new(BlockingTarget { f: Arc::new(f) })
}

/// Target that returns its input unchanged.
pub fn echo() -> Arc<dyn Target> {
	from_async_fn(|input| {
		let input = input.clone();
		async move { Ok(input) }
	})
}

/// Calls an HTTP endpoint. POST sends `{"input": <value>}`; GET encodes the
/// input as `?input=<json>`. Non-2xx responses are execution errors.
pub struct HttpTarget {
	client: reqwest::Client,
	url: String,
	method: HttpMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
	Get,
	Post,
}

impl HttpMethod {
	pub fn parse(method: &str) -> Self {
		if method.eq_ignore_ascii_case("GET") {
			HttpMethod::Get
		} else {
			HttpMethod::Post
		}
	}
}

impl HttpTarget {
	pub fn new(url: impl Into<String>, method: HttpMethod) -> Self {
		Self {
			client: reqwest::Client::new(),
			url: url.into(),
			method,
		}
	}
}

#[async_trait]
impl Target for HttpTarget {
	async fn invoke(&self, input: &Value) -> Result<Value> {
		let resp = match self.method {
			HttpMethod::Get => {
				let q = [("input", input.to_string())];
				self.client.get(&self.url).query(&q).send().await?
			}
			HttpMethod::Post => {
				self.client.post(&self.url).json(&json!({ "input": input })).send().await?
			}
		};
		let status = resp.status();
		let body = resp.text().await?;
		let value = serde_json::from_str(&body).unwrap_or(Value::String(body));
		if !status.is_success() {
			bail!("HTTP {}: {}", status.as_u16(), value);
		}
		crate::trace::set_trace_field("url", json!(self.url));
		Ok(value)
	}
}

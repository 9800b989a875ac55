use std::time::{Duration, Instant};

use evalbench_types::{ErrorKind, Score};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::grading::{grade, panic_message, TrialRecord};
use crate::registry::Task;
use crate::trace::{capture, TrialCapture};

/// Result of one trial after grading.
#[derive(Debug, Clone)]
pub struct TrialOutcome {
	pub trial: usize,
	pub output: Value,
	pub error: Option<String>,
	pub error_kind: Option<ErrorKind>,
	/// Seconds spent in the target.
	pub latency: f64,
	pub metadata: Value,
	pub trace_data: Value,
	pub scores: Vec<Score>,
}

/// Runs every trial of every task on a bounded pool.
pub struct Executor {
	concurrency: usize,
	default_timeout: Option<Duration>,
	interrupt: Option<watch::Receiver<bool>>,
}

impl Executor {
	pub fn new(concurrency: usize) -> Self {
		Self {
			concurrency: concurrency.max(1),
			default_timeout: None,
			interrupt: None,
		}
	}

	/// Used for tasks that don't declare their own timeout.
	pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
		self.default_timeout = timeout;
		self
	}

	/// Once the receiver reads `true`, no further trials start.
	pub fn interrupt(mut self, interrupt: watch::Receiver<bool>) -> Self {
		self.interrupt = Some(interrupt);
		self
	}

	/// Execute all trials. The returned vector is aligned with `tasks`; each
	/// entry holds that task's trials in trial order, and is empty when the
	/// run was interrupted before any of them started.
	pub async fn execute(&self, tasks: &[Task]) -> Vec<Vec<TrialOutcome>> {
		let jobs = tasks
			.iter()
			.enumerate()
			.flat_map(|(idx, task)| (0..task.trials()).map(move |trial| (idx, trial)));

		let stream = stream::iter(jobs).map(|(idx, trial)| {
			let task = tasks[idx].clone();
			let timeout = task.timeout_or(self.default_timeout);
			let interrupt = self.interrupt.clone();
			async move {
				if interrupt.as_ref().is_some_and(|rx| *rx.borrow()) {
					debug!(task = %task.key, trial, "skipping trial after interrupt");
					return None;
				}
				Some((idx, run_trial(&task, trial, timeout).await))
			}
		});

		let finished: Vec<(usize, TrialOutcome)> = stream
			.buffer_unordered(self.concurrency)
			.filter_map(futures::future::ready)
			.collect()
			.await;

		let mut by_task: Vec<Vec<TrialOutcome>> = vec![Vec::new(); tasks.len()];
		for (idx, outcome) in finished {
			by_task[idx].push(outcome);
		}
		for trials in &mut by_task {
			trials.sort_by_key(|t| t.trial);
		}
		by_task
	}
}

/// Invoke the target on its own tokio task so a panic or a timeout stays
/// local to this trial, then grade.
async fn run_trial(task: &Task, trial: usize, timeout: Option<Duration>) -> TrialOutcome {
	debug!(task = %task.key, trial, "trial started");
	let target = task.definition.target.clone();
	let input = task.input.clone();
	let started = Instant::now();
	let mut handle = tokio::spawn(capture(async move { target.invoke(&input).await }));

	let joined = match timeout {
		Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
			Ok(joined) => Some(joined),
			Err(_) => {
				handle.abort();
				None
			}
		},
		None => Some(handle.await),
	};
	let latency = started.elapsed().as_secs_f64();

	let (output, failure, captured) = match joined {
		Some(Ok((Ok(output), captured))) => (output, None, captured),
		Some(Ok((Err(err), captured))) => {
			(Value::Null, Some((ErrorKind::Execution, format!("{err:#}"))), captured)
		}
		Some(Err(join_err)) if join_err.is_panic() => {
			let msg = panic_message(join_err.into_panic());
			(Value::Null, Some((ErrorKind::Panic, format!("target panicked: {msg}"))), TrialCapture::default())
		}
		Some(Err(join_err)) => {
			(Value::Null, Some((ErrorKind::Execution, join_err.to_string())), TrialCapture::default())
		}
		None => {
			let limit = timeout.unwrap_or_default().as_secs_f64();
			let msg = format!("trial exceeded timeout of {limit:.3}s");
			(Value::Null, Some((ErrorKind::Timeout, msg)), TrialCapture::default())
		}
	};

	if let Some((kind, msg)) = &failure {
		warn!(task = %task.key, trial, kind = %kind, error = %msg, "trial failed");
	}

	let record = TrialRecord {
		key: task.key.clone(),
		trial,
		input: task.input.clone(),
		output,
		reference: task.reference.clone(),
		metadata: captured.merged_metadata(&task.metadata),
		trace_data: captured.trace_data(),
		error: failure.as_ref().map(|(kind, msg)| format!("{kind}: {msg}")),
		latency,
	};

	let definition = &task.definition;
	let scores = grade(&record, &definition.checks, &definition.evaluators, definition.short_circuit).await;
	debug!(task = %task.key, trial, latency, scores = scores.len(), "trial graded");

	TrialOutcome {
		trial,
		output: record.output,
		error: record.error,
		error_kind: failure.map(|(kind, _)| kind),
		latency,
		metadata: record.metadata,
		trace_data: record.trace_data,
		scores,
	}
}

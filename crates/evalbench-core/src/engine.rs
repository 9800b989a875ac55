//! Resolve, execute, aggregate, record.

use std::sync::Arc;

use chrono::Utc;
use evalbench_store::{generate_run_id, generate_run_name, RunRef, RunStore};
use evalbench_types::Run;
use tokio::sync::watch;
use tracing::{info, info_span, Instrument};

use crate::aggregate::reduce_trials;
use crate::config::RunConfig;
use crate::error::{EngineError, SelectorError};
use crate::registry::{EvalRegistry, Task};
use crate::scheduler::Executor;
use crate::selector::resolve;

/// A finished run and, when persisted, where it was written.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: Run,
    pub artifact: Option<RunRef>,
}

pub struct Engine {
    registry: Arc<EvalRegistry>,
    config: RunConfig,
}

impl Engine {
    pub fn new(registry: Arc<EvalRegistry>, config: RunConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn registry(&self) -> &EvalRegistry {
        &self.registry
    }

    /// Resolve with the configured dataset/label/limit filters. Nothing runs.
    pub fn resolve(&self, selector: &str) -> Result<Vec<Task>, SelectorError> {
        resolve(&self.registry, selector, &self.config.selection_filter())
    }

    pub async fn run(&self, selector: &str) -> Result<RunReport, EngineError> {
        let (_tx, rx) = watch::channel(false);
        self.run_with_interrupt(selector, rx).await
    }

    /// Once `interrupt` reads `true` no new trial starts. Tasks with at least
    /// one finished trial are kept and the run is marked interrupted.
    pub async fn run_with_interrupt(
        &self,
        selector: &str,
        interrupt: watch::Receiver<bool>,
    ) -> Result<RunReport, EngineError> {
        let tasks = self.resolve(selector)?;
        let config = &self.config;

        let store = if config.persist {
            Some(RunStore::open(&config.output_dir).map_err(EngineError::StoreUnavailable)?)
        } else {
            None
        };
        let run_id = match &store {
            Some(store) => store
                .allocate_run_id(&config.session_name)
                .map_err(EngineError::StoreUnavailable)?,
            None => generate_run_id(),
        };
        let run_name = config.run_name.clone().unwrap_or_else(generate_run_name);

        let span = info_span!("evalbench.run", run_id = %run_id, session = %config.session_name);
        let run = self
            .execute(tasks, run_id, run_name, interrupt)
            .instrument(span)
            .await;

        let Some(store) = store else {
            return Ok(RunReport { run, artifact: None });
        };
        match store.record(&run) {
            Ok(artifact) => Ok(RunReport {
                run,
                artifact: Some(artifact),
            }),
            Err(source) => Err(EngineError::Storage {
                run: Box::new(run),
                source,
            }),
        }
    }

    async fn execute(
        &self,
        tasks: Vec<Task>,
        run_id: String,
        run_name: String,
        interrupt: watch::Receiver<bool>,
    ) -> Run {
        let config = &self.config;
        let created_at = Utc::now();
        info!(
            event = "run.started",
            run_name = %run_name,
            tasks = tasks.len(),
            concurrency = config.concurrency,
        );

        let executor = Executor::new(config.concurrency)
            .default_timeout(config.default_timeout())
            .interrupt(interrupt);
        let trials = executor.execute(&tasks).await;

        let interrupted = tasks.iter().zip(&trials).any(|(task, t)| t.len() < task.trials());
        let results = tasks
            .iter()
            .zip(trials)
            .filter_map(|(task, trials)| reduce_trials(task, trials, &config.primary_key))
            .collect();

        let mut run = Run {
            session_name: config.session_name.clone(),
            run_name,
            run_id,
            created_at,
            primary_key: config.primary_key.clone(),
            interrupted,
            total_evaluations: 0,
            total_passed: 0,
            total_errors: 0,
            results,
        };
        run.refresh_summary();

        info!(
            event = "run.finished",
            total = run.total_evaluations,
            passed = run.total_passed,
            errors = run.total_errors,
            interrupted,
        );
        run
    }
}

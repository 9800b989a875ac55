//! evalbench-core: declare evals, resolve selectors into tasks, run trials on
//! a bounded pool, grade and aggregate them, and record the run.
//! See `examples/quickstart.rs` for a walkthrough.

pub mod aggregate;
pub mod compare;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluators;
pub mod filter;
pub mod grading;
pub mod registry;
pub mod scheduler;
pub mod selector;
pub mod suite;
pub mod target;
pub mod testing;
pub mod trace;

pub use aggregate::{reduce_trials, TrialReduction};
pub use compare::{compare, Cell, Comparison, ComparisonRow, MetricDelta, RunLabel};
pub use config::RunConfig;
pub use engine::{Engine, RunReport};
pub use error::{CompareError, EngineError, RegistryError, SelectorError};
pub use evaluators::{Contains, ExactMatch, JsonValid, Levenshtein, RegexMatch};
pub use filter::{CompareOp, PassFilter, ResultFilter, ScoreFilter};
pub use grading::{evaluator_fn, grade, Check, Evaluator, TrialRecord};
pub use registry::{EvalCase, EvalDefinition, EvalRegistry, Task};
pub use scheduler::{Executor, TrialOutcome};
pub use selector::{resolve, SelectionFilter, Selector};
pub use suite::{load_suite, load_suites};
pub use target::{echo, from_async_fn, from_fn, HttpMethod, HttpTarget, Target};
pub use trace::{capture, report_trace, set_metadata, set_trace_field, TrialCapture};

pub use evalbench_store::{RunRef, RunStore, StoreError};
pub use evalbench_types::{
    CorrectionEntry, ErrorKind, EvalOutcome, ResultEntry, Run, RunSummary, Score, TaskKey, TokenUsage, Trace,
    DEFAULT_SCORE_KEY,
};

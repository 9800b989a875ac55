use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use evalbench_core::{
	compare, load_suites, Engine, EngineError, PassFilter, ResultEntry, ResultFilter, Run, RunConfig, RunStore,
	ScoreFilter, TaskKey,
};
use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_OUTPUT: &str = ".evalbench/runs";

#[derive(Debug, Parser)]
#[command(name = "evalbench", about = "Run eval suites and inspect recorded runs")]
struct Cli {
	/// Debug-level logs (EVALBENCH_LOG overrides)
	#[arg(short, long, global = true, action = ArgAction::SetTrue)]
	verbose: bool,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
	/// Run the evals addressed by a selector, e.g. `evals/math.yaml::add@c1,sub`
	Run(RunArgs),
	/// List sessions and their runs
	Sessions(StoreArgs),
	/// Show one run's results
	Show(ShowArgs),
	/// Rename a recorded run
	Rename(RenameArgs),
	/// Align two or more runs by task
	Compare(CompareArgs),
	/// Amend a score field of a recorded result
	Correct(CorrectArgs),
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
	/// `path[::function[@case][,...]]`; path is a suite manifest or a directory of them
	selector: String,

	/// Where to load manifests from (defaults to the selector's path)
	#[arg(long)]
	suites: Option<PathBuf>,

	/// YAML run config; flags override its values
	#[arg(long)]
	config: Option<PathBuf>,

	/// Trials in flight at once
	#[arg(long)]
	concurrency: Option<usize>,

	/// Default per-trial timeout in seconds
	#[arg(long)]
	timeout: Option<f64>,

	#[arg(long)]
	session: Option<String>,

	#[arg(long)]
	run_name: Option<String>,

	/// Store root
	#[arg(long)]
	output: Option<PathBuf>,

	/// Don't persist the run
	#[arg(long, action = ArgAction::SetTrue)]
	no_save: bool,

	#[arg(long = "dataset")]
	datasets: Vec<String>,

	#[arg(long = "exclude-dataset")]
	exclude_datasets: Vec<String>,

	#[arg(long = "label")]
	labels: Vec<String>,

	#[arg(long = "exclude-label")]
	exclude_labels: Vec<String>,

	/// Run at most N tasks
	#[arg(long)]
	limit: Option<usize>,

	/// Also write the run as JSON to this file
	#[arg(long)]
	json_out: Option<PathBuf>,
}

impl RunArgs {
	fn run_config(&self) -> Result<RunConfig> {
		let mut config = match &self.config {
			Some(path) => RunConfig::from_yaml_file(path)?,
			None => RunConfig::default(),
		};
		if let Some(n) = self.concurrency {
			config.concurrency = n.max(1);
		}
		if self.timeout.is_some() {
			config.timeout_secs = self.timeout;
		}
		if let Some(session) = &self.session {
			config.session_name = session.clone();
		}
		if self.run_name.is_some() {
			config.run_name = self.run_name.clone();
		}
		if let Some(output) = &self.output {
			config.output_dir = output.clone();
		}
		if self.no_save {
			config.persist = false;
		}
		extend(&mut config.datasets, &self.datasets);
		extend(&mut config.exclude_datasets, &self.exclude_datasets);
		extend(&mut config.labels, &self.labels);
		extend(&mut config.exclude_labels, &self.exclude_labels);
		if self.limit.is_some() {
			config.limit = self.limit;
		}
		Ok(config)
	}

	fn suites_root(&self) -> Result<PathBuf> {
		if let Some(root) = &self.suites {
			return Ok(root.clone());
		}
		let path = self.selector.split("::").next().unwrap_or_default().trim();
		if path.is_empty() {
			bail!("Selector '{}' has no path; pass --suites", self.selector);
		}
		Ok(PathBuf::from(path))
	}
}

fn extend(into: &mut Vec<String>, from: &[String]) {
	for item in from {
		if !into.contains(item) {
			into.push(item.clone());
		}
	}
}

#[derive(Debug, Clone, Args)]
struct StoreArgs {
	/// Store root
	#[arg(long, default_value = DEFAULT_OUTPUT)]
	output: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct ShowArgs {
	session: String,

	/// Run id or name
	run: String,

	#[command(flatten)]
	store: StoreArgs,

	#[arg(long = "dataset")]
	datasets: Vec<String>,

	#[arg(long = "exclude-dataset")]
	exclude_datasets: Vec<String>,

	#[arg(long = "label")]
	labels: Vec<String>,

	#[arg(long = "exclude-label")]
	exclude_labels: Vec<String>,

	/// Case-insensitive text search
	#[arg(long)]
	search: Option<String>,

	#[arg(long)]
	has_error: Option<bool>,

	#[arg(long)]
	has_trace: Option<bool>,

	#[arg(long)]
	has_url: Option<bool>,

	#[arg(long)]
	has_messages: Option<bool>,

	/// Numeric score condition, e.g. `accuracy>=0.8` (repeatable)
	#[arg(long = "score")]
	scores: Vec<ScoreFilter>,

	/// Pass flag condition, e.g. `pass=false` (repeatable)
	#[arg(long = "passed")]
	passed: Vec<PassFilter>,

	#[arg(long)]
	limit: Option<usize>,

	/// Print matching results as JSON
	#[arg(long, action = ArgAction::SetTrue)]
	json: bool,
}

impl ShowArgs {
	fn filter(&self) -> ResultFilter {
		ResultFilter {
			datasets: self.datasets.clone(),
			exclude_datasets: self.exclude_datasets.clone(),
			labels: self.labels.clone(),
			exclude_labels: self.exclude_labels.clone(),
			search: self.search.clone(),
			has_error: self.has_error,
			has_trace: self.has_trace,
			has_url: self.has_url,
			has_messages: self.has_messages,
			score_filters: self.scores.clone(),
			pass_filters: self.passed.clone(),
			limit: self.limit,
		}
	}
}

#[derive(Debug, Clone, Args)]
struct RenameArgs {
	run_id: String,
	new_name: String,

	/// Required when the run id exists in more than one session
	#[arg(long)]
	session: Option<String>,

	#[command(flatten)]
	store: StoreArgs,
}

#[derive(Debug, Clone, Args)]
struct CompareArgs {
	/// Runs as `<session>/<run id or name>`
	#[arg(required = true, num_args = 2..)]
	runs: Vec<String>,

	#[command(flatten)]
	store: StoreArgs,

	#[arg(long, action = ArgAction::SetTrue)]
	json: bool,
}

#[derive(Debug, Clone, Args)]
struct CorrectArgs {
	session: String,

	/// Run id or name
	run: String,

	#[arg(long)]
	function: String,

	#[arg(long)]
	case: Option<String>,

	/// Only needed when the function name exists in several datasets
	#[arg(long)]
	dataset: Option<String>,

	/// `scores.<key>.<passed|value|notes>`
	#[arg(long)]
	field: String,

	/// New value as JSON; bare text is taken as a string
	#[arg(long)]
	value: String,

	#[command(flatten)]
	store: StoreArgs,
}

fn init_logging(verbose: bool) {
	let level = if verbose { "debug" } else { "warn" };
	let filter = EnvFilter::try_from_env("EVALBENCH_LOG").unwrap_or_else(|_| EnvFilter::new(level));

	fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.compact()
		.init();
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	let run_config = match &cli.command {
		Commands::Run(args) => Some(args.run_config()?),
		_ => None,
	};
	let verbose = cli.verbose || run_config.as_ref().is_some_and(|c| c.verbose);
	init_logging(verbose);

	match cli.command {
		Commands::Run(args) => {
			let config = RunConfig {
				verbose,
				..run_config.unwrap_or_default()
			};
			run(args, config).await
		}
		Commands::Sessions(args) => sessions(args),
		Commands::Show(args) => show(args),
		Commands::Rename(args) => rename(args),
		Commands::Compare(args) => compare_runs(args),
		Commands::Correct(args) => correct(args),
	}
}

async fn run(args: RunArgs, config: RunConfig) -> Result<()> {
	let root = args.suites_root()?;
	let registry = load_suites(&root)
		.await
		.with_context(|| format!("Failed to load suites from {:?}", root))?;
	let engine = Engine::new(Arc::new(registry), config);

	let (tx, rx) = watch::channel(false);
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			warn!("interrupt received, waiting for in-flight trials");
			let _ = tx.send(true);
		}
	});

	let report = match engine.run_with_interrupt(&args.selector, rx).await {
		Ok(report) => report,
		Err(EngineError::Storage { run, source }) => {
			println!("{}", run.summary_table());
			return Err(anyhow::Error::new(source).context(format!("Run {} could not be saved", run.run_id)));
		}
		Err(err) => return Err(err.into()),
	};

	println!("{}", report.run.summary_table());
	if let Some(artifact) = &report.artifact {
		println!("Saved {}", artifact.path.display());
	}
	if let Some(path) = args.json_out {
		let json = serde_json::to_string_pretty(&report.run)?;
		tokio::fs::write(&path, json)
			.await
			.with_context(|| format!("Failed to write {:?}", path))?;
	}
	Ok(())
}

fn sessions(args: StoreArgs) -> Result<()> {
	let store = RunStore::open(&args.output)?;
	let sessions = store.sessions()?;
	if sessions.is_empty() {
		println!("No sessions under {}", args.output.display());
	}
	for session in sessions {
		println!("{} ({} runs)", session.name, session.runs.len());
		for run in &session.runs {
			println!("  {}  {}  {}", run.run_id, run.created_at.to_rfc3339(), run.run_name);
		}
	}
	Ok(())
}

fn show(args: ShowArgs) -> Result<()> {
	let store = RunStore::open(&args.store.output)?;
	let artifact = store.find_run(&args.session, &args.run)?;
	let run = store.load(&artifact)?;
	let filter = args.filter();
	let kept: Vec<ResultEntry> = filter.apply(&run).into_iter().cloned().collect();

	if args.json {
		println!("{}", serde_json::to_string_pretty(&kept)?);
		return Ok(());
	}
	let mut view = Run { results: kept, ..run };
	view.refresh_summary();
	println!("{}", view.summary_table());
	Ok(())
}

fn rename(args: RenameArgs) -> Result<()> {
	let store = RunStore::open(&args.store.output)?;
	let renamed = store.rename_run(&args.run_id, &args.new_name, args.session.as_deref())?;
	println!("Renamed {}/{} to {}", renamed.session_name, renamed.run_id, renamed.run_name);
	Ok(())
}

fn compare_runs(args: CompareArgs) -> Result<()> {
	let store = RunStore::open(&args.store.output)?;
	let runs = args
		.runs
		.iter()
		.map(|arg| -> Result<Run> {
			let (session, run) = arg
				.split_once('/')
				.ok_or_else(|| anyhow!("Expected <session>/<run>, got '{arg}'"))?;
			let artifact = store.find_run(session, run)?;
			Ok(store.load(&artifact)?)
		})
		.collect::<Result<Vec<_>>>()?;

	let comparison = compare(&runs)?;
	if args.json {
		println!("{}", serde_json::to_string_pretty(&comparison)?);
	} else {
		println!("{}", comparison.table());
	}
	Ok(())
}

fn correct(args: CorrectArgs) -> Result<()> {
	let store = RunStore::open(&args.store.output)?;
	let artifact = store.find_run(&args.session, &args.run)?;
	let run = store.load(&artifact)?;

	let candidates: Vec<TaskKey> = run
		.results
		.iter()
		.map(ResultEntry::key)
		.filter(|k| {
			k.function == args.function
				&& k.case_id == args.case
				&& args.dataset.as_ref().map_or(true, |d| &k.dataset == d)
		})
		.collect();
	let key = match candidates.as_slice() {
		[key] => key.clone(),
		[] => bail!("No result for function '{}' case {:?} in run {}", args.function, args.case, run.run_id),
		_ => bail!("Function '{}' exists in several datasets; pass --dataset", args.function),
	};

	let value = serde_json::from_str(&args.value).unwrap_or(Value::String(args.value.clone()));
	let entry = store.correct(&artifact, &key, &args.field, value)?;
	println!("{}: {} -> {} ({})", key, entry.before, entry.after, entry.field);
	Ok(())
}

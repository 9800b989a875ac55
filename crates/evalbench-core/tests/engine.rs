use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use evalbench_core::{
    compare, echo, evaluator_fn, from_async_fn, from_fn, load_suite, set_metadata, set_trace_field, Check, Engine,
    EngineError, ErrorKind, EvalCase, EvalDefinition, EvalRegistry, ResultFilter, RunConfig, RunStore, Score,
    SelectorError, StoreError, TaskKey, TrialReduction,
};
use serde_json::{json, Value};
use tokio::sync::watch;

fn config(dir: &tempfile::TempDir) -> RunConfig {
    RunConfig {
        output_dir: dir.path().join("runs"),
        session_name: "ci".into(),
        ..RunConfig::default()
    }
}

fn calculator() -> EvalRegistry {
    let target = from_fn(|input| match input.as_str() {
        Some("2+2") => Ok(json!("4")),
        Some("3*3") => Ok(json!("9")),
        _ => anyhow::bail!("unsupported expression {input}"),
    });
    let mut registry = EvalRegistry::new();
    registry
        .register(
            EvalDefinition::new("evals/calc.yaml", "arithmetic", target)
                .cases(vec![
                    EvalCase::with_id("add", json!("2+2"), json!("4")),
                    EvalCase::with_id("mul", json!("3*3"), json!("9")),
                    EvalCase::with_id("div", json!("1/0"), json!("inf")),
                ])
                .check(Check::output_equals_reference()),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn passing_case_records_single_pass_score() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(Arc::new(calculator()), config(&dir));
    let report = engine.run("evals/calc.yaml::arithmetic@add").await.unwrap();

    let run = &report.run;
    assert_eq!(run.results.len(), 1);
    let result = &run.results[0].result;
    assert_eq!(result.scores, vec![Score::pass()]);
    assert!(result.error.is_none());
    assert_eq!((run.total_evaluations, run.total_passed, run.total_errors), (1, 1, 0));

    let artifact = report.artifact.expect("run should be persisted");
    assert_eq!(
        artifact.path.file_name().unwrap().to_string_lossy(),
        format!("{}_{}.json", run.run_name, run.run_id)
    );
    let raw: Value = serde_json::from_slice(&std::fs::read(&artifact.path).unwrap()).unwrap();
    assert_eq!(raw["session_name"], json!("ci"));
    assert_eq!(raw["total_evaluations"], json!(1));
    assert_eq!(raw["results"][0]["function"], json!("arithmetic"));
    assert_eq!(raw["results"][0]["dataset"], json!("calc"));
    assert_eq!(raw["results"][0]["result"]["scores"], json!([{"key": "pass", "passed": true}]));
    assert_eq!(raw["results"][0]["result"]["error"], Value::Null);
    assert_eq!(raw["results"][0]["result"]["correction_history"], json!([]));
}

#[tokio::test]
async fn raising_target_yields_one_errored_result() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(Arc::new(calculator()), config(&dir));
    let run = engine.run("evals/calc.yaml").await.unwrap().run;

    assert_eq!(run.results.len(), 3);
    let div = run.find(&TaskKey::new("calc", "arithmetic", Some("div".into()))).unwrap();
    assert_eq!(div.result.error_kind, Some(ErrorKind::Execution));
    assert_eq!(div.result.error.as_deref(), Some("ExecutionError: unsupported expression \"1/0\""));
    assert!(!div.passed("pass"));
    assert_eq!(div.score("pass").and_then(|s| s.passed), Some(false));
    assert_eq!((run.total_passed, run.total_errors), (2, 1));
}

#[tokio::test]
async fn unknown_selector_runs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut registry = EvalRegistry::new();
    registry
        .register(EvalDefinition::new(
            "evals/count.yaml",
            "counted",
            from_fn(move |input| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(input.clone())
            }),
        ))
        .unwrap();
    let engine = Engine::new(Arc::new(registry), config(&dir));

    let err = engine.run("evals/count.yaml::counted,missing").await.unwrap_err();
    match err {
        EngineError::Selector(SelectorError::Unresolved { identifiers, .. }) => {
            assert_eq!(identifiers, vec!["function 'missing'".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    let err = engine.run("evals/other.yaml").await.unwrap_err();
    assert!(matches!(err, EngineError::Selector(SelectorError::UnknownSource(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("runs").join("ci").exists());
}

#[tokio::test]
async fn rerun_is_idempotent_apart_from_identity() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(Arc::new(calculator()), config(&dir));
    let first = engine.run("evals/calc.yaml").await.unwrap();
    let second = engine.run("evals/calc.yaml").await.unwrap();

    assert_ne!(first.run.run_id, second.run.run_id);
    let strip = |run: &evalbench_core::Run| {
        let mut results = run.results.clone();
        for r in &mut results {
            r.result.latency = None;
        }
        results
    };
    assert_eq!(strip(&first.run), strip(&second.run));

    let store = RunStore::open(dir.path().join("runs")).unwrap();
    assert_eq!(store.runs("ci").unwrap().len(), 2);
    let reloaded = store.load(first.artifact.as_ref().unwrap()).unwrap();
    assert_eq!(reloaded.results.len(), 3);
}

#[tokio::test]
async fn run_level_timeout_applies_unless_task_overrides() {
    let slow = || {
        from_async_fn(|input| {
            let input = input.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(input)
            }
        })
    };
    let mut registry = EvalRegistry::new();
    registry.register(EvalDefinition::new("t.yaml", "bounded", slow())).unwrap();
    registry
        .register(EvalDefinition::new("t.yaml", "patient", slow()).timeout(Duration::from_secs(5)))
        .unwrap();
    let config = RunConfig {
        persist: false,
        timeout_secs: Some(0.05),
        concurrency: 2,
        ..RunConfig::default()
    };
    let run = Engine::new(Arc::new(registry), config).run("t.yaml").await.unwrap().run;

    let bounded = &run.results[0].result;
    assert_eq!(bounded.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(bounded.error.as_deref(), Some("TimeoutError: trial exceeded timeout of 0.050s"));
    assert!(run.results[1].result.error.is_none());
}

#[tokio::test]
async fn pass_at_k_over_flaky_target() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let flaky = {
        let attempts = attempts.clone();
        from_fn(move |_| {
            // Every other call answers correctly.
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            Ok(json!(if n % 2 == 0 { "right" } else { "wrong" }))
        })
    };
    let mut registry = EvalRegistry::new();
    for (function, reduction) in [("any", TrialReduction::PassAtK), ("all", TrialReduction::PassHatK)] {
        registry
            .register(
                EvalDefinition::new("k.yaml", function, flaky.clone())
                    .reference(json!("right"))
                    .check(Check::output_equals_reference())
                    .trials(2)
                    .reduction(reduction),
            )
            .unwrap();
    }
    let config = RunConfig { persist: false, ..RunConfig::default() };
    let run = Engine::new(Arc::new(registry), config).run("k.yaml").await.unwrap().run;

    assert!(run.results[0].passed("pass"));
    assert!(!run.results[1].passed("pass"));
    assert_eq!(run.results[0].result.metadata["trials"]["count"], json!(2));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn interrupted_run_keeps_completed_work() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    let target = {
        let tx = tx.clone();
        from_async_fn(move |input| {
            let tx = tx.clone();
            let input = input.clone();
            async move {
                if input == json!(1) {
                    let _ = tx.send(true);
                }
                Ok(input)
            }
        })
    };
    let mut registry = EvalRegistry::new();
    registry
        .register(
            EvalDefinition::new("i.yaml", "stream", target)
                .cases((0..5).map(|i| EvalCase::new(json!(i), json!(i))))
                .check(Check::output_equals_reference()),
        )
        .unwrap();
    let engine = Engine::new(Arc::new(registry), config(&dir));
    let report = engine.run_with_interrupt("i.yaml", rx).await.unwrap();

    assert!(report.run.interrupted);
    assert_eq!(report.run.results.len(), 2);
    assert_eq!(report.run.total_passed, 2);
    let saved = RunStore::load_path(&report.artifact.unwrap().path).unwrap();
    assert!(saved.interrupted);
}

#[tokio::test]
async fn storage_failure_still_returns_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig {
        run_name: Some("bad/name".into()),
        ..config(&dir)
    };
    let engine = Engine::new(Arc::new(calculator()), config);
    match engine.run("evals/calc.yaml").await.unwrap_err() {
        EngineError::Storage { run, source } => {
            assert_eq!(run.results.len(), 3);
            assert!(matches!(source, StoreError::InvalidName(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn correct_compare_and_filter_persisted_runs() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(Arc::new(calculator()), config(&dir));
    let baseline = engine.run("evals/calc.yaml::arithmetic@add,arithmetic@div").await.unwrap();
    let candidate = engine.run("evals/calc.yaml::arithmetic@add,arithmetic@mul").await.unwrap();

    let store = RunStore::open(dir.path().join("runs")).unwrap();
    let add = TaskKey::new("calc", "arithmetic", Some("add".into()));
    let artifact = candidate.artifact.unwrap();
    store.correct(&artifact, &add, "scores.pass.passed", json!(false)).unwrap();

    let runs = vec![
        store.load(baseline.artifact.as_ref().unwrap()).unwrap(),
        store.load(&artifact).unwrap(),
    ];
    let cmp = compare(&runs).unwrap();
    let order: Vec<Option<&str>> = cmp.rows.iter().map(|r| r.key.case_id.as_deref()).collect();
    assert_eq!(order, vec![Some("add"), Some("div"), Some("mul")]);

    let add_row = cmp.row(&add).unwrap();
    let pass = add_row.deltas.iter().find(|d| d.key == "pass").unwrap();
    assert_eq!(pass.deltas, vec![Some(0.0), Some(-1.0)]);
    assert!(cmp.rows[1].cells[1].entry().is_none());
    assert!(cmp.rows[2].cells[0].entry().is_none());

    let errors = ResultFilter { has_error: Some(true), ..Default::default() };
    let errored = errors.apply(&runs[0]);
    assert_eq!(errored.len(), 1);
    assert_eq!(errored[0].case_id.as_deref(), Some("div"));
}

#[tokio::test]
async fn manifest_suite_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("greetings.yaml");
    std::fs::write(
        &manifest,
        r#"
target:
  type: echo
evals:
  - function: echo_back
    labels: [smoke]
    cases:
      - {id: hi, input: hello, reference: hello}
      - {id: bye, input: goodbye, reference: farewell}
    evaluators:
      - type: exact
      - type: levenshtein
        threshold: 0.3
"#,
    )
    .unwrap();
    let mut registry = EvalRegistry::new();
    load_suite(&manifest, &mut registry).await.unwrap();

    let config = RunConfig {
        labels: vec!["smoke".into()],
        ..config(&dir)
    };
    let selector = format!("{}::echo_back", manifest.to_string_lossy().replace('\\', "/"));
    let run = Engine::new(Arc::new(registry), config).run(&selector).await.unwrap().run;

    assert_eq!(run.results.len(), 2);
    let hi = &run.results[0];
    assert!(hi.passed("pass"));
    assert_eq!(hi.score("exact_match").and_then(|s| s.passed), Some(true));
    let bye = &run.results[1];
    assert!(!bye.passed("pass"));
    assert!(bye.score("levenshtein").and_then(|s| s.value).is_some());
}

#[tokio::test]
async fn panicking_check_fails_only_its_task() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = EvalRegistry::new();
    registry
        .register(
            EvalDefinition::new("m.yaml", "fragile", echo())
                .input(json!(1))
                .reference(json!(1))
                .check(Check::new("output is empty text", |t| t.output.as_str().unwrap().is_empty())),
        )
        .unwrap();
    registry
        .register(
            EvalDefinition::new("m.yaml", "healthy", echo())
                .input(json!("ok"))
                .reference(json!("ok"))
                .check(Check::output_equals_reference()),
        )
        .unwrap();

    let run = Engine::new(Arc::new(registry), config(&dir)).run("m.yaml").await.unwrap().run;
    assert_eq!(run.results.len(), 2);
    let fragile = &run.results[0];
    assert!(!fragile.passed("pass"));
    assert!(fragile.score("pass").and_then(|s| s.notes.as_deref()).unwrap().starts_with("check panicked: "));
    assert!(run.results[1].passed("pass"));
    assert_eq!((run.total_passed, run.total_errors), (1, 0));
}

#[tokio::test]
async fn non_finite_evaluator_score_keeps_artifact_usable() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = EvalRegistry::new();
    registry
        .register(
            EvalDefinition::new("r.yaml", "ratio", echo())
                .input(json!("a"))
                .reference(json!("a"))
                .check(Check::output_equals_reference())
                .evaluator(evaluator_fn("ratio", |_| Ok(Score::numeric("ratio", f64::NAN)))),
        )
        .unwrap();

    let report = Engine::new(Arc::new(registry), config(&dir)).run("r.yaml").await.unwrap();
    let artifact = report.artifact.unwrap();
    let loaded = RunStore::load_path(&artifact.path).unwrap();
    let ratio = loaded.results[0].score("ratio").unwrap();
    assert_eq!(ratio.passed, Some(false));
    assert!(ratio.notes.as_deref().unwrap().contains("invalid score"));
    assert!(loaded.results[0].passed("pass"));

    let store = RunStore::open(dir.path().join("runs")).unwrap();
    let key = TaskKey::new("r", "ratio", None);
    store.correct(&artifact, &key, "scores.ratio.value", json!(0.5)).unwrap();
    assert_eq!(store.load(&artifact).unwrap().results[0].score("ratio").unwrap().value, Some(0.5));
}

#[tokio::test]
async fn multiple_failed_checks_yield_one_correctable_pass() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = EvalRegistry::new();
    registry
        .register(
            EvalDefinition::new("c.yaml", "sum", echo())
                .input(json!("five"))
                .reference(json!("4"))
                .check(Check::output_equals_reference())
                .check(Check::output_contains("4")),
        )
        .unwrap();

    let report = Engine::new(Arc::new(registry), config(&dir)).run("c.yaml").await.unwrap();
    let scores = &report.run.results[0].result.scores;
    assert_eq!(scores.iter().filter(|s| s.key == "pass").count(), 1);

    let store = RunStore::open(dir.path().join("runs")).unwrap();
    let artifact = report.artifact.unwrap();
    store
        .correct(&artifact, &TaskKey::new("c", "sum", None), "scores.pass.passed", json!(true))
        .unwrap();
    let corrected = store.load(&artifact).unwrap();
    assert!(corrected.results[0].passed("pass"));
    assert_eq!(corrected.total_passed, 1);
}

#[tokio::test]
async fn sync_target_reports_land_on_the_result() {
    let dir = tempfile::tempdir().unwrap();
    let target = from_fn(|input| {
        set_trace_field("url", json!("http://localhost:8080/v1"));
        set_metadata("model", json!("local-7b"));
        Ok(input.clone())
    });
    let mut registry = EvalRegistry::new();
    registry
        .register(EvalDefinition::new("s.yaml", "local", target).input(json!("hi")).reference(json!("hi")))
        .unwrap();

    let run = Engine::new(Arc::new(registry), config(&dir)).run("s.yaml").await.unwrap().run;
    let result = &run.results[0].result;
    assert_eq!(result.trace_data["url"], json!("http://localhost:8080/v1"));
    assert_eq!(result.metadata["model"], json!("local-7b"));
}

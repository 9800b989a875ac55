use anyhow::Result;
use evalbench_types::Run;

/// Helper to assert a run's pass rate meets a threshold.
///
/// Use this in your `#[tokio::test]` functions.
///
/// # Example
/// ```ignore
/// #[tokio::test]
/// async fn test_my_agent() -> Result<()> {
///     let engine = Engine::new(Arc::new(registry), RunConfig { persist: false, ..Default::default() });
///     let report = engine.run("evals/agent.yaml").await?;
///
///     // Assert 80% pass rate
///     assert_run_pass_rate(&report.run, 0.8)?;
///
///     Ok(())
/// }
/// ```
pub fn assert_run_pass_rate(run: &Run, min_pass_rate: f64) -> Result<()> {
    let pass_rate = run.summary().pass_rate();
    if pass_rate < min_pass_rate {
        anyhow::bail!(
            "Evaluation failed: pass rate {:.1}% is below threshold {:.1}%\n{}",
            pass_rate * 100.0,
            min_pass_rate * 100.0,
            run.summary_table()
        );
    }
    Ok(())
}

/// Helper to assert all results passed.
pub fn assert_run_all_passed(run: &Run) -> Result<()> {
    if run.total_passed != run.total_evaluations {
        anyhow::bail!(
            "Evaluation failed: {}/{} results passed\n{}",
            run.total_passed,
            run.total_evaluations,
            run.summary_table()
        );
    }
    Ok(())
}

/// Helper to assert no target raised, panicked or timed out.
pub fn assert_no_errors(run: &Run) -> Result<()> {
    if run.total_errors > 0 {
        anyhow::bail!(
            "Evaluation failed: {} of {} results errored\n{}",
            run.total_errors,
            run.total_evaluations,
            run.summary_table()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use evalbench_types::{EvalOutcome, ResultEntry, Score, DEFAULT_SCORE_KEY};
    use serde_json::{json, Value};

    fn run(passed: &[bool]) -> Run {
        let results = passed
            .iter()
            .enumerate()
            .map(|(i, p)| ResultEntry {
                function: format!("f{i}"),
                dataset: "d".into(),
                case_id: None,
                labels: vec![],
                result: EvalOutcome {
                    input: json!(i),
                    output: json!(i),
                    reference: json!(i),
                    scores: vec![Score::pass_fail(DEFAULT_SCORE_KEY, *p)],
                    error: None,
                    error_kind: None,
                    latency: Some(0.0),
                    metadata: Value::Null,
                    trace_data: Value::Null,
                    correction_history: vec![],
                },
            })
            .collect();
        let mut run = Run {
            session_name: "s".into(),
            run_name: "r".into(),
            run_id: "abc".into(),
            created_at: Utc::now(),
            primary_key: DEFAULT_SCORE_KEY.into(),
            interrupted: false,
            total_evaluations: 0,
            total_passed: 0,
            total_errors: 0,
            results,
        };
        run.refresh_summary();
        run
    }

    #[test]
    fn thresholds() {
        let run = run(&[true, true, true, false]);
        assert!(assert_run_pass_rate(&run, 0.75).is_ok());
        let err = assert_run_pass_rate(&run, 0.8).unwrap_err();
        assert!(err.to_string().contains("75.0%"));
        assert!(assert_run_all_passed(&run).is_err());
        assert!(assert_no_errors(&run).is_ok());
    }
}

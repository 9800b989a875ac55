use std::sync::Arc;

use evalbench_core::{
    from_async_fn, report_trace, Check, Engine, EvalCase, EvalDefinition, EvalRegistry, ExactMatch, Levenshtein,
    RunConfig, TokenUsage, Trace, TrialReduction,
};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Target: append " World!" to any string input, reporting a fake model call.
    let target = from_async_fn(|input| {
        let input = input.clone();
        async move {
            let s = input.as_str().unwrap_or_default();
            let output = json!(format!("{s} World!"));
            let trace = Trace::start("greet").model("echo-1").finish(
                input.clone(),
                output.clone(),
                Some(TokenUsage { input_tokens: 3, output_tokens: 4 }),
            );
            report_trace(trace);
            Ok(output)
        }
    });

    let mut registry = EvalRegistry::new();
    registry.register(
        EvalDefinition::new("evals/greetings.yaml", "greet", target)
            .cases(vec![
                EvalCase::with_id("hello", json!("Hello"), json!("Hello World!")),
                EvalCase::with_id("hi", json!("Hi"), json!("Hi World!")),
            ])
            .check(Check::output_equals_reference())
            .evaluator(Arc::new(ExactMatch))
            .evaluator(Arc::new(Levenshtein::new(0.9)))
            .trials(3)
            .reduction(TrialReduction::PassHatK),
    )?;

    let config = RunConfig {
        concurrency: 4,
        persist: false,
        ..RunConfig::default()
    };
    let engine = Engine::new(Arc::new(registry), config);

    // Run the whole file, then a single case.
    let report = engine.run("evals/greetings.yaml").await?;
    println!("{}", report.run.summary_table());

    let report = engine.run("evals/greetings.yaml::greet@hi").await?;
    println!("{}", report.run.summary_table());

    Ok(())
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use teleprompt::*;

fn trajectory_with(
    program: Arc<dyn Program>,
    question: &str,
    answer: &str,
    score: f64,
    exec_id: usize,
) -> Trajectory {
    let example = qa_example(question, answer);
    Trajectory {
        inputs: example.inputs(),
        example,
        outputs: Some(prediction(&[("answer", answer)])),
        score,
        duration: Duration::from_millis(3),
        model_config: ModelConfig::default(),
        success: true,
        error: None,
        exec_id,
        program,
    }
}

fn failed_trajectory(program: Arc<dyn Program>, question: &str, exec_id: usize) -> Trajectory {
    let example = qa_example(question, "2");
    Trajectory {
        inputs: example.inputs(),
        example,
        outputs: None,
        score: 0.0,
        duration: Duration::from_millis(3),
        model_config: ModelConfig::default(),
        success: false,
        error: Some("provider exploded".to_string()),
        exec_id,
        program,
    }
}

#[tokio::test]
async fn append_demo_picks_the_best_successful_trajectory() {
    let source = StubProgram::fixed_answer("source", "x").into_arc();
    let bucket = Bucket::from_trajectories(vec![
        trajectory_with(source.clone(), "1+1", "wrong", 0.2, 0),
        trajectory_with(source.clone(), "1+1", "2", 0.9, 1),
        failed_trajectory(source.clone(), "1+1", 2),
    ]);

    let outcome = AppendDemo
        .apply(&bucket, source, &StrategyOptions::default())
        .await;
    let program = outcome.program().expect("strategy should apply");

    let demos = program.demos();
    assert_eq!(demos.len(), 1);
    assert_eq!(demos[0].get_str("answer", ""), "2");
}

#[tokio::test]
async fn append_demo_evicts_oldest_at_capacity() {
    let mut source = StubProgram::fixed_answer("source", "x");
    source.demos = vec![qa_example("old-1", "a"), qa_example("old-2", "b")];
    let source = source.into_arc();

    let bucket = Bucket::from_trajectories(vec![trajectory_with(
        source.clone(),
        "new",
        "c",
        1.0,
        0,
    )]);

    let opts = StrategyOptions::builder().max_demos(2).build();
    let program = AppendDemo.apply(&bucket, source, &opts).await.program().unwrap();

    let questions: Vec<String> = program
        .demos()
        .iter()
        .map(|d| d.get_str("question", ""))
        .collect();
    assert_eq!(questions, vec!["old-2".to_string(), "new".to_string()]);
}

#[tokio::test]
async fn append_demo_skips_without_successes() {
    let source = StubProgram::fixed_answer("source", "x").into_arc();
    let bucket = Bucket::from_trajectories(vec![
        failed_trajectory(source.clone(), "1+1", 0),
        trajectory_with(source.clone(), "1+1", "wrong", 0.0, 1),
    ]);

    assert!(!AppendDemo.applicable(&bucket, &StrategyOptions::default()));
    let outcome = AppendDemo
        .apply(&bucket, source, &StrategyOptions::default())
        .await;
    assert!(matches!(outcome, StrategyOutcome::Skipped(_)));
}

#[tokio::test]
async fn append_demo_wraps_programs_without_native_demos() {
    let source = StubProgram::fixed_answer("bare", "x")
        .with_capability(ProgramCapability::WrapRequired)
        .into_arc();
    let bucket =
        Bucket::from_trajectories(vec![trajectory_with(source.clone(), "1+1", "2", 1.0, 0)]);

    let program = AppendDemo
        .apply(&bucket, source, &StrategyOptions::default())
        .await
        .program()
        .unwrap();
    assert_eq!(program.demos().len(), 1);
}

#[tokio::test]
async fn append_rule_appends_lm_advice_to_the_instruction() {
    let mut source = StubProgram::fixed_answer("source", "x");
    source.instruction = Some("Answer the question.".to_string());
    let source = source.into_arc();

    let bucket = Bucket::from_trajectories(vec![
        trajectory_with(source.clone(), "17+25", "42", 0.95, 0),
        trajectory_with(source.clone(), "17+25", "40", 0.05, 1),
    ]);

    let lm: Arc<dyn LMClient> = Arc::new(DummyLM::constant(
        r#"{"main": "Carry digits carefully when adding two-digit numbers."}"#,
    ));
    let opts = StrategyOptions::builder().lm(lm).build();

    let program = AppendRule
        .apply(&bucket, source, &opts)
        .await
        .program()
        .unwrap();
    let instruction = program.instruction().unwrap();
    assert!(instruction.starts_with("Answer the question."));
    assert!(instruction.contains("Carry digits carefully"));
}

#[tokio::test]
async fn append_rule_skips_on_invalid_lm_response() {
    let source = StubProgram::fixed_answer("source", "x").into_arc();
    let bucket = Bucket::from_trajectories(vec![
        trajectory_with(source.clone(), "17+25", "42", 0.95, 0),
        trajectory_with(source.clone(), "17+25", "40", 0.05, 1),
    ]);

    let lm: Arc<dyn LMClient> = Arc::new(DummyLM::constant("certainly not json"));
    let opts = StrategyOptions::builder().lm(lm).build();

    let outcome = AppendRule.apply(&bucket, source, &opts).await;
    match outcome {
        StrategyOutcome::Skipped(reason) => assert!(reason.contains("invalid feedback")),
        StrategyOutcome::Applied(_) => panic!("should not apply on invalid response"),
    }
}

#[tokio::test]
async fn append_rule_skips_small_gaps_and_missing_lm() {
    let source = StubProgram::fixed_answer("source", "x").into_arc();
    let tight = Bucket::from_trajectories(vec![
        trajectory_with(source.clone(), "1+1", "2", 0.52, 0),
        trajectory_with(source.clone(), "1+1", "2", 0.48, 1),
    ]);
    assert!(!AppendRule.applicable(&tight, &StrategyOptions::default()));

    let wide = Bucket::from_trajectories(vec![
        trajectory_with(source.clone(), "1+1", "2", 0.9, 0),
        trajectory_with(source.clone(), "1+1", "no", 0.1, 1),
    ]);
    // Wide gap but no LM configured.
    let outcome = AppendRule
        .apply(&wide, source, &StrategyOptions::default())
        .await;
    assert!(matches!(outcome, StrategyOutcome::Skipped(_)));
}

#[tokio::test]
async fn first_applicable_strategy_wins() {
    let source = StubProgram::fixed_answer("source", "x").into_arc();
    let bucket =
        Bucket::from_trajectories(vec![trajectory_with(source.clone(), "1+1", "2", 1.0, 0)]);

    let strategies: Vec<Arc<dyn Strategy>> = vec![Arc::new(AppendRule), Arc::new(AppendDemo)];
    let outcome = apply_first_applicable(
        &strategies,
        &bucket,
        source,
        &StrategyOptions::default(),
    )
    .await;

    // AppendRule is not applicable (single trajectory); AppendDemo applies.
    let program = outcome.program().expect("append_demo should apply");
    assert_eq!(program.demos().len(), 1);
}

#[tokio::test]
async fn empty_strategy_list_skips() {
    let source = StubProgram::fixed_answer("source", "x").into_arc();
    let bucket =
        Bucket::from_trajectories(vec![trajectory_with(source.clone(), "1+1", "2", 1.0, 0)]);

    let outcome =
        apply_first_applicable(&[], &bucket, source, &StrategyOptions::default()).await;
    assert!(matches!(outcome, StrategyOutcome::Skipped(_)));
}

#[tokio::test]
async fn malformed_buckets_fail_validation_not_the_step() {
    let source = StubProgram::fixed_answer("source", "x").into_arc();

    // An out-of-range score cannot come from the sampler, but a strategy
    // must still degrade to a skip when handed one.
    let mut rogue = trajectory_with(source.clone(), "1+1", "2", 1.0, 0);
    rogue.score = 1.5;
    let bucket = Bucket::from_trajectories(vec![rogue]);

    let strategies: Vec<Arc<dyn Strategy>> = vec![Arc::new(AppendDemo)];
    let outcome = apply_first_applicable(
        &strategies,
        &bucket,
        source,
        &StrategyOptions::default(),
    )
    .await;

    match outcome {
        StrategyOutcome::Skipped(reason) => assert!(reason.starts_with("Validation failed")),
        StrategyOutcome::Applied(_) => panic!("validation should have failed"),
    }
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use teleprompt::*;

fn demo(question: &str, answer: &str) -> Example {
    qa_example(question, answer)
}

#[test]
fn enhancement_strategy_follows_capability() {
    let full = StubProgram::fixed_answer("full", "x");
    let demos_only =
        StubProgram::fixed_answer("demos", "x").with_capability(ProgramCapability::NativeDemos);
    let bare =
        StubProgram::fixed_answer("bare", "x").with_capability(ProgramCapability::WrapRequired);

    assert_eq!(enhancement_strategy(&full), EnhancementStrategy::NativeFull);
    assert_eq!(
        enhancement_strategy(&demos_only),
        EnhancementStrategy::NativeDemos
    );
    assert_eq!(
        enhancement_strategy(&bare),
        EnhancementStrategy::WrapOptimized
    );
}

#[tokio::test]
async fn wrapped_program_receives_demos_and_instruction_via_opts() {
    // The behavior echoes back what it observed, proving injection happened.
    let base = StubProgram::new(
        "observer",
        Arc::new(|call| {
            let demo_count = call.demos.len().to_string();
            Ok(prediction(&[
                ("instruction", call.instruction.unwrap_or("")),
                ("demo_count", demo_count.as_str()),
            ]))
        }),
    )
    .with_capability(ProgramCapability::WrapRequired)
    .into_arc();

    let optimized = enhance(
        base,
        vec![demo("1+1", "2"), demo("2+2", "4")],
        Some("Be precise.".to_string()),
        Fields::new(),
    );

    let outputs = optimized
        .forward(Fields::new(), &ForwardOptions::default())
        .await
        .unwrap();
    assert_eq!(outputs.get_str("instruction", ""), "Be precise.");
    assert_eq!(outputs.get_str("demo_count", ""), "2");
}

#[tokio::test]
async fn native_full_program_holds_fields_itself() {
    let base = StubProgram::new(
        "observer",
        Arc::new(|call| {
            let demo_count = call.demos.len().to_string();
            Ok(prediction(&[
                ("instruction", call.instruction.unwrap_or("")),
                ("demo_count", demo_count.as_str()),
            ]))
        }),
    )
    .into_arc();

    let optimized = enhance(
        base,
        vec![demo("1+1", "2")],
        Some("Stay sharp.".to_string()),
        Fields::new(),
    );

    // Nothing is injected through opts; the stub sees its own native fields.
    let outputs = optimized
        .forward(Fields::new(), &ForwardOptions::default())
        .await
        .unwrap();
    assert_eq!(outputs.get_str("instruction", ""), "Stay sharp.");
    assert_eq!(outputs.get_str("demo_count", ""), "1");
    assert_eq!(optimized.demos().len(), 1);
    assert_eq!(optimized.instruction().as_deref(), Some("Stay sharp."));
}

#[test]
fn repeated_enhancement_replaces_demos() {
    let base = StubProgram::fixed_answer("base", "x")
        .with_capability(ProgramCapability::WrapRequired)
        .into_arc();

    let first = enhance(base, vec![demo("1+1", "2")], None, Fields::new());
    let second = enhance(
        first.into_program(),
        vec![demo("2+2", "4"), demo("3+3", "6")],
        None,
        Fields::new(),
    );

    let questions: Vec<String> = second
        .demos()
        .iter()
        .map(|d| d.get_str("question", ""))
        .collect();
    assert_eq!(questions, vec!["2+2".to_string(), "3+3".to_string()]);
}

#[test]
fn with_demos_on_wrapper_replaces_not_accumulates() {
    let base = StubProgram::fixed_answer("base", "x").into_arc();
    let optimized = enhance(base, vec![demo("1+1", "2")], None, Fields::new());

    let replaced = optimized.with_demos(vec![demo("5+5", "10")]).unwrap();
    assert_eq!(replaced.demos().len(), 1);
    assert_eq!(replaced.demos()[0].get_str("question", ""), "5+5");
}

#[tokio::test]
async fn demo_round_trip_reproduces_outputs() {
    // Deterministic program: answers from its demos, "?" otherwise.
    let behavior: StubBehavior = Arc::new(|call| {
        let question = field_str(call.inputs, "question");
        let answer = call
            .demos
            .iter()
            .find(|demo| demo.get_str("question", "") == question)
            .map(|demo| demo.get_str("answer", ""))
            .unwrap_or_else(|| "?".to_string());
        Ok(prediction(&[("answer", &answer)]))
    });
    let program = StubProgram::new("demo-reader", behavior).into_arc();

    let example = qa_example("1+1", "2");
    let outputs = {
        let mut data = Fields::new();
        data.insert("answer".into(), serde_json::json!("2"));
        Prediction::new(data)
    };
    let trajectory = Trajectory {
        program: program.clone(),
        inputs: example.inputs(),
        example: example.clone(),
        outputs: Some(outputs.clone()),
        score: 1.0,
        duration: Duration::from_millis(1),
        model_config: ModelConfig::default(),
        success: true,
        error: None,
        exec_id: 0,
    };

    let demo = trajectory.to_demo().unwrap();
    let rerun = program
        .forward(
            example.inputs(),
            &ForwardOptions {
                demos: vec![demo],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(rerun.data, outputs.data);
}

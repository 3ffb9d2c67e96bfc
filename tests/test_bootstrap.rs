mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use common::*;
use teleprompt::*;

const PAIRS: [(&str, &str); 3] = [("1+1", "2"), ("2+2", "4"), ("3+3", "6")];

fn student() -> Arc<dyn Program> {
    StubProgram::fixed_answer("student", "?")
        .with_capability(ProgramCapability::WrapRequired)
        .into_arc()
}

#[tokio::test]
async fn perfect_teacher_produces_quality_demos() {
    let teacher = StubProgram::oracle("teacher", &PAIRS).into_arc();
    let trainset = qa_trainset(&PAIRS);

    let bootstrap = BootstrapFewShot::builder()
        .max_bootstrapped_demos(2)
        .quality_threshold(0.7)
        .build();
    let optimized = bootstrap
        .compile(&student(), &teacher, &trainset, &exact_match())
        .await
        .unwrap();

    let demos = optimized.demos();
    assert_eq!(demos.len(), 2);
    for demo in &demos {
        assert_eq!(demo.get("__quality_score").unwrap().as_f64(), Some(1.0));
        assert_eq!(demo.get_str("__teacher", ""), "teacher");
        assert!(demo.get("__original_example_id").is_some());
        assert!(demo.get("__timestamp").is_some());
        assert_eq!(demo.input_keys, vec!["question".to_string()]);
        // Inputs and predicted outputs are merged into the demo.
        assert!(!demo.get_str("question", "").is_empty());
        assert!(!demo.get_str("answer", "").is_empty());
    }

    let metadata = optimized.metadata();
    assert_eq!(metadata["demo_count"], serde_json::json!(2));
    assert!(metadata.get("demo_generation_result").is_none());
}

#[tokio::test]
async fn all_below_threshold_is_a_success_with_metadata() {
    let teacher = StubProgram::fixed_answer("naysayer", "no").into_arc();
    let trainset = qa_trainset(&PAIRS);

    let bootstrap = BootstrapFewShot::builder().quality_threshold(0.5).build();
    let optimized = bootstrap
        .compile(&student(), &teacher, &trainset, &exact_match())
        .await
        .unwrap();

    assert!(optimized.demos().is_empty());
    let metadata = optimized.metadata();
    assert_eq!(
        metadata["demo_generation_result"],
        serde_json::json!("no_quality_demonstrations")
    );
    assert!(metadata.get("fallback_reason").is_some());
}

#[tokio::test]
async fn zero_demo_budget_is_a_success() {
    let teacher = StubProgram::oracle("teacher", &PAIRS).into_arc();
    let trainset = qa_trainset(&PAIRS);

    let bootstrap = BootstrapFewShot::builder()
        .max_bootstrapped_demos(0)
        .build();
    let optimized = bootstrap
        .compile(&student(), &teacher, &trainset, &exact_match())
        .await
        .unwrap();

    assert!(optimized.demos().is_empty());
}

#[tokio::test]
async fn demos_are_sorted_by_quality_and_truncated() {
    let teacher = StubProgram::oracle("teacher", &PAIRS).into_arc();
    let trainset = qa_trainset(&PAIRS);

    // Grade answers unevenly so the sort order is observable.
    let metric: MetricFn = Arc::new(|example, prediction| {
        if prediction.get_str("answer", "") != example.get_str("answer", "!") {
            return 0.0;
        }
        match example.get_str("question", "").as_str() {
            "1+1" => 0.75,
            "2+2" => 0.95,
            _ => 0.85,
        }
    });

    let bootstrap = BootstrapFewShot::builder()
        .max_bootstrapped_demos(2)
        .quality_threshold(0.7)
        .build();
    let optimized = bootstrap
        .compile(&student(), &teacher, &trainset, &metric)
        .await
        .unwrap();

    let qualities: Vec<f64> = optimized
        .demos()
        .iter()
        .map(|demo| demo.get("__quality_score").unwrap().as_f64().unwrap())
        .collect();
    assert_eq!(qualities, vec![0.95, 0.85]);
}

#[tokio::test]
async fn flaky_teacher_is_retried() {
    // Fails the first two attempts for every question, succeeds on the third.
    let attempts: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let table: HashMap<String, String> = PAIRS
        .iter()
        .map(|(q, a)| (q.to_string(), a.to_string()))
        .collect();

    let teacher = StubProgram::new("flaky", {
        let attempts = attempts.clone();
        Arc::new(move |call| {
            let question = field_str(call.inputs, "question");
            let mut attempts = attempts.lock().unwrap();
            let seen = attempts.entry(question.clone()).or_insert(0);
            *seen += 1;
            if *seen < 3 {
                return Err(provider_error("transient"));
            }
            Ok(prediction(&[("answer", table[&question].as_str())]))
        })
    })
    .into_arc();

    let trainset = qa_trainset(&PAIRS);
    let bootstrap = BootstrapFewShot::builder().teacher_retries(2).build();
    let optimized = bootstrap
        .compile(&student(), &teacher, &trainset, &exact_match())
        .await
        .unwrap();

    assert_eq!(optimized.demos().len(), 3);
}

#[tokio::test]
async fn hopeless_teacher_still_returns_the_student() {
    let teacher = StubProgram::failing("down").into_arc();
    let trainset = qa_trainset(&PAIRS);

    let bootstrap = BootstrapFewShot::builder().teacher_retries(1).build();
    let optimized = bootstrap
        .compile(&student(), &teacher, &trainset, &exact_match())
        .await
        .unwrap();

    assert!(optimized.demos().is_empty());
    assert_eq!(
        optimized.metadata()["demo_generation_result"],
        serde_json::json!("no_quality_demonstrations")
    );
}

#[tokio::test]
async fn raising_metric_filters_candidates_instead_of_crashing() {
    let teacher = StubProgram::oracle("teacher", &PAIRS).into_arc();
    let trainset = qa_trainset(&PAIRS);
    let metric: MetricFn = Arc::new(|_, _| panic!("metric bug"));

    let optimized = BootstrapFewShot::default()
        .compile(&student(), &teacher, &trainset, &metric)
        .await
        .unwrap();
    assert!(optimized.demos().is_empty());
}

#[tokio::test]
async fn empty_trainset_is_rejected() {
    let teacher = StubProgram::oracle("teacher", &PAIRS).into_arc();
    let err = BootstrapFewShot::default()
        .compile(&student(), &teacher, &[], &exact_match())
        .await
        .unwrap_err();
    assert_eq!(err, OptimizeError::InvalidOrEmptyTrainset);
}

#[tokio::test]
async fn malformed_training_items_are_rejected_with_index() {
    let teacher = StubProgram::oracle("teacher", &PAIRS).into_arc();

    let mut trainset = qa_trainset(&PAIRS[..1]);
    let mut data = Fields::new();
    data.insert("question".into(), serde_json::json!("4+4"));
    trainset.push(Example::new(data, vec!["question".into()]));

    let err = BootstrapFewShot::default()
        .compile(&student(), &teacher, &trainset, &exact_match())
        .await
        .unwrap_err();
    assert_eq!(err, OptimizeError::InvalidTrainingData { index: 1 });
}

#[tokio::test]
async fn labeled_demos_top_up_from_unused_examples() {
    // Teacher only knows one question; labeled demos fill from the rest.
    let teacher = StubProgram::oracle("teacher", &PAIRS[..1]).into_arc();
    let trainset = qa_trainset(&PAIRS);

    let bootstrap = BootstrapFewShot::builder()
        .teacher_retries(0)
        .max_labeled_demos(2)
        .build();
    let optimized = bootstrap
        .compile(&student(), &teacher, &trainset, &exact_match())
        .await
        .unwrap();

    let demos = optimized.demos();
    assert_eq!(demos.len(), 3);
    let labeled = demos
        .iter()
        .filter(|demo| demo.get_str("__generated_by", "") == "labeled")
        .count();
    assert_eq!(labeled, 2);
}

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::Rng;
use rand::rngs::StdRng;
use serde_json::json;

use teleprompt::*;

/// Everything a stub behavior can see about one forward call: the raw
/// inputs, the call options, and the effective demos/instruction after
/// wrapper injection.
pub struct StubCall<'a> {
    pub inputs: &'a Fields,
    pub opts: &'a ForwardOptions,
    pub demos: &'a [Example],
    pub instruction: Option<&'a str>,
}

pub type StubBehavior =
    Arc<dyn Fn(StubCall<'_>) -> Result<Prediction, ProgramError> + Send + Sync>;

/// Closure-driven program with a configurable capability class.
#[derive(Clone)]
pub struct StubProgram {
    pub label: String,
    pub capability: ProgramCapability,
    pub instruction: Option<String>,
    pub demos: Vec<Example>,
    pub behavior: StubBehavior,
}

impl StubProgram {
    pub fn new(label: &str, behavior: StubBehavior) -> Self {
        Self {
            label: label.to_string(),
            capability: ProgramCapability::NativeFull,
            instruction: None,
            demos: Vec::new(),
            behavior,
        }
    }

    pub fn with_capability(mut self, capability: ProgramCapability) -> Self {
        self.capability = capability;
        self
    }

    pub fn into_arc(self) -> Arc<dyn Program> {
        Arc::new(self)
    }

    /// Always answers with the same string.
    pub fn fixed_answer(label: &str, answer: &str) -> Self {
        let answer = answer.to_string();
        Self::new(
            label,
            Arc::new(move |_call| Ok(prediction(&[("answer", answer.as_str())]))),
        )
    }

    /// Answers correctly according to a question → answer table, erroring on
    /// unknown questions.
    pub fn oracle(label: &str, pairs: &[(&str, &str)]) -> Self {
        let table: HashMap<String, String> = pairs
            .iter()
            .map(|(q, a)| (q.to_string(), a.to_string()))
            .collect();
        Self::new(
            label,
            Arc::new(move |call| {
                let question = field_str(call.inputs, "question");
                match table.get(&question) {
                    Some(answer) => Ok(prediction(&[("answer", answer.as_str())])),
                    None => Err(provider_error("unknown question")),
                }
            }),
        )
    }

    /// Every call fails with a provider error.
    pub fn failing(label: &str) -> Self {
        Self::new(
            label,
            Arc::new(|_call| Err(provider_error("stub is down"))),
        )
    }

    /// Answers correctly when it has demos to lean on; without demos it is
    /// right with probability 0.5 at sampling temperatures (≥ 0.7) and wrong
    /// otherwise. Models an LM that few-shot prompting genuinely helps.
    pub fn noisy_learner(label: &str, pairs: &[(&str, &str)], seed: u64) -> Self {
        let table: HashMap<String, String> = pairs
            .iter()
            .map(|(q, a)| (q.to_string(), a.to_string()))
            .collect();
        let rng = Mutex::new(seeded_rng(Some(seed)));
        Self::new(
            label,
            Arc::new(move |call| {
                let question = field_str(call.inputs, "question");
                let Some(answer) = table.get(&question) else {
                    return Err(provider_error("unknown question"));
                };

                if !call.demos.is_empty() {
                    return Ok(prediction(&[("answer", answer.as_str())]));
                }

                let hot = call.opts.temperature.unwrap_or(0.0) >= 0.7;
                let correct = hot && rng.lock().unwrap().gen_bool(0.5);
                if correct {
                    Ok(prediction(&[("answer", answer.as_str())]))
                } else {
                    Ok(prediction(&[("answer", "wrong")]))
                }
            }),
        )
    }
}

#[async_trait]
impl Program for StubProgram {
    async fn forward(
        &self,
        inputs: Fields,
        opts: &ForwardOptions,
    ) -> Result<Prediction, ProgramError> {
        let demos: &[Example] = if opts.demos.is_empty() {
            &self.demos
        } else {
            &opts.demos
        };
        let instruction = opts.instruction.as_deref().or(self.instruction.as_deref());
        (self.behavior)(StubCall {
            inputs: &inputs,
            opts,
            demos,
            instruction,
        })
    }

    fn capability(&self) -> ProgramCapability {
        self.capability
    }

    fn name(&self) -> String {
        self.label.clone()
    }

    fn instruction(&self) -> Option<String> {
        self.instruction.clone()
    }

    fn demos(&self) -> Vec<Example> {
        self.demos.clone()
    }

    fn with_instruction(&self, instruction: String) -> Option<Arc<dyn Program>> {
        match self.capability {
            ProgramCapability::NativeFull => Some(Arc::new(Self {
                instruction: Some(instruction),
                ..self.clone()
            })),
            _ => None,
        }
    }

    fn with_demos(&self, demos: Vec<Example>) -> Option<Arc<dyn Program>> {
        match self.capability {
            ProgramCapability::NativeFull | ProgramCapability::NativeDemos => {
                Some(Arc::new(Self {
                    demos,
                    ..self.clone()
                }))
            }
            ProgramCapability::WrapRequired => None,
        }
    }
}

pub fn qa_example(question: &str, answer: &str) -> Example {
    let mut data = Fields::new();
    data.insert("question".into(), json!(question));
    data.insert("answer".into(), json!(answer));
    Example::new(data, vec!["question".into()])
}

pub fn qa_trainset(pairs: &[(&str, &str)]) -> Vec<Example> {
    pairs.iter().map(|(q, a)| qa_example(q, a)).collect()
}

/// 1.0 when the predicted `answer` matches the labeled one exactly.
pub fn exact_match() -> MetricFn {
    Arc::new(|example, prediction| {
        let expected = example.get_str("answer", "");
        let actual = prediction.get_str("answer", "!");
        if !expected.is_empty() && expected == actual {
            1.0
        } else {
            0.0
        }
    })
}

pub fn prediction(fields: &[(&str, &str)]) -> Prediction {
    let mut data = Fields::new();
    for (key, value) in fields {
        data.insert((*key).to_string(), json!(value));
    }
    Prediction::new(data)
}

pub fn field_str(fields: &Fields, key: &str) -> String {
    match fields.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

pub fn provider_error(message: &str) -> ProgramError {
    ProgramError::Lm {
        source: LmError::Client {
            client: "stub".to_string(),
            message: message.to_string(),
            source: None,
        },
    }
}

/// Evaluates a program with a small fixed concurrency; convenience for
/// asserting functional equivalence in scenario tests.
pub async fn score_program(
    program: &Arc<dyn Program>,
    examples: &[Example],
    metric: &MetricFn,
) -> f64 {
    Evaluator::builder()
        .max_concurrency(4)
        .build()
        .run(program, examples, metric)
        .await
        .expect("evaluation should succeed")
        .score
}

/// Keeps a deterministic RNG handy for stubs that need one outside
/// `noisy_learner`.
pub fn stub_rng(seed: u64) -> Mutex<StdRng> {
    Mutex::new(seeded_rng(Some(seed)))
}

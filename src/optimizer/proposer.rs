use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use futures::StreamExt;
use futures::stream;

use crate::core::SignatureInfo;
use crate::data::Example;
use crate::lm::{Chat, LMClient, Message, RequestOptions};

/// Extra prompt directives cycled through when more than three candidates
/// are requested.
const CREATIVITY_DIRECTIVES: [&str; 5] = [
    "Favor concise, direct phrasing over elaborate framing.",
    "Emphasize accuracy and faithfulness to the input fields.",
    "Encourage explicit step-by-step reasoning before the answer.",
    "Stress strict compliance with the expected output format.",
    "Frame the task from the perspective of a domain expert.",
];

const MAX_SAMPLE_EXAMPLES: usize = 3;

/// Generates candidate instruction strings for a task by prompting an LM
/// with several styled variants of the task description.
///
/// Failed or empty responses are discarded; when nothing survives, a single
/// deterministic instruction derived from the field names is returned, so
/// the result is never empty.
#[derive(Builder, Clone)]
pub struct InstructionProposer {
    #[builder(default = 6)]
    pub num_candidates: usize,
    #[builder(default = 4)]
    pub max_concurrency: usize,
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,
    pub correlation_id: Option<String>,
}

impl Default for InstructionProposer {
    fn default() -> Self {
        InstructionProposer::builder().build()
    }
}

impl InstructionProposer {
    pub async fn propose(
        &self,
        lm: &Arc<dyn LMClient>,
        signature: &SignatureInfo,
        samples: &[Example],
    ) -> Vec<String> {
        let prompts = self.build_prompts(signature, samples);

        let responses: Vec<Option<String>> = stream::iter(prompts)
            .map(|prompt| {
                let lm = Arc::clone(lm);
                let opts = RequestOptions {
                    timeout: self.timeout,
                    correlation_id: self.correlation_id.clone(),
                    ..Default::default()
                };
                async move {
                    let chat = Chat::new(vec![
                        Message::system(
                            "You write concise instructions for language-model programs.",
                        ),
                        Message::user(prompt),
                    ]);
                    lm.request(&chat, &opts)
                        .await
                        .ok()
                        .map(|response| response.content().trim().to_string())
                }
            })
            .buffer_unordered(self.max_concurrency.max(1))
            .collect()
            .await;

        let mut instructions: Vec<String> = responses
            .into_iter()
            .flatten()
            .filter(|text| !text.is_empty())
            .collect();

        if instructions.is_empty() {
            instructions.push(default_instruction(signature));
        }
        instructions
    }

    fn build_prompts(&self, signature: &SignatureInfo, samples: &[Example]) -> Vec<String> {
        let task = task_description(signature, samples);

        let mut prompts = vec![
            format!(
                "{task}\nWrite one instruction that tells a language model how to \
                 perform this task. Reply with the instruction only."
            ),
            format!(
                "{task}\nWrite one instruction that asks the model to reason step \
                 by step before giving its answer. Reply with the instruction only."
            ),
            format!(
                "{task}\nWrite one instruction that stresses answer quality and \
                 double-checking. Reply with the instruction only."
            ),
        ];

        for extra in 0..self.num_candidates.saturating_sub(prompts.len()) {
            let directive = CREATIVITY_DIRECTIVES[extra % CREATIVITY_DIRECTIVES.len()];
            prompts.push(format!(
                "{task}\nWrite one instruction for this task. {directive} \
                 Reply with the instruction only."
            ));
        }

        prompts.truncate(self.num_candidates.max(1));
        prompts
    }
}

fn task_description(signature: &SignatureInfo, samples: &[Example]) -> String {
    let mut text = format!(
        "Task: given the input fields [{}], produce the output fields [{}].",
        signature.input_fields.join(", "),
        signature.output_fields.join(", "),
    );
    if let Some(description) = &signature.description {
        text.push_str(&format!("\nDescription: {description}"));
    }

    for example in samples.iter().take(MAX_SAMPLE_EXAMPLES) {
        text.push_str("\nExample:");
        for (key, value) in example.inputs() {
            text.push_str(&format!("\n  {key}: {value}"));
        }
        for (key, value) in example.outputs() {
            text.push_str(&format!("\n  {key}: {value}"));
        }
    }
    text
}

/// Deterministic fallback built from the signature's field names.
pub fn default_instruction(signature: &SignatureInfo) -> String {
    let inputs = if signature.input_fields.is_empty() {
        "the inputs".to_string()
    } else {
        format!("`{}`", signature.input_fields.join("`, `"))
    };
    let outputs = if signature.output_fields.is_empty() {
        "the outputs".to_string()
    } else {
        format!("`{}`", signature.output_fields.join("`, `"))
    };
    format!("Given the fields {inputs}, produce the fields {outputs}.")
}

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{Program, enhance};
use crate::data::{Bucket, Fields};
use crate::lm::{Chat, Message, RequestOptions};

use super::{Strategy, StrategyOptions, StrategyOutcome};

/// Minimum formatted-trace length before feedback is worth asking for.
const MIN_TRACE_LEN: usize = 50;
/// Minimum length of a single advice string in the LM response.
const MIN_ADVICE_LEN: usize = 10;

/// Compares the bucket's best and worst trajectories and, when the gap is
/// large enough, asks the configured LM for per-module advice that is
/// appended to the program's instruction.
pub struct AppendRule;

#[async_trait]
impl Strategy for AppendRule {
    fn name(&self) -> &'static str {
        "append_rule"
    }

    fn applicable(&self, bucket: &Bucket, opts: &StrategyOptions) -> bool {
        bucket.trajectory_count >= 2
            && bucket.max_to_min_gap > opts.min_score_gap
            && opts.lm.is_some()
    }

    async fn apply(
        &self,
        bucket: &Bucket,
        source: Arc<dyn Program>,
        opts: &StrategyOptions,
    ) -> StrategyOutcome {
        if bucket.trajectory_count < 2 {
            return StrategyOutcome::Skipped("need at least two trajectories".to_string());
        }
        if bucket.max_to_min_gap <= opts.min_score_gap {
            return StrategyOutcome::Skipped(format!(
                "score gap {:.3} below minimum {:.3}",
                bucket.max_to_min_gap, opts.min_score_gap
            ));
        }
        let Some(lm) = &opts.lm else {
            return StrategyOutcome::Skipped("no LM client configured".to_string());
        };
        let (Some(best), Some(worst)) = (bucket.best(), bucket.worst()) else {
            return StrategyOutcome::Skipped("bucket is empty".to_string());
        };

        let better_trace = best.format_for_prompt();
        let worse_trace = worst.format_for_prompt();
        if better_trace.len() < MIN_TRACE_LEN || worse_trace.len() < MIN_TRACE_LEN {
            return StrategyOutcome::Skipped("trajectory traces too short".to_string());
        }

        let chat = feedback_chat(source.as_ref(), &better_trace, &worse_trace);
        let request_opts = RequestOptions {
            correlation_id: opts.correlation_id.clone(),
            ..Default::default()
        };

        let response = match lm.request(&chat, &request_opts).await {
            Ok(response) => response,
            Err(err) => {
                return StrategyOutcome::Skipped(format!("LM request failed: {err}"));
            }
        };

        let Some(advice) = parse_advice(response.content()) else {
            return StrategyOutcome::Skipped("invalid feedback response".to_string());
        };

        let instruction = match source.instruction() {
            Some(existing) if !existing.is_empty() => format!("{existing}\n\n{advice}"),
            _ => advice,
        };

        let enhanced = match source.with_instruction(instruction.clone()) {
            Some(program) => program,
            None => Arc::new(enhance(
                source.clone(),
                source.demos(),
                Some(instruction),
                Fields::new(),
            )),
        };
        StrategyOutcome::Applied(enhanced)
    }
}

fn feedback_chat(source: &dyn Program, better_trace: &str, worse_trace: &str) -> Chat {
    let instruction = source
        .instruction()
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| "(no instruction set)".to_string());

    let system = "You analyze language-model program executions and offer \
                  feedback that would turn the worse execution into the better one."
        .to_string();
    let user = format!(
        "Program: {name}\nCurrent instruction:\n{instruction}\n\n\
         Better execution:\n{better_trace}\n\
         Worse execution:\n{worse_trace}\n\
         Respond with a JSON object mapping module names to one piece of \
         concrete advice each. Advice values must be non-empty strings.",
        name = source.name(),
    );

    Chat::new(vec![Message::system(system), Message::user(user)])
}

/// Expects a JSON object of non-trivial advice strings; returns the advice
/// joined into one instruction suffix, or `None` when the response is
/// invalid.
fn parse_advice(content: &str) -> Option<String> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let value: Value = serde_json::from_str(trimmed).ok()?;
    let object = value.as_object()?;
    if object.is_empty() {
        return None;
    }

    let mut advice = Vec::with_capacity(object.len());
    for entry in object.values() {
        let text = entry.as_str()?.trim();
        if text.len() <= MIN_ADVICE_LEN {
            return None;
        }
        advice.push(text.to_string());
    }
    Some(advice.join("\n"))
}

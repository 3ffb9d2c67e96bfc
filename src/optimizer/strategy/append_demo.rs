use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{Program, enhance};
use crate::data::{Bucket, Example, Fields};
use crate::utils::clamp_chars;

use super::{Strategy, StrategyOptions, StrategyOutcome};

/// Appends the bucket's best successful trajectory to the source program's
/// demo list, evicting the oldest demo at capacity.
pub struct AppendDemo;

#[async_trait]
impl Strategy for AppendDemo {
    fn name(&self) -> &'static str {
        "append_demo"
    }

    fn applicable(&self, bucket: &Bucket, _opts: &StrategyOptions) -> bool {
        bucket
            .trajectories
            .iter()
            .any(|t| t.success && t.score > 0.0)
    }

    async fn apply(
        &self,
        bucket: &Bucket,
        source: Arc<dyn Program>,
        opts: &StrategyOptions,
    ) -> StrategyOutcome {
        if opts.max_demos == 0 {
            return StrategyOutcome::Skipped("demo capacity is zero".to_string());
        }

        // Trajectories are sorted descending, so the first match is the best.
        let Some(best) = bucket
            .trajectories
            .iter()
            .find(|t| t.success && t.score > 0.0)
        else {
            return StrategyOutcome::Skipped(
                "no successful trajectory with positive score".to_string(),
            );
        };

        let Some(demo) = best.to_demo() else {
            return StrategyOutcome::Skipped("best trajectory has no outputs".to_string());
        };
        let demo = truncate_input_fields(demo, opts.demo_input_field_maxlen);

        let mut demos = source.demos();
        demos.push(demo);
        while demos.len() > opts.max_demos {
            demos.remove(0);
        }

        let enhanced = match source.with_demos(demos.clone()) {
            Some(program) => program,
            None => Arc::new(enhance(source, demos, None, Fields::new())),
        };
        StrategyOutcome::Applied(enhanced)
    }
}

fn truncate_input_fields(demo: Example, maxlen: usize) -> Example {
    let mut truncated = demo.clone();
    for key in &demo.input_keys {
        if let Some(Value::String(text)) = demo.data.get(key) {
            if text.chars().count() > maxlen {
                truncated =
                    truncated.with_value(key.clone(), Value::String(clamp_chars(text, maxlen)));
            }
        }
    }
    truncated
}

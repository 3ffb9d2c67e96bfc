use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::core::program::Program;
use crate::lm::ModelConfig;

use super::example::{Example, Fields};
use super::prediction::Prediction;

/// Record of one program execution during trajectory sampling.
///
/// `exec_id` is assigned at dispatch time as
/// `example_idx * num_candidates + model_idx`, so grouping by
/// `exec_id / num_candidates` recovers per-example buckets deterministically.
/// `error` is present iff `success` is false; `score` is always in [0, 1].
#[derive(Clone)]
pub struct Trajectory {
    pub program: Arc<dyn Program>,
    pub example: Example,
    pub inputs: Fields,
    pub outputs: Option<Prediction>,
    pub score: f64,
    pub duration: Duration,
    pub model_config: ModelConfig,
    pub success: bool,
    pub error: Option<String>,
    pub exec_id: usize,
}

impl Trajectory {
    /// Converts a successful execution into a few-shot demonstration:
    /// inputs merged with the predicted outputs, input keys preserved.
    pub fn to_demo(&self) -> Option<Example> {
        if !self.success {
            return None;
        }
        let outputs = self.outputs.as_ref()?;

        let mut data = self.inputs.clone();
        for (key, value) in &outputs.data {
            data.insert(key.clone(), value.clone());
        }
        Some(Example::new(data, self.example.input_keys.clone()))
    }

    /// Human-readable trace used in feedback prompts.
    pub fn format_for_prompt(&self) -> String {
        let mut result = String::new();
        result.push_str("Input:\n");
        for (key, value) in &self.inputs {
            result.push_str(&format!("  {}: {}\n", key, render(value)));
        }

        result.push_str("Output:\n");
        match &self.outputs {
            Some(prediction) => {
                for (key, value) in &prediction.data {
                    result.push_str(&format!("  {}: {}\n", key, render(value)));
                }
            }
            None => {
                let reason = self.error.as_deref().unwrap_or("no output");
                result.push_str(&format!("  (failed: {})\n", reason));
            }
        }

        result.push_str(&format!("Score: {:.3}\n", self.score));
        result
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl fmt::Debug for Trajectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trajectory")
            .field("program", &self.program.name())
            .field("score", &self.score)
            .field("success", &self.success)
            .field("error", &self.error)
            .field("exec_id", &self.exec_id)
            .finish_non_exhaustive()
    }
}

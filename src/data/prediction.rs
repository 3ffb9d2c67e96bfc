use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::example::Fields;

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct LmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Output map produced by one program execution.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
pub struct Prediction {
    pub data: Fields,
    pub lm_usage: LmUsage,
}

impl Prediction {
    pub fn new(data: Fields) -> Self {
        Self {
            data,
            lm_usage: LmUsage::default(),
        }
    }

    pub fn set_lm_usage(&mut self, lm_usage: LmUsage) {
        self.lm_usage = lm_usage;
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        match self.data.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => default.to_string(),
        }
    }

    pub fn keys(&self) -> Vec<&str> {
        self.data.keys().map(String::as_str).collect()
    }
}

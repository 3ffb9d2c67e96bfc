use bon::Builder;
use serde::{Deserialize, Serialize};

/// Tunable inference parameters for one trajectory-sampling pass.
#[derive(Clone, Debug, Builder, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub model: Option<String>,
    /// Sampling temperature. Higher values increase randomness.
    #[builder(default = 0.7)]
    pub temperature: f32,
    #[builder(default = 512)]
    pub max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig::builder().build()
    }
}

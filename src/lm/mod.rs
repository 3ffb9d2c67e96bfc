//! The LM client boundary.
//!
//! The core consumes language models through [`LMClient`]; transport,
//! retries, caching and rate limits all live behind that trait. The crate
//! ships [`DummyLM`](crate::providers::DummyLM) for scripted tests.

pub mod chat;
pub mod config;

pub use chat::*;
pub use config::*;

use std::time::Duration;

use async_trait::async_trait;

use crate::core::errors::LmError;
use crate::data::LmUsage;

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub model: Option<String>,
    pub timeout: Duration,
    pub correlation_id: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            temperature: None,
            max_tokens: None,
            model: None,
            timeout: Duration::from_secs(30),
            correlation_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LMResponse {
    pub message: Message,
    pub usage: LmUsage,
}

impl LMResponse {
    pub fn content(&self) -> &str {
        self.message.content()
    }
}

/// A chat-completion client. Implementations are expected to provide their
/// own retry, circuit-breaker and rate-limit semantics; the core only maps
/// failures into score-0 trajectories.
#[async_trait]
pub trait LMClient: Send + Sync {
    async fn request(&self, chat: &Chat, opts: &RequestOptions) -> Result<LMResponse, LmError>;
}

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::core::errors::LmError;
use crate::data::LmUsage;
use crate::lm::{Chat, LMClient, LMResponse, Message, RequestOptions};

/// Scripted LM client for tests and offline runs.
///
/// Responses are popped from the script in order; once the script is
/// exhausted the default response is returned. [`DummyLM::failing`] builds a
/// client whose every request errors, for exercising degradation paths.
pub struct DummyLM {
    script: Mutex<VecDeque<String>>,
    default_response: String,
    fail_all: bool,
    calls: AtomicUsize,
}

impl DummyLM {
    pub fn scripted(responses: Vec<String>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            default_response: "dummy response".to_string(),
            fail_all: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn constant(response: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_response: response.into(),
            fail_all: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_response: String::new(),
            fail_all: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LMClient for DummyLM {
    async fn request(&self, _chat: &Chat, _opts: &RequestOptions) -> Result<LMResponse, LmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if self.fail_all {
            return Err(LmError::Client {
                client: "dummy".to_string(),
                message: "scripted failure".to_string(),
                source: None,
            });
        }

        let content = self
            .script
            .lock()
            .expect("dummy script lock")
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone());

        Ok(LMResponse {
            message: Message::assistant(content),
            usage: LmUsage::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_responses_pop_in_order_then_fall_back() {
        let lm = DummyLM::scripted(vec!["first".into(), "second".into()]);
        let opts = RequestOptions::default();
        let chat = Chat::new(vec![Message::user("hi")]);

        assert_eq!(lm.request(&chat, &opts).await.unwrap().content(), "first");
        assert_eq!(lm.request(&chat, &opts).await.unwrap().content(), "second");
        assert_eq!(
            lm.request(&chat, &opts).await.unwrap().content(),
            "dummy response"
        );
        assert_eq!(lm.call_count(), 3);
    }

    #[tokio::test]
    async fn failing_client_errors_every_time() {
        let lm = DummyLM::failing();
        let chat = Chat::new(vec![Message::user("hi")]);
        assert!(lm.request(&chat, &RequestOptions::default()).await.is_err());
    }
}

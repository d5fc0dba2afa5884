//! Mock provider implementation for testing and local development.

use super::{FinishReason, GenerationParams, ProviderError, ProviderResponse, TextProvider};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Mock text provider with a scripted outcome queue.
///
/// Each `generate` call pops the next scripted outcome; once the queue is
/// drained it keeps answering with the default reply. An optional fixed
/// latency lets callers exercise their timeout handling.
pub struct MockTextProvider {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    default_reply: String,
    latency: Option<Duration>,
    calls: AtomicU32,
}

impl MockTextProvider {
    pub fn new(default_reply: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_reply: default_reply.into(),
            latency: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue the outcome of a future `generate` call.
    pub fn enqueue(&self, outcome: Result<String, ProviderError>) {
        self.script
            .lock()
            .expect("mock script lock poisoned")
            .push_back(outcome);
    }

    /// Number of `generate` calls that reached this provider.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextProvider for MockTextProvider {
    async fn generate(
        &self,
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let outcome = self
            .script
            .lock()
            .expect("mock script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(self.default_reply.clone()));

        let text = outcome?;
        Ok(ProviderResponse {
            input_tokens: prompt.len() as i32 / 4,
            output_tokens: text.len() as i32 / 4,
            text: Some(text),
            finish_reason: FinishReason::Complete,
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

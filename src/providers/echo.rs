//! Offline adapter that echoes its input.
//!
//! Needs no key, endpoint, or network; used by the test suite and as a smoke
//! target when wiring up a new configuration.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use crate::providers::traits::{EventStream, ProviderAdapter};
use crate::providers::ProviderError;
use crate::types::{
    ContentPart, FinishReason, GenerationResponse, Request, StreamEvent, Timing, TokenUsage,
};

const CHUNK_CHARS: usize = 8;

/// Echo adapter. Token counts are derived from character lengths so cost
/// assertions in tests stay deterministic.
#[derive(Debug, Clone, Default)]
pub struct EchoAdapter;

impl EchoAdapter {
    pub fn new() -> Self {
        Self
    }

    fn render(&self, request: &Request) -> (String, TokenUsage) {
        let mut text = String::new();
        for part in &request.parts {
            let tag = match part {
                ContentPart::Text { text: t } => {
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(t);
                    continue;
                }
                ContentPart::Image { .. } => "[image]",
                ContentPart::Audio { .. } => "[audio]",
                ContentPart::File { .. } => "[file]",
            };
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(tag);
        }
        let content = format!("[echo {}] {}", request.model_id, text);
        let usage = TokenUsage::tokens(text.chars().count() as u64, content.chars().count() as u64);
        (content, usage)
    }
}

impl ProviderAdapter for EchoAdapter {
    fn id(&self) -> &str {
        "echo"
    }

    fn invoke(
        &self,
        request: &Request,
        _deadline: Option<Instant>,
    ) -> Pin<Box<dyn Future<Output = Result<GenerationResponse, ProviderError>> + Send + '_>> {
        let (content, usage) = self.render(request);
        let model = request.model_id.clone();
        Box::pin(async move {
            Ok(GenerationResponse {
                content,
                media_parts: Vec::new(),
                model,
                provider: "echo".to_string(),
                usage,
                cost_usd: 0.0,
                finish_reason: FinishReason::Stop,
                trace_id: uuid::Uuid::nil(),
                timing: Timing::default(),
                provider_meta: serde_json::Value::Null,
            })
        })
    }

    fn stream(
        &self,
        request: &Request,
        _deadline: Option<Instant>,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, ProviderError>> + Send + '_>> {
        let (content, usage) = self.render(request);
        Box::pin(async move {
            let stream = async_stream::stream! {
                let chars: Vec<char> = content.chars().collect();
                for chunk in chars.chunks(CHUNK_CHARS) {
                    yield StreamEvent::delta(chunk.iter().collect::<String>());
                }
                yield StreamEvent::terminal(usage, FinishReason::Stop);
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

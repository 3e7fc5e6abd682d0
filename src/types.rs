//! Request and response model shared by the orchestrator and adapters.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One part of a multimodal request payload.
///
/// Adapters receive parts in the order the caller supplied them and are
/// responsible for transcoding each into their wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        #[serde(flatten)]
        source: MediaSource,
        mime: String,
    },
    Audio {
        #[serde(flatten)]
        source: MediaSource,
        mime: String,
    },
    File {
        uri: String,
    },
}

/// Inline bytes or a remote reference for a media part.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSource {
    #[serde(rename = "data")]
    Inline(#[serde(with = "serde_bytes_b64")] Vec<u8>),
    #[serde(rename = "uri")]
    Uri(String),
}

mod serde_bytes_b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

impl ContentPart {
    /// Convenience constructor for the common text case.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Text content of this part, if it is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text.as_str()),
            _ => None,
        }
    }
}

/// Caller-supplied content: a bare prompt or an ordered multimodal sequence.
#[derive(Debug, Clone)]
pub enum Content {
    Prompt(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Normalise into an ordered part list.
    pub fn into_parts(self) -> Vec<ContentPart> {
        match self {
            Self::Prompt(text) => vec![ContentPart::text(text)],
            Self::Parts(parts) => parts,
        }
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Self::Prompt(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Self::Prompt(s)
    }
}

impl From<Vec<ContentPart>> for Content {
    fn from(parts: Vec<ContentPart>) -> Self {
        Self::Parts(parts)
    }
}

/// Kind of generation work a call requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    #[default]
    Chat,
    Tts,
    Asr,
    ImageGen,
    VideoGen,
}

/// Per-call overrides. Every field is optional; unset fields fall back to
/// model/registry defaults. Callers build this record explicitly rather than
/// passing free-form named arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenConfig {
    #[serde(default)]
    pub task: Task,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub voice_config: Option<serde_json::Value>,
    pub image_size: Option<String>,
    pub aspect_ratio: Option<String>,
    pub thought_mode: Option<bool>,
    #[serde(default)]
    pub stream: bool,
    /// When false, `generate` returns only the content string.
    #[serde(default = "default_true")]
    pub full_response: bool,
    #[serde(default)]
    pub optimize_images: bool,
    /// Wall-clock deadline for the whole call, in milliseconds.
    pub deadline_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl Default for GenConfig {
    fn default() -> Self {
        Self {
            task: Task::default(),
            temperature: None,
            max_output_tokens: None,
            voice_config: None,
            image_size: None,
            aspect_ratio: None,
            thought_mode: None,
            stream: false,
            full_response: true,
            optimize_images: false,
            deadline_ms: None,
        }
    }
}

impl GenConfig {
    /// Output-token budget used for cost estimation when the caller did not
    /// set one.
    pub fn effective_max_output_tokens(&self) -> u32 {
        self.max_output_tokens.unwrap_or(1000)
    }
}

/// Multi-unit usage record. Fields the provider did not report stay zero and
/// `known` is false; the ledger persists that distinction as `usage_known`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_characters: Option<u64>,
    /// Whether the provider actually reported usage.
    #[serde(default)]
    pub known: bool,
}

impl TokenUsage {
    pub fn tokens(input: u64, output: u64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            known: true,
            ..Self::default()
        }
    }

    /// Merge a later partial report over this one, keeping the larger counts.
    pub fn absorb(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.total_tokens = self
            .total_tokens
            .max(other.total_tokens)
            .max(self.input_tokens + self.output_tokens);
        if other.images.is_some() {
            self.images = other.images;
        }
        if other.audio_seconds.is_some() {
            self.audio_seconds = other.audio_seconds;
        }
        if other.tts_characters.is_some() {
            self.tts_characters = other.tts_characters;
        }
        self.known |= other.known;
    }
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    SafetyBlocked,
    Error,
    Cancelled,
}

/// Wall-clock timing of one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Timing {
    /// Time to first token, if the call streamed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<u64>,
    pub total_ms: u64,
}

/// Normalised result of a completed call.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResponse {
    pub content: String,
    pub media_parts: Vec<ContentPart>,
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub finish_reason: FinishReason,
    pub trace_id: Uuid,
    pub timing: Timing,
    /// Raw provider-specific response metadata, passed through untouched.
    pub provider_meta: serde_json::Value,
}

/// One event of a streaming call. The terminal event has `is_final = true`
/// and carries the final usage and cost; at most one terminal event occurs
/// per stream.
#[derive(Debug, Clone, Default)]
pub struct StreamEvent {
    pub delta: String,
    pub media_delta: Option<Vec<u8>>,
    pub is_final: bool,
    pub usage: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
    pub finish_reason: Option<FinishReason>,
    pub error: Option<String>,
}

impl StreamEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            ..Self::default()
        }
    }

    pub fn terminal(usage: TokenUsage, finish_reason: FinishReason) -> Self {
        Self {
            is_final: true,
            usage: Some(usage),
            finish_reason: Some(finish_reason),
            ..Self::default()
        }
    }
}

/// Internal request handed to adapters after resolution and config merge.
#[derive(Debug, Clone)]
pub struct Request {
    pub parts: Vec<ContentPart>,
    pub model_id: String,
    pub provider: String,
    pub endpoint_url: String,
    pub api_key: Option<String>,
    pub options: GenConfig,
}

impl Request {
    /// Concatenated text of all text parts, used for token estimation.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Some(text) = part.as_text() {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(text);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreResult, GatewayError};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    #[serde(other)]
    Other,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::ToolCalls => "tool_calls",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Inbound `POST /chat/completions` body. Everything but `messages` is optional
/// and resolved against [`RequestDefaults`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ChatCompletionBody {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// Values applied when the inbound body leaves a field out.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDefaults {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub top_p: f32,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            model: "qwen/qwen3-coder-30b".into(),
            temperature: 0.7,
            max_tokens: Some(1000),
            top_p: 1.0,
        }
    }
}

/// A fully resolved completion request. Built once per inbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub top_p: f32,
    pub stream: bool,
}

impl CompletionRequest {
    pub fn resolve(body: ChatCompletionBody, defaults: &RequestDefaults) -> CoreResult<Self> {
        let model = match body.model {
            Some(m) if !m.trim().is_empty() => m,
            _ => defaults.model.clone(),
        };
        let req = Self {
            messages: body.messages,
            model,
            temperature: body.temperature.unwrap_or(defaults.temperature),
            max_tokens: body.max_tokens.or(defaults.max_tokens),
            top_p: body.top_p.unwrap_or(defaults.top_p),
            stream: body.stream.unwrap_or(false),
        };
        req.validate()?;
        Ok(req)
    }

    fn validate(&self) -> CoreResult<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(GatewayError::Validation(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(GatewayError::Validation(format!(
                "top_p must be within [0, 1], got {}",
                self.top_p
            )));
        }
        if self.max_tokens == Some(0) {
            return Err(GatewayError::Validation(
                "max_tokens must be a positive integer".into(),
            ));
        }
        Ok(())
    }

    /// Content of the most recent message, or empty when there are none.
    pub fn last_message_content(&self) -> &str {
        self.messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

// ---- Streaming wire types ----

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_chunk_object() -> String {
    "chat.completion.chunk".into()
}

/// One upstream `chat.completion.chunk`. Fields this crate does not model are
/// kept in `extra` so the relay forwards the payload unchanged.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionChunk {
    /// Single-choice chunk as produced by local backends.
    pub fn single(
        id: impl Into<String>,
        created: u64,
        model: impl Into<String>,
        content: Option<String>,
        finish_reason: Option<FinishReason>,
    ) -> Self {
        Self {
            id: id.into(),
            object: default_chunk_object(),
            created,
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content,
                    extra: Map::new(),
                },
                finish_reason,
                extra: Map::new(),
            }],
            extra: Map::new(),
        }
    }
}

/// A chunk as handed out by an upstream adapter, tagged with its arrival position.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub sequence_index: u64,
    pub payload: ChatCompletionChunk,
}

impl StreamChunk {
    pub fn id(&self) -> &str {
        &self.payload.id
    }

    /// Text carried by the first choice's delta, if any.
    pub fn delta_content(&self) -> Option<&str> {
        self.payload
            .choices
            .first()
            .and_then(|c| c.delta.content.as_deref())
    }

    pub fn has_content(&self) -> bool {
        self.delta_content().is_some_and(|s| !s.is_empty())
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.payload.choices.iter().find_map(|c| c.finish_reason)
    }

    pub fn delta_role(&self) -> Option<&str> {
        self.payload
            .choices
            .first()
            .and_then(|c| c.delta.role.as_deref())
    }
}

// ---- Non-streaming result ----

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CompletionResult {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl CompletionResult {
    pub fn first_text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

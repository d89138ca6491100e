use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ErrorKind};

/// Which frontdoor decoded the inbound request. Needed by the pass-through
/// optimization and by error messages that want to name the originating
/// wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceApiType {
    OpenAiChat,
    AnthropicMessages,
    OpenAiResponses,
}

/// Message role in a canonical conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One part of a message's content. A message's `content` is either a
/// simple string (collapsed text) or an ordered list of these parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageBase64 { media_type: String, data: String },
    ImageUrl { url: String },
    ToolUse {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Audio { media_type: String, data: String },
}

impl ContentPart {
    pub fn type_name(&self) -> &'static str {
        match self {
            ContentPart::Text { .. } => "text",
            ContentPart::ImageBase64 { .. } => "image_base64",
            ContentPart::ImageUrl { .. } => "image_url",
            ContentPart::ToolUse { .. } => "tool_use",
            ContentPart::ToolResult { .. } => "tool_result",
            ContentPart::Audio { .. } => "audio",
        }
    }
}

/// A message's content: either a collapsed text string, or the full list of
/// typed parts (preserved whenever a non-text part is present).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Collapse an array of parts into a simple string when every part is
    /// text (spec.md §4.1 "Content-block collapse"). Order is preserved;
    /// texts are concatenated with no separator, matching how a client that
    /// sent `content: [{"type":"text","text":"Hello "},{"type":"text","text":"world"}]`
    /// expects to see `"Hello world"` downstream.
    pub fn from_parts(parts: Vec<ContentPart>) -> Self {
        if !parts.is_empty() && parts.iter().all(|p| matches!(p, ContentPart::Text { .. })) {
            let text = parts
                .into_iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text,
                    _ => unreachable!(),
                })
                .collect::<Vec<_>>()
                .join("");
            Content::Text(text)
        } else {
            Content::Parts(parts)
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(t) => Some(t),
            Content::Parts(_) => None,
        }
    }

    pub fn parts(&self) -> Vec<ContentPart> {
        match self {
            Content::Text(t) => vec![ContentPart::Text { text: t.clone() }],
            Content::Parts(p) => p.clone(),
        }
    }
}

/// A single message in the canonical conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    pub name: Option<String>,
    /// For `Role::Tool` messages (or a tool-result content part at the
    /// message level): the id of the prior tool-use this message answers.
    pub tool_use_id: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            content: Content::Text(text.into()),
            name: None,
            tool_use_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: Content::Text(text.into()),
            name: None,
            tool_use_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Message {
            role: Role::Assistant,
            content: Content::Text(text.into()),
            name: None,
            tool_use_id: None,
        }
    }

    /// Validate the tool-result invariant: every `tool_result` part must
    /// carry a non-empty `tool_use_id`.
    pub fn validate(&self) -> Result<(), ApiError> {
        for part in self.content.parts() {
            if let ContentPart::ToolResult { tool_use_id, .. } = &part {
                if tool_use_id.is_empty() {
                    return Err(ApiError::new(
                        ErrorKind::InvalidRequest,
                        "tool_result part missing tool_use_id",
                    )
                    .with_param("content"));
                }
            }
        }
        Ok(())
    }
}

/// A tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The central neutral request that every frontdoor decodes into and every
/// backend encodes from.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub tenant_id: String,
    pub model: String,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub stream: bool,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub user_agent: Option<String>,
    pub source_api_type: SourceApiType,
}

impl CanonicalRequest {
    /// spec.md §3 invariants: messages non-empty; max_tokens is a u32 so
    /// the >= 0 invariant always holds by construction; every message must
    /// independently validate.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.messages.is_empty() {
            return Err(
                ApiError::new(ErrorKind::InvalidRequest, "messages must not be empty")
                    .with_param("messages"),
            );
        }
        for message in &self.messages {
            message.validate()?;
        }
        Ok(())
    }
}

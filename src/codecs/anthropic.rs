//! Anthropic Messages codec (spec.md §6.2, §4.1). Grounded on the wire
//! shapes in `src/llm/anthropic.rs` (`AnthropicMessage`, `AnthropicContent`,
//! `AnthropicContentBlock`, the `message_start`/`content_block_*`/
//! `message_delta`/`message_stop` SSE event family).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{
    CanonicalEvent, CanonicalRequest, CanonicalResponse, Choice, Content, ContentPart,
    FinishReason, Message, Role, SourceApiType, ToolCallChunk, ToolDefinition, Usage,
};
use crate::error::{ApiError, ErrorKind};

use super::finish_reason::{finish_reason_from_anthropic, finish_reason_to_anthropic};
use super::{Codec, DecodeContext, SseFrame, StreamEncoder};

#[derive(Debug, Deserialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(default)]
    system: Option<WireSystem>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireSystem {
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Debug, Deserialize, Serialize)]
struct WireMessage {
    role: String,
    content: WireContent,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text { text: String },
    Image { source: WireImageSource },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: WireToolResultContent,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(untagged)]
enum WireToolResultContent {
    #[default]
    Empty,
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Debug, Deserialize, Serialize)]
struct WireImageSource {
    #[serde(rename = "type")]
    kind: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct WireTool {
    name: String,
    #[serde(default)]
    description: String,
    input_schema: Value,
}

fn block_text(content: &WireToolResultContent) -> String {
    match content {
        WireToolResultContent::Empty => String::new(),
        WireToolResultContent::Text(t) => t.clone(),
        WireToolResultContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                WireBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""),
    }
}

pub struct AnthropicCodec;

impl AnthropicCodec {
    fn decode_blocks(blocks: Vec<WireBlock>) -> Vec<ContentPart> {
        blocks
            .into_iter()
            .map(|b| match b {
                WireBlock::Text { text } => ContentPart::Text { text },
                WireBlock::Image { source } => ContentPart::ImageBase64 {
                    media_type: source.media_type,
                    data: source.data,
                },
                WireBlock::ToolUse { id, name, input } => ContentPart::ToolUse {
                    id,
                    name,
                    arguments: input,
                },
                WireBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => ContentPart::ToolResult {
                    tool_use_id,
                    content: block_text(&content),
                    is_error,
                },
            })
            .collect()
    }

    fn decode_message(msg: WireMessage) -> Result<Message, ApiError> {
        let role = match msg.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(ApiError::new(
                    ErrorKind::InvalidRequest,
                    format!("unrecognized message role '{other}'"),
                )
                .with_param("messages[].role"))
            }
        };

        let content = match msg.content {
            WireContent::Text(t) => Content::Text(t),
            WireContent::Blocks(blocks) => Content::from_parts(Self::decode_blocks(blocks)),
        };

        // A message whose only block is a tool_result carries the id at the
        // message level too, matching the OpenAI-side `tool_call_id` field.
        let tool_use_id = content.parts().into_iter().find_map(|p| match p {
            ContentPart::ToolResult { tool_use_id, .. } => Some(tool_use_id),
            _ => None,
        });

        Ok(Message {
            role,
            content,
            name: None,
            tool_use_id,
        })
    }

    fn encode_blocks(parts: &[ContentPart]) -> Vec<WireBlock> {
        parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => WireBlock::Text { text: text.clone() },
                ContentPart::ImageBase64 { media_type, data } => WireBlock::Image {
                    source: WireImageSource {
                        kind: "base64".to_string(),
                        media_type: media_type.clone(),
                        data: data.clone(),
                    },
                },
                ContentPart::ImageUrl { url } => WireBlock::Text {
                    text: format!("[image: {url}]"),
                },
                ContentPart::ToolUse { id, name, arguments } => WireBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: arguments.clone(),
                },
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => WireBlock::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: WireToolResultContent::Text(content.clone()),
                    is_error: *is_error,
                },
                ContentPart::Audio { .. } => WireBlock::Text {
                    text: "[audio content omitted]".to_string(),
                },
            })
            .collect()
    }

    fn encode_message(msg: &Message) -> WireMessage {
        let role = match msg.role {
            Role::User | Role::Tool | Role::System => "user",
            Role::Assistant => "assistant",
        }
        .to_string();

        WireMessage {
            role,
            content: WireContent::Blocks(Self::encode_blocks(&msg.content.parts())),
        }
    }
}

impl Codec for AnthropicCodec {
    fn decode_request(&self, bytes: &[u8], ctx: DecodeContext) -> Result<CanonicalRequest, ApiError> {
        let wire: WireRequest = serde_json::from_slice(bytes)
            .map_err(|e| ApiError::invalid_request(format!("invalid request body: {e}")))?;

        let mut messages = Vec::with_capacity(wire.messages.len() + 1);

        // System-prompt normalization (spec.md §4.1): Anthropic's top-level
        // `system` becomes a synthetic leading system message.
        if let Some(system) = &wire.system {
            let text = match system {
                WireSystem::Text(t) => t.clone(),
                WireSystem::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|b| match b {
                        WireBlock::Text { text } => Some(text.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            };
            messages.push(Message::system(text));
        }

        for m in wire.messages {
            messages.push(Self::decode_message(m)?);
        }

        let tools = wire.tools.map(|tools| {
            tools
                .into_iter()
                .map(|t| ToolDefinition {
                    name: t.name,
                    description: t.description,
                    parameters: t.input_schema,
                })
                .collect()
        });

        let request = CanonicalRequest {
            tenant_id: ctx.tenant_id,
            model: wire.model,
            messages,
            system_prompt: None,
            tools,
            stream: wire.stream,
            max_tokens: wire.max_tokens,
            temperature: wire.temperature,
            metadata: HashMap::new(),
            user_agent: ctx.user_agent,
            source_api_type: ctx.source_api_type,
        };
        request.validate()?;
        Ok(request)
    }

    fn encode_request(&self, request: &CanonicalRequest) -> Result<Vec<u8>, ApiError> {
        // Re-encoding hoists a leading system message back into the
        // top-level `system` field (spec.md §4.1). Non-leading system
        // messages are lossy-collapsed into the nearest following user
        // message, separated by a blank line, since Anthropic forbids
        // `system`-role entries in `messages`.
        let mut system_parts = Vec::new();
        let mut messages: Vec<Message> = Vec::with_capacity(request.messages.len());
        let mut seen_non_system = false;
        let mut pending_system: Option<String> = None;

        for m in &request.messages {
            if m.role == Role::System && !seen_non_system {
                if let Some(text) = m.content.as_text() {
                    system_parts.push(text.to_string());
                }
                continue;
            }
            if m.role == Role::System {
                let text = m.content.as_text().unwrap_or_default().to_string();
                pending_system = Some(match pending_system.take() {
                    Some(existing) => format!("{existing}\n\n{text}"),
                    None => text,
                });
                continue;
            }
            seen_non_system = true;
            let mut next = m.clone();
            if let Some(pending) = pending_system.take() {
                let existing = next.content.as_text().unwrap_or_default();
                next.content = Content::Text(format!("{pending}\n\n{existing}"));
            }
            messages.push(next);
        }
        if let Some(pending) = pending_system.take() {
            messages.push(Message::user(pending));
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        let wire_messages: Vec<WireMessage> = messages.iter().map(Self::encode_message).collect();

        let tools = request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect::<Vec<_>>()
        });

        let body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": wire_messages,
            "system": system,
            "stream": request.stream,
            "temperature": request.temperature,
            "tools": tools,
        });
        serde_json::to_vec(&body).map_err(ApiError::from)
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<CanonicalResponse, ApiError> {
        let wire: Value = serde_json::from_slice(bytes)
            .map_err(|e| ApiError::invalid_request(format!("invalid upstream response: {e}")))?;

        let id = wire
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let model = wire
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let blocks: Vec<WireBlock> = serde_json::from_value(
            wire.get("content").cloned().unwrap_or(Value::Array(vec![])),
        )
        .map_err(|e| ApiError::invalid_request(format!("invalid content blocks: {e}")))?;
        let content = Content::from_parts(Self::decode_blocks(blocks));

        let finish_reason = wire
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .map(finish_reason_from_anthropic)
            .unwrap_or(FinishReason::Stop);

        let usage = wire
            .get("usage")
            .map(|u| {
                Usage::new(
                    u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                )
            })
            .unwrap_or_default();

        Ok(CanonicalResponse {
            id,
            created: chrono::Utc::now().timestamp(),
            model,
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: Role::Assistant,
                    content,
                    name: None,
                    tool_use_id: None,
                },
                finish_reason,
            }],
            usage,
        })
    }

    fn encode_response(&self, response: &CanonicalResponse) -> Result<Vec<u8>, ApiError> {
        let choice = response.first_choice();
        let body = serde_json::json!({
            "id": response.id,
            "type": "message",
            "role": "assistant",
            "model": response.model,
            "content": Self::encode_blocks(&choice.message.content.parts()),
            "stop_reason": finish_reason_to_anthropic(choice.finish_reason),
            "stop_sequence": Value::Null,
            "usage": {
                "input_tokens": response.usage.input_tokens,
                "output_tokens": response.usage.output_tokens,
            }
        });
        serde_json::to_vec(&body).map_err(ApiError::from)
    }

    fn decode_stream_chunk(&self, sse_data: &str) -> Result<Vec<CanonicalEvent>, ApiError> {
        let wire: Value = serde_json::from_str(sse_data)
            .map_err(|e| ApiError::invalid_request(format!("invalid stream chunk: {e}")))?;
        let event_type = wire.get("type").and_then(|v| v.as_str()).unwrap_or("");

        match event_type {
            "message_start" => Ok(vec![CanonicalEvent::RoleAnnouncement { role: Role::Assistant }]),
            "content_block_start" => {
                let block = wire.get("content_block").cloned().unwrap_or(Value::Null);
                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                    let index = wire.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                    Ok(vec![CanonicalEvent::ToolCall(ToolCallChunk {
                        index,
                        id: block.get("id").and_then(|v| v.as_str()).map(str::to_string),
                        name: block.get("name").and_then(|v| v.as_str()).map(str::to_string),
                        arguments_delta: None,
                    })])
                } else {
                    Ok(vec![])
                }
            }
            "content_block_delta" => {
                let delta = wire.get("delta").cloned().unwrap_or(Value::Null);
                match delta.get("type").and_then(|v| v.as_str()) {
                    Some("text_delta") => Ok(vec![CanonicalEvent::ContentDelta {
                        text: delta.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    }]),
                    Some("input_json_delta") => {
                        let index = wire.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                        Ok(vec![CanonicalEvent::ToolCall(ToolCallChunk {
                            index,
                            id: None,
                            name: None,
                            arguments_delta: delta
                                .get("partial_json")
                                .and_then(|v| v.as_str())
                                .map(str::to_string),
                        })])
                    }
                    _ => Ok(vec![]),
                }
            }
            "message_delta" => {
                // Real `message_delta` carries both the stop reason (under
                // `delta`) and the cumulative token usage so far (as a
                // sibling top-level `usage` field) in the same event —
                // `Finish` must come first per spec.md §3/§8.
                let delta = wire.get("delta").cloned().unwrap_or(Value::Null);
                let reason = delta
                    .get("stop_reason")
                    .and_then(|v| v.as_str())
                    .map(finish_reason_from_anthropic)
                    .unwrap_or(FinishReason::Stop);
                let mut events = vec![CanonicalEvent::Finish { reason }];
                if let Some(usage) = wire.get("usage").filter(|u| !u.is_null()) {
                    events.push(CanonicalEvent::Usage(Usage::new(
                        usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                        usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    )));
                }
                Ok(events)
            }
            "message_stop" => {
                // No usage here in the real grammar — it rides on the
                // preceding `message_delta`, handled above.
                Ok(vec![])
            }
            "content_block_stop" | "ping" => Ok(vec![]),
            _ => Ok(vec![]),
        }
    }

    fn new_stream_encoder(&self, model: &str) -> Box<dyn StreamEncoder> {
        Box::new(AnthropicStreamEncoder::new(model))
    }
}

struct AnthropicStreamEncoder {
    id: String,
    model: String,
    started: bool,
    open_block: Option<u32>,
    next_index: u32,
    /// Set by `Finish`, consumed by `Usage`: real `message_delta` carries
    /// both the stop reason and the cumulative usage in one event, but the
    /// canonical stream yields them as two ordered events (spec.md §3/§8
    /// guarantees `Usage` follows `Finish`), so `message_delta` itself is
    /// deferred until the usage number is actually in hand.
    pending_finish: Option<FinishReason>,
}

impl AnthropicStreamEncoder {
    fn new(model: &str) -> Self {
        AnthropicStreamEncoder {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            started: false,
            open_block: None,
            next_index: 0,
            pending_finish: None,
        }
    }

    fn ensure_started(&mut self, frames: &mut Vec<SseFrame>) {
        if self.started {
            return;
        }
        self.started = true;
        let body = serde_json::json!({
            "type": "message_start",
            "message": {
                "id": self.id,
                "type": "message",
                "role": "assistant",
                "model": self.model,
                "content": [],
                "usage": {"input_tokens": 0, "output_tokens": 0},
            }
        });
        frames.push(SseFrame::named("message_start", body.to_string()));
    }

    fn ensure_text_block(&mut self, frames: &mut Vec<SseFrame>) -> u32 {
        if self.open_block.is_none() {
            let index = self.next_index;
            self.next_index += 1;
            self.open_block = Some(index);
            frames.push(SseFrame::named(
                "content_block_start",
                serde_json::json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {"type": "text", "text": ""},
                })
                .to_string(),
            ));
        }
        self.open_block.unwrap()
    }

    fn close_block(&mut self, frames: &mut Vec<SseFrame>) {
        if let Some(index) = self.open_block.take() {
            frames.push(SseFrame::named(
                "content_block_stop",
                serde_json::json!({"type": "content_block_stop", "index": index}).to_string(),
            ));
        }
    }
}

impl StreamEncoder for AnthropicStreamEncoder {
    fn encode(&mut self, event: &CanonicalEvent) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        match event {
            CanonicalEvent::RoleAnnouncement { .. } => {
                self.ensure_started(&mut frames);
            }
            CanonicalEvent::ContentDelta { text } => {
                self.ensure_started(&mut frames);
                let index = self.ensure_text_block(&mut frames);
                frames.push(SseFrame::named(
                    "content_block_delta",
                    serde_json::json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "text_delta", "text": text},
                    })
                    .to_string(),
                ));
            }
            CanonicalEvent::ToolCall(chunk) => {
                self.ensure_started(&mut frames);
                self.close_block(&mut frames);
                frames.push(SseFrame::named(
                    "content_block_delta",
                    serde_json::json!({
                        "type": "content_block_delta",
                        "index": chunk.index,
                        "delta": {"type": "input_json_delta", "partial_json": chunk.arguments_delta.clone().unwrap_or_default()},
                    })
                    .to_string(),
                ));
            }
            CanonicalEvent::Finish { reason } => {
                self.ensure_started(&mut frames);
                self.close_block(&mut frames);
                self.pending_finish = Some(*reason);
            }
            CanonicalEvent::Usage(usage) => {
                let reason = self.pending_finish.take().unwrap_or(FinishReason::Stop);
                frames.push(SseFrame::named(
                    "message_delta",
                    serde_json::json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": finish_reason_to_anthropic(reason), "stop_sequence": Value::Null},
                        "usage": {
                            "input_tokens": usage.input_tokens,
                            "output_tokens": usage.output_tokens,
                        },
                    })
                    .to_string(),
                ));
                frames.push(SseFrame::named(
                    "message_stop",
                    serde_json::json!({"type": "message_stop"}).to_string(),
                ));
            }
            CanonicalEvent::Error(err) => {
                frames.push(SseFrame::named(
                    "error",
                    serde_json::json!({
                        "type": "error",
                        "error": {"type": err.kind.anthropic_type(), "message": err.message},
                    })
                    .to_string(),
                ));
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> DecodeContext {
        DecodeContext {
            tenant_id: "default".to_string(),
            user_agent: None,
            source_api_type: SourceApiType::AnthropicMessages,
        }
    }

    #[test]
    fn leading_system_is_hoisted_into_a_system_message() {
        let body = serde_json::json!({
            "model": "claude-3-opus",
            "max_tokens": 100,
            "system": "be terse",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let request = AnthropicCodec
            .decode_request(body.to_string().as_bytes(), ctx())
            .unwrap();
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[0].content.as_text(), Some("be terse"));
        assert_eq!(request.messages.len(), 2);
    }

    #[test]
    fn non_leading_system_message_collapses_into_the_next_user_message() {
        let request = CanonicalRequest {
            tenant_id: "default".to_string(),
            model: "claude-3-opus".to_string(),
            messages: vec![
                Message::user("hi"),
                Message::system("stay on topic"),
                Message::user("ok"),
            ],
            system_prompt: None,
            tools: None,
            stream: false,
            max_tokens: 100,
            temperature: None,
            metadata: HashMap::new(),
            user_agent: None,
            source_api_type: SourceApiType::AnthropicMessages,
        };
        let bytes = AnthropicCodec.encode_request(&request).unwrap();
        let wire: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(wire.get("system"), Some(&Value::Null));
        let messages = wire.get("messages").unwrap().as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"][0]["text"], "hi");
        assert_eq!(messages[1]["content"][0]["text"], "stay on topic\n\nok");
    }

    #[test]
    fn text_only_blocks_collapse_to_a_string() {
        let content = Content::from_parts(vec![
            ContentPart::Text { text: "Hello ".to_string() },
            ContentPart::Text { text: "world".to_string() },
        ]);
        assert_eq!(content.as_text(), Some("Hello world"));
    }

    #[test]
    fn decode_stream_chunk_extracts_tool_call_index() {
        let chunk = serde_json::json!({
            "type": "content_block_start",
            "index": 2,
            "content_block": {"type": "tool_use", "id": "call_1", "name": "lookup"},
        });
        let events = AnthropicCodec.decode_stream_chunk(&chunk.to_string()).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            CanonicalEvent::ToolCall(chunk) => {
                assert_eq!(chunk.index, 2);
                assert_eq!(chunk.id.as_deref(), Some("call_1"));
                assert_eq!(chunk.name.as_deref(), Some("lookup"));
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn message_delta_yields_finish_before_usage() {
        let chunk = serde_json::json!({
            "type": "message_delta",
            "delta": {"stop_reason": "end_turn", "stop_sequence": null},
            "usage": {"input_tokens": 12, "output_tokens": 34},
        });
        let events = AnthropicCodec.decode_stream_chunk(&chunk.to_string()).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], CanonicalEvent::Finish { reason: FinishReason::Stop }));
        match &events[1] {
            CanonicalEvent::Usage(usage) => {
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 34);
            }
            other => panic!("expected Usage, got {other:?}"),
        }
    }

    #[test]
    fn encoder_defers_message_delta_until_usage_arrives_with_real_numbers() {
        let mut encoder = AnthropicStreamEncoder::new("claude-3-opus");
        let frames = encoder.encode(&CanonicalEvent::Finish { reason: FinishReason::Stop });
        assert!(frames.iter().all(|f| f.event.as_deref() != Some("message_delta")));

        let frames = encoder.encode(&CanonicalEvent::Usage(Usage::new(12, 34)));
        let delta = frames
            .iter()
            .find(|f| f.event.as_deref() == Some("message_delta"))
            .expect("message_delta frame");
        let body: Value = serde_json::from_str(&delta.data).unwrap();
        assert_eq!(body["usage"]["input_tokens"], 12);
        assert_eq!(body["usage"]["output_tokens"], 34);
        assert_eq!(body["delta"]["stop_reason"], "end_turn");

        let stop = frames
            .iter()
            .find(|f| f.event.as_deref() == Some("message_stop"))
            .expect("message_stop frame");
        let stop_body: Value = serde_json::from_str(&stop.data).unwrap();
        assert!(stop_body.get("usage").is_none());
    }
}

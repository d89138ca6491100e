//! OpenAI Responses codec (spec.md §4.1, §4.4, §6.3). Grounded on the
//! compaction-request shapes in `src/llm/openai.rs`
//! (`ResponsesCompactRequest`, `ResponsesInput`, `ResponsesContentPart`),
//! generalized from "compact a history" into the full request/response/
//! stream cycle this frontdoor-and-backend pair needs.
//!
//! The streaming grammar is the seven-event choreography spec.md §4.1
//! describes: `response.created`, `response.in_progress`,
//! `response.output_item.added`, `response.output_text.delta` /
//! `response.function_call_arguments.delta`, `response.output_item.done`,
//! `response.completed`, and a terminal `[DONE]` sentinel. Output-item ids
//! are freshly generated per stream; output-indices are assigned
//! monotonically in the order items are opened.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{
    CanonicalEvent, CanonicalRequest, CanonicalResponse, Choice, Content, ContentPart,
    FinishReason, Message, Role, SourceApiType, ToolCallChunk, ToolDefinition, Usage,
};
use crate::error::{ApiError, ErrorKind};

use super::{Codec, DecodeContext, SseFrame, StreamEncoder};

#[derive(Debug, Deserialize)]
struct WireRequest {
    model: String,
    input: WireInput,
    #[serde(default)]
    instructions: Option<String>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    max_output_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    tools: Option<Vec<WireTool>>,
    #[serde(default)]
    previous_response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireInput {
    Text(String),
    Items(Vec<WireItem>),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireItem {
    Message {
        role: String,
        content: WireContent,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WireContentPart>),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentPart {
    InputText { text: String },
    OutputText { text: String },
}

#[derive(Debug, Deserialize)]
struct WireTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_params")]
    parameters: Value,
}

fn default_params() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Pulled out of `decode_request` so the Responses frontdoor handler can
/// reuse it directly when it walks a `previous_response_id` chain.
pub fn previous_response_id(bytes: &[u8]) -> Option<String> {
    serde_json::from_slice::<WireRequest>(bytes)
        .ok()
        .and_then(|w| w.previous_response_id)
}

pub struct OpenAiResponsesCodec;

impl OpenAiResponsesCodec {
    fn decode_item(item: WireItem) -> Result<Message, ApiError> {
        match item {
            WireItem::Message { role, content } => {
                let role = match role.as_str() {
                    "system" | "developer" => Role::System,
                    "user" => Role::User,
                    "assistant" => Role::Assistant,
                    other => {
                        return Err(ApiError::new(
                            ErrorKind::InvalidRequest,
                            format!("unrecognized input role '{other}'"),
                        )
                        .with_param("input[].role"))
                    }
                };
                let content = match content {
                    WireContent::Text(t) => Content::Text(t),
                    WireContent::Parts(parts) => Content::from_parts(
                        parts
                            .into_iter()
                            .map(|p| match p {
                                WireContentPart::InputText { text } => ContentPart::Text { text },
                                WireContentPart::OutputText { text } => ContentPart::Text { text },
                            })
                            .collect(),
                    ),
                };
                Ok(Message {
                    role,
                    content,
                    name: None,
                    tool_use_id: None,
                })
            }
            WireItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let arguments: Value =
                    serde_json::from_str(&arguments).unwrap_or(Value::String(arguments));
                Ok(Message {
                    role: Role::Assistant,
                    content: Content::Parts(vec![ContentPart::ToolUse {
                        id: call_id,
                        name,
                        arguments,
                    }]),
                    name: None,
                    tool_use_id: None,
                })
            }
            WireItem::FunctionCallOutput { call_id, output } => Ok(Message {
                role: Role::Tool,
                content: Content::Parts(vec![ContentPart::ToolResult {
                    tool_use_id: call_id.clone(),
                    content: output,
                    is_error: false,
                }]),
                name: None,
                tool_use_id: Some(call_id),
            }),
        }
    }

    fn encode_message_item(msg: &Message) -> Vec<Value> {
        let parts = msg.content.parts();
        let mut items = Vec::new();
        let mut text_parts = Vec::new();

        for part in &parts {
            match part {
                ContentPart::Text { text } => text_parts.push(text.clone()),
                ContentPart::ToolUse { id, name, arguments } => {
                    items.push(serde_json::json!({
                        "type": "function_call",
                        "call_id": id,
                        "name": name,
                        "arguments": arguments.to_string(),
                    }));
                }
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    items.push(serde_json::json!({
                        "type": "function_call_output",
                        "call_id": tool_use_id,
                        "output": content,
                    }));
                }
                ContentPart::ImageUrl { .. } | ContentPart::ImageBase64 { .. } | ContentPart::Audio { .. } => {}
            }
        }

        if !text_parts.is_empty() {
            let role = match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "user",
            };
            let part_type = if msg.role == Role::Assistant {
                "output_text"
            } else {
                "input_text"
            };
            items.push(serde_json::json!({
                "type": "message",
                "role": role,
                "content": [{"type": part_type, "text": text_parts.join("")}],
            }));
        }

        items
    }
}

impl Codec for OpenAiResponsesCodec {
    fn decode_request(&self, bytes: &[u8], ctx: DecodeContext) -> Result<CanonicalRequest, ApiError> {
        let wire: WireRequest = serde_json::from_slice(bytes)
            .map_err(|e| ApiError::invalid_request(format!("invalid request body: {e}")))?;

        let mut messages = Vec::new();
        match wire.input {
            WireInput::Text(t) => messages.push(Message::user(t)),
            WireInput::Items(items) => {
                for item in items {
                    messages.push(Self::decode_item(item)?);
                }
            }
        }

        let tools = wire.tools.map(|tools| {
            tools
                .into_iter()
                .map(|t| ToolDefinition {
                    name: t.name,
                    description: t.description,
                    parameters: t.parameters,
                })
                .collect()
        });

        let request = CanonicalRequest {
            tenant_id: ctx.tenant_id,
            model: wire.model,
            messages,
            system_prompt: wire.instructions,
            tools,
            stream: wire.stream,
            max_tokens: wire.max_output_tokens.unwrap_or(4096),
            temperature: wire.temperature,
            metadata: HashMap::new(),
            user_agent: ctx.user_agent,
            source_api_type: ctx.source_api_type,
        };
        request.validate()?;
        Ok(request)
    }

    fn encode_request(&self, request: &CanonicalRequest) -> Result<Vec<u8>, ApiError> {
        let mut input = Vec::new();
        for m in &request.messages {
            input.extend(Self::encode_message_item(m));
        }

        let tools = request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect::<Vec<_>>()
        });

        let body = serde_json::json!({
            "model": request.model,
            "input": input,
            "instructions": request.system_prompt,
            "stream": request.stream,
            "max_output_tokens": request.max_tokens,
            "temperature": request.temperature,
            "tools": tools,
        });
        serde_json::to_vec(&body).map_err(ApiError::from)
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<CanonicalResponse, ApiError> {
        let wire: Value = serde_json::from_slice(bytes)
            .map_err(|e| ApiError::invalid_request(format!("invalid upstream response: {e}")))?;

        let id = wire.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let created = wire
            .get("created_at")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        let model = wire.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string();

        let output: Vec<WireItem> = serde_json::from_value(
            wire.get("output").cloned().unwrap_or(Value::Array(vec![])),
        )
        .map_err(|e| ApiError::invalid_request(format!("invalid output items: {e}")))?;

        let mut parts = Vec::new();
        for item in output {
            match item {
                WireItem::Message { content, .. } => match content {
                    WireContent::Text(t) => parts.push(ContentPart::Text { text: t }),
                    WireContent::Parts(ps) => {
                        for p in ps {
                            let text = match p {
                                WireContentPart::InputText { text } => text,
                                WireContentPart::OutputText { text } => text,
                            };
                            parts.push(ContentPart::Text { text });
                        }
                    }
                },
                WireItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => {
                    let arguments: Value =
                        serde_json::from_str(&arguments).unwrap_or(Value::String(arguments));
                    parts.push(ContentPart::ToolUse {
                        id: call_id,
                        name,
                        arguments,
                    });
                }
                WireItem::FunctionCallOutput { .. } => {}
            }
        }

        let has_tool_use = parts.iter().any(|p| matches!(p, ContentPart::ToolUse { .. }));
        let finish_reason = if has_tool_use {
            FinishReason::ToolCalls
        } else {
            match wire.get("status").and_then(|v| v.as_str()) {
                Some("incomplete") => FinishReason::Length,
                _ => FinishReason::Stop,
            }
        };

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
            created,
            model,
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: Role::Assistant,
                    content: Content::Parts(parts),
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
        let output = Self::encode_message_item(&choice.message);
        let body = serde_json::json!({
            "id": response.id,
            "object": "response",
            "created_at": response.created,
            "model": response.model,
            "status": "completed",
            "output": output,
            "usage": {
                "input_tokens": response.usage.input_tokens,
                "output_tokens": response.usage.output_tokens,
                "total_tokens": response.usage.total_tokens,
            }
        });
        serde_json::to_vec(&body).map_err(ApiError::from)
    }

    fn decode_stream_chunk(&self, sse_data: &str) -> Result<Vec<CanonicalEvent>, ApiError> {
        if sse_data.trim() == "[DONE]" {
            return Ok(vec![]);
        }
        let wire: Value = serde_json::from_str(sse_data)
            .map_err(|e| ApiError::invalid_request(format!("invalid stream chunk: {e}")))?;
        let event_type = wire.get("type").and_then(|v| v.as_str()).unwrap_or("");

        match event_type {
            "response.created" => Ok(vec![CanonicalEvent::RoleAnnouncement { role: Role::Assistant }]),
            "response.output_text.delta" => Ok(vec![CanonicalEvent::ContentDelta {
                text: wire.get("delta").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            }]),
            "response.function_call_arguments.delta" => {
                let index = wire.get("output_index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                Ok(vec![CanonicalEvent::ToolCall(ToolCallChunk {
                    index,
                    id: None,
                    name: None,
                    arguments_delta: wire.get("delta").and_then(|v| v.as_str()).map(str::to_string),
                })])
            }
            "response.output_item.added" => {
                let item = wire.get("item").cloned().unwrap_or(Value::Null);
                if item.get("type").and_then(|v| v.as_str()) == Some("function_call") {
                    let index = wire.get("output_index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                    Ok(vec![CanonicalEvent::ToolCall(ToolCallChunk {
                        index,
                        id: item.get("call_id").and_then(|v| v.as_str()).map(str::to_string),
                        name: item.get("name").and_then(|v| v.as_str()).map(str::to_string),
                        arguments_delta: None,
                    })])
                } else {
                    Ok(vec![])
                }
            }
            "response.completed" => {
                // The real API puts both the final output (to detect
                // tool-calls) and the final token usage on this one event's
                // nested `response` object — `Finish` must come first per
                // spec.md §3/§8, with `Usage` appended when present.
                let response = wire.get("response").cloned().unwrap_or(Value::Null);
                let has_tool_call = response
                    .get("output")
                    .and_then(|o| o.as_array())
                    .map(|items| items.iter().any(|i| i.get("type").and_then(|v| v.as_str()) == Some("function_call")))
                    .unwrap_or(false);
                let mut events = vec![CanonicalEvent::Finish {
                    reason: if has_tool_call {
                        FinishReason::ToolCalls
                    } else {
                        FinishReason::Stop
                    },
                }];
                if let Some(usage) = response.get("usage").filter(|u| !u.is_null()) {
                    events.push(CanonicalEvent::Usage(Usage::new(
                        usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                        usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    )));
                }
                Ok(events)
            }
            "response.in_progress" | "response.content_part.done" | "response.output_item.done" => Ok(vec![]),
            _ => Ok(vec![]),
        }
    }

    fn new_stream_encoder(&self, model: &str) -> Box<dyn StreamEncoder> {
        Box::new(OpenAiResponsesStreamEncoder::new(model))
    }
}

struct OpenAiResponsesStreamEncoder {
    id: String,
    model: String,
    created: bool,
    item_open: bool,
    output_index: u32,
    /// Set by `Finish`, consumed by `Usage`: real `response.completed`
    /// carries both the final status and `usage` in one event, but the
    /// canonical stream yields them as two ordered events (spec.md §3/§8
    /// guarantees `Usage` follows `Finish`), so `response.completed` itself
    /// is deferred until the usage number is actually in hand.
    pending_finish: Option<FinishReason>,
}

impl OpenAiResponsesStreamEncoder {
    fn new(model: &str) -> Self {
        OpenAiResponsesStreamEncoder {
            id: format!("resp_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: false,
            item_open: false,
            output_index: 0,
            pending_finish: None,
        }
    }

    fn response_envelope(&self, status: &str, usage: Option<&Usage>) -> Value {
        serde_json::json!({
            "id": self.id,
            "object": "response",
            "model": self.model,
            "status": status,
            "output": [],
            "usage": usage.map(|u| serde_json::json!({
                "input_tokens": u.input_tokens,
                "output_tokens": u.output_tokens,
                "total_tokens": u.total_tokens,
            })),
        })
    }

    fn open_item(&mut self, frames: &mut Vec<SseFrame>) {
        if self.item_open {
            return;
        }
        self.item_open = true;
        frames.push(SseFrame::named(
            "response.output_item.added",
            serde_json::json!({
                "type": "response.output_item.added",
                "output_index": self.output_index,
                "item": {"type": "message", "id": format!("msg_{}", uuid::Uuid::new_v4().simple()), "role": "assistant", "content": []},
            })
            .to_string(),
        ));
    }
}

impl StreamEncoder for OpenAiResponsesStreamEncoder {
    fn encode(&mut self, event: &CanonicalEvent) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.created {
            self.created = true;
            frames.push(SseFrame::named(
                "response.created",
                serde_json::json!({"type": "response.created", "response": self.response_envelope("in_progress", None)}).to_string(),
            ));
            frames.push(SseFrame::named(
                "response.in_progress",
                serde_json::json!({"type": "response.in_progress", "response": self.response_envelope("in_progress", None)}).to_string(),
            ));
        }

        match event {
            CanonicalEvent::RoleAnnouncement { .. } => {}
            CanonicalEvent::ContentDelta { text } => {
                self.open_item(&mut frames);
                frames.push(SseFrame::named(
                    "response.output_text.delta",
                    serde_json::json!({
                        "type": "response.output_text.delta",
                        "output_index": self.output_index,
                        "delta": text,
                    })
                    .to_string(),
                ));
            }
            CanonicalEvent::ToolCall(chunk) => {
                self.open_item(&mut frames);
                frames.push(SseFrame::named(
                    "response.function_call_arguments.delta",
                    serde_json::json!({
                        "type": "response.function_call_arguments.delta",
                        "output_index": self.output_index,
                        "item_id": chunk.id,
                        "delta": chunk.arguments_delta.clone().unwrap_or_default(),
                    })
                    .to_string(),
                ));
            }
            CanonicalEvent::Finish { reason } => {
                if self.item_open {
                    frames.push(SseFrame::named(
                        "response.content_part.done",
                        serde_json::json!({"type": "response.content_part.done", "output_index": self.output_index}).to_string(),
                    ));
                    frames.push(SseFrame::named(
                        "response.output_item.done",
                        serde_json::json!({"type": "response.output_item.done", "output_index": self.output_index}).to_string(),
                    ));
                    self.item_open = false;
                    self.output_index += 1;
                }
                self.pending_finish = Some(*reason);
            }
            CanonicalEvent::Usage(usage) => {
                let reason = self.pending_finish.take().unwrap_or(FinishReason::Stop);
                let status = if reason == FinishReason::ToolCalls {
                    "requires_action"
                } else {
                    "completed"
                };
                frames.push(SseFrame::named(
                    "response.completed",
                    serde_json::json!({
                        "type": "response.completed",
                        "response": self.response_envelope(status, Some(usage)),
                    })
                    .to_string(),
                ));
                frames.push(SseFrame::data("[DONE]"));
            }
            CanonicalEvent::Error(err) => {
                frames.push(SseFrame::named(
                    "error",
                    serde_json::json!({
                        "type": "error",
                        "error": {"type": err.kind.openai_type(), "message": err.message},
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
            source_api_type: SourceApiType::OpenAiResponses,
        }
    }

    #[test]
    fn instructions_become_the_system_prompt() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "input": "hi",
            "instructions": "be terse",
        });
        let request = OpenAiResponsesCodec
            .decode_request(body.to_string().as_bytes(), ctx())
            .unwrap();
        assert_eq!(request.system_prompt.as_deref(), Some("be terse"));
    }

    #[test]
    fn text_only_parts_collapse_to_a_string() {
        let content = Content::from_parts(vec![
            ContentPart::Text { text: "Hello ".to_string() },
            ContentPart::Text { text: "world".to_string() },
        ]);
        assert_eq!(content.as_text(), Some("Hello world"));
    }

    #[test]
    fn response_completed_yields_finish_before_usage() {
        let chunk = serde_json::json!({
            "type": "response.completed",
            "response": {
                "output": [],
                "usage": {"input_tokens": 7, "output_tokens": 21},
            },
        });
        let events = OpenAiResponsesCodec.decode_stream_chunk(&chunk.to_string()).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], CanonicalEvent::Finish { reason: FinishReason::Stop }));
        match &events[1] {
            CanonicalEvent::Usage(usage) => {
                assert_eq!(usage.input_tokens, 7);
                assert_eq!(usage.output_tokens, 21);
            }
            other => panic!("expected Usage, got {other:?}"),
        }
    }

    #[test]
    fn response_completed_with_function_call_output_finishes_as_tool_calls() {
        let chunk = serde_json::json!({
            "type": "response.completed",
            "response": {
                "output": [{"type": "function_call", "call_id": "call_1", "name": "lookup"}],
            },
        });
        let events = OpenAiResponsesCodec.decode_stream_chunk(&chunk.to_string()).unwrap();
        assert!(matches!(events[0], CanonicalEvent::Finish { reason: FinishReason::ToolCalls }));
    }

    #[test]
    fn done_sentinel_decodes_to_no_events() {
        assert!(OpenAiResponsesCodec.decode_stream_chunk("[DONE]").unwrap().is_empty());
    }

    #[test]
    fn encoder_defers_response_completed_until_usage_arrives_with_real_numbers() {
        let mut encoder = OpenAiResponsesStreamEncoder::new("gpt-4o");
        let frames = encoder.encode(&CanonicalEvent::Finish { reason: FinishReason::Stop });
        assert!(frames.iter().all(|f| f.event.as_deref() != Some("response.completed")));
        assert!(frames.iter().all(|f| f.data != "[DONE]"));

        let frames = encoder.encode(&CanonicalEvent::Usage(Usage::new(7, 21)));
        let completed = frames
            .iter()
            .find(|f| f.event.as_deref() == Some("response.completed"))
            .expect("response.completed frame");
        let body: Value = serde_json::from_str(&completed.data).unwrap();
        assert_eq!(body["response"]["usage"]["input_tokens"], 7);
        assert_eq!(body["response"]["usage"]["output_tokens"], 21);
        assert_eq!(body["response"]["status"], "completed");
        assert!(frames.iter().any(|f| f.data == "[DONE]"));
    }
}

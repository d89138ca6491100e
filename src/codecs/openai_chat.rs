//! OpenAI Chat Completions codec (spec.md §6.1, §4.1). Grounded on the wire
//! shapes in `src/llm/openai.rs` (`ChatCompletionRequest`, `ChatMessage`,
//! `ChatCompletionChunk`, `Delta`, `ToolCallDelta`), split into a pure
//! decode/encode pair instead of the teacher's request-building style.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{
    CanonicalEvent, CanonicalRequest, CanonicalResponse, Choice, Content, ContentPart,
    FinishReason, Message, Role, SourceApiType, ToolCallChunk, ToolDefinition, Usage,
};
use crate::error::{ApiError, ErrorKind};

use super::finish_reason::{finish_reason_from_openai, finish_reason_to_openai};
use super::{Codec, DecodeContext, SseFrame, StreamEncoder};

#[derive(Debug, Deserialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    max_completion_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    tools: Option<Vec<WireTool>>,
    #[serde(default)]
    stream_options: Option<Value>,
}

#[derive(Debug, Deserialize, Serialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tool_call_id: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WireContentPart>),
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentPart {
    Text { text: String },
    ImageUrl { image_url: WireImageUrl },
    InputAudio { input_audio: WireAudio },
}

#[derive(Debug, Deserialize, Serialize)]
struct WireImageUrl {
    url: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct WireAudio {
    data: String,
    #[serde(default = "default_audio_format")]
    format: String,
}

fn default_audio_format() -> String {
    "wav".to_string()
}

#[derive(Debug, Deserialize, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Debug, Deserialize, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireTool {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    kind: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_params")]
    parameters: Value,
}

fn default_params() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

pub struct OpenAiChatCodec;

impl OpenAiChatCodec {
    fn decode_message(msg: WireMessage) -> Result<Message, ApiError> {
        let role = match msg.role.as_str() {
            "system" | "developer" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            other => {
                return Err(ApiError::new(
                    ErrorKind::InvalidRequest,
                    format!("unrecognized message role '{other}'"),
                )
                .with_param("messages[].role"))
            }
        };

        let mut content = match msg.content {
            Some(WireContent::Text(t)) => Content::Text(t),
            Some(WireContent::Parts(parts)) => {
                let mut out = Vec::with_capacity(parts.len());
                for part in parts {
                    out.push(match part {
                        WireContentPart::Text { text } => ContentPart::Text { text },
                        WireContentPart::ImageUrl { image_url } => {
                            ContentPart::ImageUrl { url: image_url.url }
                        }
                        WireContentPart::InputAudio { input_audio } => ContentPart::Audio {
                            media_type: input_audio.format,
                            data: input_audio.data,
                        },
                    });
                }
                Content::from_parts(out)
            }
            None => Content::Text(String::new()),
        };

        // Fold assistant-side tool_calls into tool_use content parts so the
        // canonical model has a single representation regardless of which
        // wire field carried them (spec.md §4.1 "Tool calls").
        if let Some(tool_calls) = msg.tool_calls {
            let mut parts = content.parts();
            for call in tool_calls {
                let arguments: Value = serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::String(call.function.arguments));
                parts.push(ContentPart::ToolUse {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                });
            }
            content = Content::Parts(parts);
        }

        if role == Role::Tool {
            if let Some(tool_call_id) = &msg.tool_call_id {
                let text = content.as_text().map(|s| s.to_string()).unwrap_or_default();
                content = Content::Parts(vec![ContentPart::ToolResult {
                    tool_use_id: tool_call_id.clone(),
                    content: text,
                    is_error: false,
                }]);
            }
        }

        Ok(Message {
            role,
            content,
            name: msg.name,
            tool_use_id: msg.tool_call_id,
        })
    }

    fn encode_message(msg: &Message) -> WireMessage {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
        .to_string();

        let parts = msg.content.parts();
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut tool_call_id = msg.tool_use_id.clone();

        for part in &parts {
            match part {
                ContentPart::Text { text } => text_parts.push(text.clone()),
                ContentPart::ToolUse { id, name, arguments } => {
                    tool_calls.push(WireToolCall {
                        id: id.clone(),
                        kind: "function".to_string(),
                        function: WireFunctionCall {
                            name: name.clone(),
                            arguments: arguments.to_string(),
                        },
                    });
                }
                ContentPart::ToolResult {
                    tool_use_id: id,
                    content,
                    ..
                } => {
                    tool_call_id.get_or_insert_with(|| id.clone());
                    text_parts.push(content.clone());
                }
                ContentPart::ImageUrl { .. } | ContentPart::ImageBase64 { .. } | ContentPart::Audio { .. } => {}
            }
        }

        let content = if text_parts.is_empty() {
            None
        } else {
            Some(WireContent::Text(text_parts.join("")))
        };

        WireMessage {
            role,
            content,
            name: msg.name.clone(),
            tool_call_id,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
        }
    }
}

impl Codec for OpenAiChatCodec {
    fn decode_request(&self, bytes: &[u8], ctx: DecodeContext) -> Result<CanonicalRequest, ApiError> {
        let wire: WireRequest = serde_json::from_slice(bytes)
            .map_err(|e| ApiError::invalid_request(format!("invalid request body: {e}")))?;

        let mut messages = Vec::with_capacity(wire.messages.len());
        for m in wire.messages {
            messages.push(Self::decode_message(m)?);
        }

        let tools = wire.tools.map(|tools| {
            tools
                .into_iter()
                .map(|t| ToolDefinition {
                    name: t.function.name,
                    description: t.function.description,
                    parameters: t.function.parameters,
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
            max_tokens: wire.max_completion_tokens.or(wire.max_tokens).unwrap_or(4096),
            temperature: wire.temperature,
            metadata: HashMap::new(),
            user_agent: ctx.user_agent,
            source_api_type: ctx.source_api_type,
        };
        request.validate()?;
        Ok(request)
    }

    fn encode_request(&self, request: &CanonicalRequest) -> Result<Vec<u8>, ApiError> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: Some(WireContent::Text(system.clone())),
                name: None,
                tool_call_id: None,
                tool_calls: None,
            });
        }
        for m in &request.messages {
            messages.push(Self::encode_message(m));
        }

        let tools = request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect::<Vec<_>>()
        });

        let body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": request.stream,
            "max_completion_tokens": request.max_tokens,
            "temperature": request.temperature,
            "tools": tools,
            "stream_options": if request.stream { Some(serde_json::json!({"include_usage": true})) } else { None },
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
        let created = wire.get("created").and_then(|v| v.as_i64()).unwrap_or(0);
        let model = wire
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let choice = wire
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| ApiError::invalid_request("upstream response missing choices[0]"))?;

        let wire_message: WireMessage = serde_json::from_value(
            choice.get("message").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| ApiError::invalid_request(format!("invalid choices[0].message: {e}")))?;
        let message = Self::decode_message(wire_message)?;

        let finish_reason = choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(finish_reason_from_openai)
            .unwrap_or(FinishReason::Stop);

        let usage = wire
            .get("usage")
            .map(|u| {
                Usage::new(
                    u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                )
            })
            .unwrap_or_default();

        Ok(CanonicalResponse {
            id,
            created,
            model,
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason,
            }],
            usage,
        })
    }

    fn encode_response(&self, response: &CanonicalResponse) -> Result<Vec<u8>, ApiError> {
        let choice = response.first_choice();
        let body = serde_json::json!({
            "id": response.id,
            "object": "chat.completion",
            "created": response.created,
            "model": response.model,
            "choices": [{
                "index": choice.index,
                "message": Self::encode_message(&choice.message),
                "finish_reason": finish_reason_to_openai(choice.finish_reason),
            }],
            "usage": {
                "prompt_tokens": response.usage.input_tokens,
                "completion_tokens": response.usage.output_tokens,
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

        // `stream_options: {include_usage: true}` trailer: a chunk with an
        // empty `choices` array and the real token counts, sent after the
        // chunk carrying `finish_reason` (spec.md §4.1).
        if let Some(usage) = wire.get("usage").filter(|u| !u.is_null()) {
            return Ok(vec![CanonicalEvent::Usage(Usage::new(
                usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            ))]);
        }

        let choice = match wire.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first()) {
            Some(c) => c,
            None => return Ok(vec![]),
        };

        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            return Ok(vec![CanonicalEvent::Finish {
                reason: finish_reason_from_openai(reason),
            }]);
        }

        let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

        if let Some(role) = delta.get("role").and_then(|v| v.as_str()) {
            let role = match role {
                "assistant" => Role::Assistant,
                "user" => Role::User,
                "system" => Role::System,
                _ => Role::Assistant,
            };
            return Ok(vec![CanonicalEvent::RoleAnnouncement { role }]);
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            if let Some(call) = tool_calls.first() {
                let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                let id = call.get("id").and_then(|v| v.as_str()).map(str::to_string);
                let function = call.get("function").cloned().unwrap_or(Value::Null);
                let name = function.get("name").and_then(|v| v.as_str()).map(str::to_string);
                let arguments_delta = function
                    .get("arguments")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                return Ok(vec![CanonicalEvent::ToolCall(ToolCallChunk {
                    index,
                    id,
                    name,
                    arguments_delta,
                })]);
            }
        }

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            return Ok(vec![CanonicalEvent::ContentDelta {
                text: text.to_string(),
            }]);
        }

        Ok(vec![])
    }

    fn new_stream_encoder(&self, model: &str) -> Box<dyn StreamEncoder> {
        Box::new(OpenAiChatStreamEncoder::new().with_model(model))
    }
}

struct OpenAiChatStreamEncoder {
    id: String,
    created: i64,
    model: String,
    role_sent: bool,
}

impl OpenAiChatStreamEncoder {
    fn new() -> Self {
        OpenAiChatStreamEncoder {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            created: chrono::Utc::now().timestamp(),
            model: String::new(),
            role_sent: false,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> SseFrame {
        let body = serde_json::json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        SseFrame::data(body.to_string())
    }

    /// The trailing usage-only frame OpenAI sends with `stream_options:
    /// {include_usage: true}` — an empty `choices` array alongside `usage`.
    fn usage_chunk(&self, usage: Value) -> SseFrame {
        let body = serde_json::json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [],
            "usage": usage,
        });
        SseFrame::data(body.to_string())
    }
}

impl StreamEncoder for OpenAiChatStreamEncoder {
    fn encode(&mut self, event: &CanonicalEvent) -> Vec<SseFrame> {
        match event {
            CanonicalEvent::RoleAnnouncement { .. } => {
                if self.role_sent {
                    return vec![];
                }
                self.role_sent = true;
                vec![self.chunk(serde_json::json!({"role": "assistant"}), None)]
            }
            CanonicalEvent::ContentDelta { text } => {
                vec![self.chunk(serde_json::json!({"content": text}), None)]
            }
            CanonicalEvent::ToolCall(chunk) => {
                let delta = serde_json::json!({
                    "tool_calls": [{
                        "index": chunk.index,
                        "id": chunk.id,
                        "type": "function",
                        "function": {
                            "name": chunk.name,
                            "arguments": chunk.arguments_delta,
                        }
                    }]
                });
                vec![self.chunk(delta, None)]
            }
            CanonicalEvent::Finish { reason } => {
                vec![self.chunk(serde_json::json!({}), Some(finish_reason_to_openai(*reason)))]
            }
            CanonicalEvent::Usage(usage) => {
                let usage_json = serde_json::json!({
                    "prompt_tokens": usage.input_tokens,
                    "completion_tokens": usage.output_tokens,
                    "total_tokens": usage.total_tokens,
                });
                vec![self.usage_chunk(usage_json)]
            }
            CanonicalEvent::Error(err) => {
                vec![SseFrame::data(
                    serde_json::json!({
                        "error": {
                            "type": err.kind.openai_type(),
                            "code": err.code,
                            "message": err.message,
                            "param": err.param,
                        }
                    })
                    .to_string(),
                )]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> DecodeContext {
        DecodeContext {
            tenant_id: "default".to_string(),
            user_agent: None,
            source_api_type: SourceApiType::OpenAiChat,
        }
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
    fn image_part_prevents_collapse() {
        let content = Content::from_parts(vec![
            ContentPart::Text { text: "look at this".to_string() },
            ContentPart::ImageUrl { url: "https://example.com/x.png".to_string() },
        ]);
        assert!(matches!(content, Content::Parts(_)));
    }

    #[test]
    fn tool_calls_fold_into_content_parts() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "what's 2+2"},
                {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "add", "arguments": "{\"a\":2,\"b\":2}"},
                    }],
                },
            ],
        });
        let request = OpenAiChatCodec.decode_request(body.to_string().as_bytes(), ctx()).unwrap();
        let parts = request.messages[1].content.parts();
        assert!(parts.iter().any(|p| matches!(
            p,
            ContentPart::ToolUse { id, name, .. } if id == "call_1" && name == "add"
        )));
    }

    #[test]
    fn decode_stream_chunk_tool_call_reassembles_via_index() {
        let first = serde_json::json!({
            "choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "add", "arguments": ""}}]}}],
        });
        let second = serde_json::json!({
            "choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"a\":1}"}}]}}],
        });
        let events_a = OpenAiChatCodec.decode_stream_chunk(&first.to_string()).unwrap();
        let events_b = OpenAiChatCodec.decode_stream_chunk(&second.to_string()).unwrap();
        let (index_a, index_b) = match (&events_a[0], &events_b[0]) {
            (CanonicalEvent::ToolCall(a), CanonicalEvent::ToolCall(b)) => (a.index, b.index),
            _ => panic!("expected ToolCall events"),
        };
        assert_eq!(index_a, index_b);
    }

    #[test]
    fn usage_trailer_is_decoded_independently_of_finish_chunk() {
        let finish = serde_json::json!({"choices": [{"delta": {}, "finish_reason": "stop"}]});
        let trailer = serde_json::json!({"choices": [], "usage": {"prompt_tokens": 10, "completion_tokens": 5}});

        let finish_events = OpenAiChatCodec.decode_stream_chunk(&finish.to_string()).unwrap();
        assert!(matches!(finish_events[0], CanonicalEvent::Finish { reason: FinishReason::Stop }));

        let trailer_events = OpenAiChatCodec.decode_stream_chunk(&trailer.to_string()).unwrap();
        match &trailer_events[0] {
            CanonicalEvent::Usage(usage) => {
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 5);
            }
            other => panic!("expected Usage, got {other:?}"),
        }
    }

    #[test]
    fn done_sentinel_decodes_to_no_events() {
        assert!(OpenAiChatCodec.decode_stream_chunk("[DONE]").unwrap().is_empty());
    }

    #[test]
    fn stream_encoder_round_trips_role_content_and_finish() {
        let mut encoder = OpenAiChatStreamEncoder::new().with_model("gpt-4o");
        let role_frames = encoder.encode(&CanonicalEvent::RoleAnnouncement { role: Role::Assistant });
        assert_eq!(role_frames.len(), 1);
        // A second role announcement is a no-op — only sent once per stream.
        assert!(encoder.encode(&CanonicalEvent::RoleAnnouncement { role: Role::Assistant }).is_empty());

        let delta_frames = encoder.encode(&CanonicalEvent::ContentDelta { text: "hi".to_string() });
        let body: Value = serde_json::from_str(&delta_frames[0].data).unwrap();
        assert_eq!(body["choices"][0]["delta"]["content"], "hi");

        let finish_frames = encoder.encode(&CanonicalEvent::Finish { reason: FinishReason::Stop });
        let body: Value = serde_json::from_str(&finish_frames[0].data).unwrap();
        assert_eq!(body["choices"][0]["finish_reason"], "stop");

        let usage_frames = encoder.encode(&CanonicalEvent::Usage(Usage::new(10, 5)));
        let body: Value = serde_json::from_str(&usage_frames[0].data).unwrap();
        assert_eq!(body["choices"].as_array().unwrap().len(), 0);
        assert_eq!(body["usage"]["prompt_tokens"], 10);
        assert_eq!(body["usage"]["completion_tokens"], 5);
    }
}

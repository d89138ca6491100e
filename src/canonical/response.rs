use serde::{Deserialize, Serialize};

use super::request::Message;

/// Why generation stopped. Table-driven mapping to/from each wire format
/// lives in `src/codecs/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Usage {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: FinishReason,
}

/// The fully-decoded, provider-agnostic non-streaming response. spec.md §3:
/// exactly one choice in every code path exercised by this gateway.
#[derive(Debug, Clone)]
pub struct CanonicalResponse {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl CanonicalResponse {
    pub fn first_choice(&self) -> &Choice {
        &self.choices[0]
    }
}

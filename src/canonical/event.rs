use super::request::Role;
use super::response::{FinishReason, Usage};
use crate::error::ApiError;

/// An incremental update to a single (possibly concurrent) tool call.
/// Chunks sharing the same `index` must be concatenated, in arrival order,
/// to reassemble `arguments` into valid JSON (spec.md §3, §8).
#[derive(Debug, Clone)]
pub struct ToolCallChunk {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments_delta: Option<String>,
}

/// A single element of a canonical stream. Ordering contract (spec.md §3):
/// for one completion, `RoleAnnouncement → (ContentDelta | ToolCallChunk)* →
/// Finish → Usage → end-of-stream`. Modeled as a tagged union rather than an
/// optional-fields struct per spec.md §9's design note — callers match on
/// the variant instead of checking which optional field is populated.
#[derive(Debug, Clone)]
pub enum CanonicalEvent {
    RoleAnnouncement { role: Role },
    ContentDelta { text: String },
    ToolCall(ToolCallChunk),
    Finish { reason: FinishReason },
    Usage(Usage),
    Error(ApiError),
}

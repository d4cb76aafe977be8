use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A dialect-neutral intermediate representation. Parsing any of the three
/// wire dialects into this shape, then rendering it back out, is what
/// actually implements the "six unary conversions" of spec §4.6: each
/// dialect contributes one parse function and one render function instead
/// of a hand-written matrix of nine pairwise converters.
#[derive(Debug, Clone, Default)]
pub struct CanonicalRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<CanonicalMessage>,
    pub tools: Vec<Value>,
    pub stream: bool,
    pub max_tokens: Option<u32>,
    /// Anything the parser didn't recognize, carried through so a
    /// round-trip doesn't silently drop upstream-specific fields (spec §9
    /// passthrough-blob design note).
    pub extra: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct CanonicalResponse {
    pub id: String,
    pub model: String,
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: super::usage_extract::RawUsage,
    /// Tool/function calls in a dialect-neutral `{id, name, arguments}`
    /// shape, carried across a cross-dialect render instead of being
    /// silently dropped with only plain text surviving.
    pub tool_calls: Vec<Value>,
    /// The original response body, so a same-dialect render can restore
    /// fields this type doesn't model (mirrors `CanonicalRequest::extra`).
    pub extra: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
}

impl FinishReason {
    pub fn to_messages_style(self) -> &'static str {
        match self {
            FinishReason::Stop => "end_turn",
            FinishReason::Length => "max_tokens",
            FinishReason::ContentFilter => "stop_sequence",
            FinishReason::ToolCalls => "tool_use",
        }
    }

    pub fn to_openai_style(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::ToolCalls => "tool_calls",
        }
    }

    /// `stop->STOP`, `length->MAX_TOKENS`, `content_filter->SAFETY`,
    /// `tool_calls->STOP`, other->`STOP` (spec §4.6).
    pub fn to_gemini_style(self) -> &'static str {
        match self {
            FinishReason::Stop => "STOP",
            FinishReason::Length => "MAX_TOKENS",
            FinishReason::ContentFilter => "SAFETY",
            FinishReason::ToolCalls => "STOP",
        }
    }

    pub fn from_messages_style(s: &str) -> Self {
        match s {
            "max_tokens" => FinishReason::Length,
            "stop_sequence" => FinishReason::ContentFilter,
            "tool_use" => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }
    }

    pub fn from_openai_style(s: &str) -> Self {
        match s {
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            "tool_calls" => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }
    }

    pub fn from_gemini_style(s: &str) -> Self {
        match s {
            "MAX_TOKENS" => FinishReason::Length,
            "SAFETY" | "RECITATION" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }
}

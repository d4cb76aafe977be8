use serde_json::{json, Value};

use crate::models::channel::ServiceType;
use crate::models::Usage;

use super::canonical::FinishReason;
use super::usage_extract::{
    extract_gemini_style_usage, extract_messages_style_usage, extract_openai_style_usage, RawUsage,
};

/// Dialect-neutral streaming event, parsed out of one upstream SSE frame
/// and rendered back out in the client's dialect. This is the streaming
/// analogue of [`super::canonical::CanonicalRequest`]/`CanonicalResponse`
/// and is what actually implements the three streaming conversions named
/// in spec §4.6.
#[derive(Debug, Clone)]
enum StreamEvent {
    MessageStart { model: String },
    TextDelta(String),
    Finish(FinishReason),
    Usage(RawUsage),
    Done,
}

/// Incrementally parses raw upstream SSE bytes into complete frames,
/// tolerating chunk boundaries that split mid-line.
#[derive(Default)]
struct FrameScanner {
    pending: String,
}

impl FrameScanner {
    fn push(&mut self, chunk: &[u8]) -> Vec<(Option<String>, String)> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        let mut frames = Vec::new();

        while let Some(boundary) = self.pending.find("\n\n") {
            let frame = self.pending[..boundary].to_string();
            self.pending.drain(..boundary + 2);
            let mut event_name = None;
            let mut data_lines = Vec::new();
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event_name = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.trim().to_string());
                }
            }
            if !data_lines.is_empty() {
                frames.push((event_name, data_lines.join("\n")));
            }
        }
        frames
    }
}

fn parse_source_events(dialect: ServiceType, event_name: Option<&str>, data: &str) -> Vec<StreamEvent> {
    if data == "[DONE]" {
        return vec![StreamEvent::Done];
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    match dialect {
        ServiceType::MessagesStyle => parse_messages_stream_event(event_name, &value),
        ServiceType::OpenaiStyle => parse_openai_stream_event(&value),
        ServiceType::GeminiStyle => parse_gemini_stream_event(&value),
    }
}

fn parse_messages_stream_event(event_name: Option<&str>, value: &Value) -> Vec<StreamEvent> {
    match event_name {
        Some("message_start") => {
            let model = value
                .get("message")
                .and_then(|m| m.get("model"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            vec![StreamEvent::MessageStart { model }]
        }
        Some("content_block_delta") => {
            let text = value
                .get("delta")
                .and_then(|d| d.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            vec![StreamEvent::TextDelta(text)]
        }
        Some("message_delta") => {
            let mut events = Vec::new();
            if let Some(reason) = value.get("delta").and_then(|d| d.get("stop_reason")).and_then(Value::as_str) {
                events.push(StreamEvent::Finish(FinishReason::from_messages_style(reason)));
            }
            if let Some(usage) = value.get("usage") {
                events.push(StreamEvent::Usage(extract_messages_style_usage(usage)));
            }
            events
        }
        Some("message_stop") => vec![StreamEvent::Done],
        _ => Vec::new(),
    }
}

fn parse_openai_stream_event(value: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if let Some(model) = value.get("model").and_then(Value::as_str) {
        events.push(StreamEvent::MessageStart { model: model.to_string() });
    }
    if let Some(choice) = value.get("choices").and_then(Value::as_array).and_then(|a| a.first()) {
        if let Some(text) = choice.get("delta").and_then(|d| d.get("content")).and_then(Value::as_str) {
            events.push(StreamEvent::TextDelta(text.to_string()));
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            events.push(StreamEvent::Finish(FinishReason::from_openai_style(reason)));
        }
    }
    if let Some(usage) = value.get("usage") {
        events.push(StreamEvent::Usage(extract_openai_style_usage(usage)));
    }
    events
}

fn parse_gemini_stream_event(value: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if let Some(candidate) = value.get("candidates").and_then(Value::as_array).and_then(|a| a.first()) {
        if let Some(text) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .and_then(|parts| parts.first())
            .and_then(|p| p.get("text"))
            .and_then(Value::as_str)
        {
            events.push(StreamEvent::TextDelta(text.to_string()));
        }
        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            events.push(StreamEvent::Finish(FinishReason::from_gemini_style(reason)));
        }
    }
    if let Some(usage) = value.get("usageMetadata") {
        events.push(StreamEvent::Usage(extract_gemini_style_usage(usage)));
    }
    events
}

fn render_target_event(dialect: ServiceType, event: &StreamEvent, client_model: &str, id: &str) -> Option<String> {
    match (dialect, event) {
        (_, StreamEvent::Done) => Some(render_done(dialect)),
        (ServiceType::MessagesStyle, StreamEvent::MessageStart { .. }) => Some(sse_frame(
            Some("message_start"),
            &json!({"type": "message_start", "message": {"id": id, "type": "message", "role": "assistant", "model": client_model, "content": []}}),
        )),
        (ServiceType::MessagesStyle, StreamEvent::TextDelta(text)) => Some(sse_frame(
            Some("content_block_delta"),
            &json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}}),
        )),
        (ServiceType::MessagesStyle, StreamEvent::Finish(reason)) => Some(sse_frame(
            Some("message_delta"),
            &json!({"type": "message_delta", "delta": {"stop_reason": reason.to_messages_style()}}),
        )),
        (ServiceType::MessagesStyle, StreamEvent::Usage(_)) => None,

        (ServiceType::OpenaiStyle, StreamEvent::MessageStart { .. }) => None,
        (ServiceType::OpenaiStyle, StreamEvent::TextDelta(text)) => Some(sse_frame(
            None,
            &json!({"id": id, "object": "chat.completion.chunk", "model": client_model, "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]}),
        )),
        (ServiceType::OpenaiStyle, StreamEvent::Finish(reason)) => Some(sse_frame(
            None,
            &json!({"id": id, "object": "chat.completion.chunk", "model": client_model, "choices": [{"index": 0, "delta": {}, "finish_reason": reason.to_openai_style()}]}),
        )),
        (ServiceType::OpenaiStyle, StreamEvent::Usage(_)) => None,

        (ServiceType::GeminiStyle, StreamEvent::MessageStart { .. }) => None,
        (ServiceType::GeminiStyle, StreamEvent::TextDelta(text)) => Some(sse_frame(
            None,
            &json!({"candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]}),
        )),
        (ServiceType::GeminiStyle, StreamEvent::Finish(reason)) => Some(sse_frame(
            None,
            &json!({"candidates": [{"finishReason": reason.to_gemini_style()}]}),
        )),
        (ServiceType::GeminiStyle, StreamEvent::Usage(_)) => None,
    }
}

fn render_done(dialect: ServiceType) -> String {
    match dialect {
        ServiceType::MessagesStyle => sse_frame(Some("message_stop"), &json!({"type": "message_stop"})),
        ServiceType::OpenaiStyle | ServiceType::GeminiStyle => "data: [DONE]\n\n".to_string(),
    }
}

fn sse_frame(event: Option<&str>, data: &Value) -> String {
    let mut out = String::new();
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    out.push_str("data: ");
    out.push_str(&data.to_string());
    out.push_str("\n\n");
    out
}

/// Stateful per-stream translator. Converts upstream SSE in `from`'s
/// dialect into client SSE in `to`'s dialect, rewrites `message.model` to
/// the client-requested model on `message_start` (spec §4.6 model-field
/// patching), and accumulates usage for the dispatcher to record once the
/// stream terminates.
pub struct SseTranslator {
    from: ServiceType,
    to: ServiceType,
    client_model: String,
    response_id: String,
    scanner: FrameScanner,
    usage: RawUsage,
    done: bool,
    start_emitted: bool,
}

impl SseTranslator {
    pub fn new(from: ServiceType, to: ServiceType, client_model: String, response_id: String) -> Self {
        Self {
            from,
            to,
            client_model,
            response_id,
            scanner: FrameScanner::default(),
            usage: RawUsage::default(),
            done: false,
            start_emitted: false,
        }
    }

    /// Passthrough fast path: identical dialects skip canonical-event
    /// reparsing, but frames still need their `model` field rewritten to
    /// the client-requested name (spec §4.6 model-field patching) since a
    /// `model_mapping` entry can substitute an upstream name even when the
    /// wire dialect doesn't change.
    pub fn is_passthrough(&self) -> bool {
        self.from == self.to
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.is_passthrough() {
            let mut out = String::new();
            for (event_name, data) in self.scanner.push(chunk) {
                for event in parse_source_events(self.from, event_name.as_deref(), &data) {
                    match event {
                        StreamEvent::Usage(u) => self.usage = u,
                        StreamEvent::Done => self.done = true,
                        _ => {}
                    }
                }
                out.push_str(&self.render_passthrough_frame(event_name.as_deref(), &data));
            }
            return out.into_bytes();
        }
        let mut out = String::new();
        for (event_name, data) in self.scanner.push(chunk) {
            for event in parse_source_events(self.from, event_name.as_deref(), &data) {
                if matches!(event, StreamEvent::MessageStart { .. }) {
                    if self.start_emitted {
                        continue;
                    }
                    self.start_emitted = true;
                }
                if let StreamEvent::Usage(u) = &event {
                    self.usage = *u;
                }
                if let StreamEvent::Done = &event {
                    self.done = true;
                }
                if let Some(frame) = render_target_event(self.to, &event, &self.client_model, &self.response_id) {
                    out.push_str(&frame);
                }
            }
        }
        out.into_bytes()
    }

    /// Rebuilds a passthrough frame byte-for-byte except for a targeted
    /// `model` substring swap, so frames carrying no model field (the vast
    /// majority of a stream) round-trip completely untouched.
    fn render_passthrough_frame(&self, event_name: Option<&str>, data: &str) -> String {
        let patched = match self.to {
            ServiceType::MessagesStyle if event_name == Some("message_start") => {
                self.patch_nested_model(data, "message")
            }
            ServiceType::OpenaiStyle => self.patch_top_level_model(data),
            _ => data.to_string(),
        };
        let mut out = String::new();
        if let Some(name) = event_name {
            out.push_str("event: ");
            out.push_str(name);
            out.push('\n');
        }
        out.push_str("data: ");
        out.push_str(&patched);
        out.push_str("\n\n");
        out
    }

    fn patch_top_level_model(&self, data: &str) -> String {
        if data == "[DONE]" {
            return data.to_string();
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return data.to_string();
        };
        match value.get("model").and_then(Value::as_str) {
            Some(old) if old != self.client_model => {
                data.replacen(&format!("\"model\":\"{old}\""), &format!("\"model\":\"{}\"", self.client_model), 1)
            }
            _ => data.to_string(),
        }
    }

    fn patch_nested_model(&self, data: &str, container: &str) -> String {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return data.to_string();
        };
        match value.get(container).and_then(|c| c.get("model")).and_then(Value::as_str) {
            Some(old) if old != self.client_model => {
                data.replacen(&format!("\"model\":\"{old}\""), &format!("\"model\":\"{}\"", self.client_model), 1)
            }
            _ => data.to_string(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn usage(&self) -> RawUsage {
        self.usage
    }

    pub fn canonical_usage(&self) -> Usage {
        Usage {
            input_tokens: self.usage.input_tokens.max(0) as u32,
            output_tokens: self.usage.output_tokens.max(0) as u32,
            cache_creation_input_tokens: self.usage.cache_creation_input_tokens.max(0) as u32,
            cache_read_input_tokens: self.usage.cache_read_input_tokens.max(0) as u32,
        }
    }
}

use serde_json::{json, Value};

use crate::errors::TranslatorError;
use crate::models::channel::ServiceType;

use super::canonical::{CanonicalMessage, CanonicalRequest, CanonicalResponse, FinishReason};
use super::usage_extract::{extract_gemini_style_usage, extract_messages_style_usage, extract_openai_style_usage};

/// Parses a client/upstream request body of the given dialect into the
/// canonical intermediate representation.
pub fn parse_request(dialect: ServiceType, body: &Value) -> Result<CanonicalRequest, TranslatorError> {
    match dialect {
        ServiceType::MessagesStyle => parse_messages_request(body),
        ServiceType::OpenaiStyle => parse_openai_request(body),
        ServiceType::GeminiStyle => parse_gemini_request(body),
    }
}

/// Renders the canonical representation back out into the given dialect's
/// request shape, with the upstream-mapped model name already substituted.
pub fn render_request(dialect: ServiceType, req: &CanonicalRequest) -> Value {
    match dialect {
        ServiceType::MessagesStyle => render_messages_request(req),
        ServiceType::OpenaiStyle => render_openai_request(req),
        ServiceType::GeminiStyle => render_gemini_request(req),
    }
}

pub fn parse_response(dialect: ServiceType, body: &Value) -> Result<CanonicalResponse, TranslatorError> {
    match dialect {
        ServiceType::MessagesStyle => parse_messages_response(body),
        ServiceType::OpenaiStyle => parse_openai_response(body),
        ServiceType::GeminiStyle => parse_gemini_response(body),
    }
}

pub fn render_response(dialect: ServiceType, resp: &CanonicalResponse) -> Value {
    match dialect {
        ServiceType::MessagesStyle => render_messages_response(resp),
        ServiceType::OpenaiStyle => render_openai_response(resp),
        ServiceType::GeminiStyle => render_gemini_response(resp),
    }
}

fn text_of(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn parse_messages_request(body: &Value) -> Result<CanonicalRequest, TranslatorError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| TranslatorError::missing_field("model"))?
        .to_string();
    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|m| CanonicalMessage {
                    role: m.get("role").and_then(Value::as_str).unwrap_or("user").to_string(),
                    content: text_of(m.get("content").unwrap_or(&Value::Null)),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CanonicalRequest {
        model,
        system: body.get("system").map(text_of),
        messages,
        tools: body.get("tools").and_then(Value::as_array).cloned().unwrap_or_default(),
        stream: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
        max_tokens: body.get("max_tokens").and_then(Value::as_u64).map(|n| n as u32),
        extra: body.clone(),
    })
}

fn render_messages_request(req: &CanonicalRequest) -> Value {
    let mut messages: Vec<Value> = req
        .messages
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect();
    if messages.is_empty() {
        messages.push(json!({"role": "user", "content": ""}));
    }
    json!({
        "model": req.model,
        "system": req.system,
        "messages": messages,
        "tools": req.tools,
        "stream": req.stream,
        "max_tokens": req.max_tokens.unwrap_or(4096),
    })
}

fn parse_openai_request(body: &Value) -> Result<CanonicalRequest, TranslatorError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| TranslatorError::missing_field("model"))?
        .to_string();
    let raw_messages = body.get("messages").and_then(Value::as_array).cloned().unwrap_or_default();
    let mut system = None;
    let mut messages = Vec::new();
    for m in &raw_messages {
        let role = m.get("role").and_then(Value::as_str).unwrap_or("user").to_string();
        let content = text_of(m.get("content").unwrap_or(&Value::Null));
        if role == "system" {
            system = Some(content);
        } else {
            messages.push(CanonicalMessage { role, content });
        }
    }
    let tools = body
        .get("tools")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|t| t.get("function").cloned()).collect())
        .unwrap_or_default();

    Ok(CanonicalRequest {
        model,
        system,
        messages,
        tools,
        stream: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
        max_tokens: body.get("max_tokens").and_then(Value::as_u64).map(|n| n as u32),
        extra: body.clone(),
    })
}

fn render_openai_request(req: &CanonicalRequest) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    for m in &req.messages {
        messages.push(json!({"role": m.role, "content": m.content}));
    }
    json!({
        "model": req.model,
        "messages": messages,
        "tools": req.tools.iter().map(|f| json!({"type": "function", "function": f})).collect::<Vec<_>>(),
        "stream": req.stream,
        "max_tokens": req.max_tokens,
    })
}

fn parse_gemini_request(body: &Value) -> Result<CanonicalRequest, TranslatorError> {
    let messages = body
        .get("contents")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|c| {
                    let role = c.get("role").and_then(Value::as_str).unwrap_or("user");
                    let role = if role == "model" { "assistant" } else { role };
                    let text = c
                        .get("parts")
                        .and_then(Value::as_array)
                        .map(|parts| {
                            parts
                                .iter()
                                .filter_map(|p| p.get("text").and_then(Value::as_str))
                                .collect::<Vec<_>>()
                                .join("")
                        })
                        .unwrap_or_default();
                    CanonicalMessage {
                        role: role.to_string(),
                        content: text,
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let system = body
        .get("systemInstruction")
        .and_then(|s| s.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        });

    let tools = body
        .get("tools")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|t| t.get("functionDeclarations"))
                .filter_map(Value::as_array)
                .flatten()
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    Ok(CanonicalRequest {
        model: body.get("model").and_then(Value::as_str).unwrap_or_default().to_string(),
        system,
        messages,
        tools,
        stream: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
        max_tokens: body
            .get("generationConfig")
            .and_then(|g| g.get("maxOutputTokens"))
            .and_then(Value::as_u64)
            .map(|n| n as u32),
        extra: body.clone(),
    })
}

fn render_gemini_request(req: &CanonicalRequest) -> Value {
    let contents: Vec<Value> = req
        .messages
        .iter()
        .map(|m| {
            let role = if m.role == "assistant" { "model" } else { "user" };
            json!({"role": role, "parts": [{"text": m.content}]})
        })
        .collect();
    let mut out = json!({
        "contents": contents,
        "tools": [{"functionDeclarations": req.tools}],
    });
    if let Some(system) = &req.system {
        out["systemInstruction"] = json!({"parts": [{"text": system}]});
    }
    if let Some(max_tokens) = req.max_tokens {
        out["generationConfig"] = json!({"maxOutputTokens": max_tokens});
    }
    out
}

fn parse_messages_response(body: &Value) -> Result<CanonicalResponse, TranslatorError> {
    let content = body.get("content").and_then(Value::as_array);
    let text = content
        .map(|arr| {
            arr.iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    let tool_calls = content
        .map(|arr| {
            arr.iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
                .map(|b| {
                    json!({
                        "id": b.get("id").cloned().unwrap_or(Value::Null),
                        "name": b.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": b.get("input").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(CanonicalResponse {
        id: body.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
        model: body.get("model").and_then(Value::as_str).unwrap_or_default().to_string(),
        text,
        finish_reason: body
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(FinishReason::from_messages_style)
            .unwrap_or_default(),
        usage: body
            .get("usage")
            .map(extract_messages_style_usage)
            .unwrap_or_default(),
        tool_calls,
        extra: body.clone(),
    })
}

fn render_messages_response(resp: &CanonicalResponse) -> Value {
    let mut content: Vec<Value> = Vec::new();
    if !resp.text.is_empty() {
        content.push(json!({"type": "text", "text": resp.text}));
    }
    for call in &resp.tool_calls {
        content.push(json!({
            "type": "tool_use",
            "id": call.get("id").cloned().unwrap_or(Value::Null),
            "name": call.get("name").cloned().unwrap_or(Value::Null),
            "input": call.get("arguments").cloned().unwrap_or_else(|| json!({})),
        }));
    }
    if content.is_empty() {
        content.push(json!({"type": "text", "text": ""}));
    }
    json!({
        "id": resp.id,
        "type": "message",
        "role": "assistant",
        "model": resp.model,
        "content": content,
        "stop_reason": resp.finish_reason.to_messages_style(),
        "usage": {
            "input_tokens": resp.usage.input_tokens,
            "output_tokens": resp.usage.output_tokens,
            "cache_creation_input_tokens": resp.usage.cache_creation_input_tokens,
            "cache_read_input_tokens": resp.usage.cache_read_input_tokens,
        },
    })
}

fn parse_openai_response(body: &Value) -> Result<CanonicalResponse, TranslatorError> {
    let choice = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .ok_or_else(|| TranslatorError::malformed_body("missing choices[0]"))?;
    let message = choice.get("message");
    let text = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|tc| {
                    let function = tc.get("function");
                    let arguments = function
                        .and_then(|f| f.get("arguments"))
                        .and_then(Value::as_str)
                        .and_then(|s| serde_json::from_str::<Value>(s).ok())
                        .unwrap_or(Value::Null);
                    json!({
                        "id": tc.get("id").cloned().unwrap_or(Value::Null),
                        "name": function.and_then(|f| f.get("name")).cloned().unwrap_or(Value::Null),
                        "arguments": arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(CanonicalResponse {
        id: body.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
        model: body.get("model").and_then(Value::as_str).unwrap_or_default().to_string(),
        text,
        finish_reason: choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(FinishReason::from_openai_style)
            .unwrap_or_default(),
        usage: body
            .get("usage")
            .map(extract_openai_style_usage)
            .unwrap_or_default(),
        tool_calls,
        extra: body.clone(),
    })
}

fn render_openai_response(resp: &CanonicalResponse) -> Value {
    let mut message = json!({"role": "assistant", "content": resp.text});
    if !resp.tool_calls.is_empty() {
        message["content"] = Value::Null;
        message["tool_calls"] = Value::Array(
            resp.tool_calls
                .iter()
                .enumerate()
                .map(|(i, call)| {
                    let id = call
                        .get("id")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{i}"));
                    json!({
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": call.get("name").cloned().unwrap_or(Value::Null),
                            "arguments": serde_json::to_string(call.get("arguments").unwrap_or(&Value::Null)).unwrap_or_default(),
                        },
                    })
                })
                .collect(),
        );
    }
    json!({
        "id": resp.id,
        "object": "chat.completion",
        "model": resp.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": resp.finish_reason.to_openai_style(),
        }],
        "usage": {
            "prompt_tokens": resp.usage.input_tokens,
            "completion_tokens": resp.usage.output_tokens,
            "total_tokens": resp.usage.input_tokens + resp.usage.output_tokens,
        },
    })
}

fn parse_gemini_response(body: &Value) -> Result<CanonicalResponse, TranslatorError> {
    let candidate = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .ok_or_else(|| TranslatorError::malformed_body("missing candidates[0]"))?;
    let parts = candidate.get("content").and_then(|c| c.get("parts")).and_then(Value::as_array);
    let text = parts
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    let tool_calls = parts
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("functionCall"))
                .map(|fc| {
                    json!({
                        "id": Value::Null,
                        "name": fc.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": fc.get("args").cloned().unwrap_or_else(|| json!({})),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(CanonicalResponse {
        id: String::new(),
        model: body.get("modelVersion").and_then(Value::as_str).unwrap_or_default().to_string(),
        text,
        finish_reason: candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .map(FinishReason::from_gemini_style)
            .unwrap_or_default(),
        usage: body
            .get("usageMetadata")
            .map(extract_gemini_style_usage)
            .unwrap_or_default(),
        tool_calls,
        extra: body.clone(),
    })
}

fn render_gemini_response(resp: &CanonicalResponse) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    if !resp.text.is_empty() {
        parts.push(json!({"text": resp.text}));
    }
    for call in &resp.tool_calls {
        parts.push(json!({
            "functionCall": {
                "name": call.get("name").cloned().unwrap_or(Value::Null),
                "args": call.get("arguments").cloned().unwrap_or_else(|| json!({})),
            },
        }));
    }
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": parts},
            "finishReason": resp.finish_reason.to_gemini_style(),
        }],
        "usageMetadata": {
            "promptTokenCount": resp.usage.input_tokens,
            "candidatesTokenCount": resp.usage.output_tokens,
            "cachedContentTokenCount": resp.usage.cache_read_input_tokens,
        },
    })
}

/// URL layout per spec §4.6.
pub fn provider_url(base: &str, dialect: ServiceType, model: &str, is_stream: bool) -> String {
    let base = base.trim_end_matches('/');
    match dialect {
        ServiceType::MessagesStyle => format!("{base}/v1/messages"),
        ServiceType::OpenaiStyle => format!("{base}/v1/chat/completions"),
        ServiceType::GeminiStyle => {
            let action = if is_stream { "streamGenerateContent" } else { "generateContent" };
            let suffix = if is_stream { "?alt=sse" } else { "" };
            format!("{base}/v1beta/models/{model}:{action}{suffix}")
        }
    }
}

/// Auth header(s) for the given upstream dialect.
pub fn auth_headers(dialect: ServiceType, api_key: &str) -> Vec<(String, String)> {
    match dialect {
        ServiceType::MessagesStyle => vec![
            ("x-api-key".to_string(), api_key.to_string()),
            ("anthropic-version".to_string(), "2023-06-01".to_string()),
        ],
        ServiceType::OpenaiStyle => vec![("Authorization".to_string(), format!("Bearer {api_key}"))],
        ServiceType::GeminiStyle => vec![("x-goog-api-key".to_string(), api_key.to_string())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_url_includes_sse_flag_when_streaming() {
        let url = provider_url("https://x.example", ServiceType::GeminiStyle, "gemini-pro", true);
        assert_eq!(url, "https://x.example/v1beta/models/gemini-pro:streamGenerateContent?alt=sse");
    }

    #[test]
    fn messages_roundtrip_preserves_text() {
        let body = json!({"model": "claude-3", "system": "be nice", "messages": [{"role": "user", "content": "hi"}]});
        let canonical = parse_messages_request(&body).unwrap();
        assert_eq!(canonical.messages[0].content, "hi");
        assert_eq!(canonical.system.as_deref(), Some("be nice"));
    }

    #[test]
    fn openai_system_message_becomes_canonical_system_field() {
        let body = json!({"model": "gpt-4", "messages": [{"role": "system", "content": "sys"}, {"role": "user", "content": "hi"}]});
        let canonical = parse_openai_request(&body).unwrap();
        assert_eq!(canonical.system.as_deref(), Some("sys"));
        assert_eq!(canonical.messages.len(), 1);
    }

    #[test]
    fn gemini_model_role_maps_to_assistant() {
        let body = json!({"contents": [{"role": "model", "parts": [{"text": "hi"}]}]});
        let canonical = parse_gemini_request(&body).unwrap();
        assert_eq!(canonical.messages[0].role, "assistant");
    }

    #[test]
    fn messages_tool_use_survives_round_trip_to_openai() {
        let body = json!({
            "id": "msg_1",
            "model": "claude-3",
            "content": [{"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "nyc"}}],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 1, "output_tokens": 1},
        });
        let canonical = parse_messages_response(&body).unwrap();
        assert_eq!(canonical.tool_calls.len(), 1);
        let rendered = render_openai_response(&canonical);
        let call = &rendered["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(call["function"]["name"], "get_weather");
        assert_eq!(call["function"]["arguments"], "{\"city\":\"nyc\"}");
    }

    #[test]
    fn openai_tool_calls_survive_round_trip_to_messages() {
        let body = json!({
            "id": "chatcmpl_1",
            "model": "gpt-4",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "tool_calls": [{"id": "call_1", "function": {"name": "lookup", "arguments": "{\"q\":\"x\"}"}}],
                },
                "finish_reason": "tool_calls",
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
        });
        let canonical = parse_openai_response(&body).unwrap();
        assert_eq!(canonical.tool_calls.len(), 1);
        let rendered = render_messages_response(&canonical);
        let block = &rendered["content"][0];
        assert_eq!(block["type"], "tool_use");
        assert_eq!(block["name"], "lookup");
        assert_eq!(block["input"]["q"], "x");
    }

    #[test]
    fn gemini_function_call_survives_round_trip() {
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"functionCall": {"name": "search", "args": {"q": "rust"}}}]},
                "finishReason": "STOP",
            }],
            "usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 1},
        });
        let canonical = parse_gemini_response(&body).unwrap();
        assert_eq!(canonical.tool_calls.len(), 1);
        let rendered = render_gemini_response(&canonical);
        let part = &rendered["candidates"][0]["content"]["parts"][0];
        assert_eq!(part["functionCall"]["name"], "search");
    }
}

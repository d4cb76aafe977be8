//! Thin dialect endpoints (spec.md §6): each handler parses just enough of
//! the request to build a [`RequestFingerprint`], calls the dispatcher, and
//! converts its outcome into an HTTP response. No business logic lives here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::dispatcher::{DispatchBody, DispatcherConfig};
use crate::errors::DispatchError;
use crate::metrics::UsageEstimator;
use crate::models::channel::ServiceType;
use crate::models::RequestFingerprint;

use super::{AppState, CachedModelList};

fn extract_user_id(headers: &HeaderMap, body: &Value) -> String {
    if let Some(v) = headers.get("x-user-id").and_then(|v| v.to_str().ok()) {
        return v.to_string();
    }
    body.get("user")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn dispatcher_config(state: &AppState, api_type: &str) -> DispatcherConfig {
    DispatcherConfig {
        api_type: api_type.to_string(),
        fuzzy_mode: state.config.dispatcher.fuzzy_mode,
        estimate_low_usage: state.config.metrics.estimate_low_usage,
    }
}

fn dialect_error_body(dialect: ServiceType, status: u16, code: &str, message: &str) -> Value {
    match dialect {
        ServiceType::MessagesStyle => json!({"type": "error", "error": {"type": "api_error", "code": code, "message": message}}),
        ServiceType::OpenaiStyle => json!({"error": {"message": message, "type": "api_error", "code": code}}),
        ServiceType::GeminiStyle => json!({"error": {"code": status, "message": message, "status": code}}),
    }
}

fn dispatch_error_response(dialect: ServiceType, err: DispatchError) -> Response {
    let code = err.code();
    let (status, message) = match &err {
        DispatchError::NoChannelsAvailable { api_type } => {
            (StatusCode::SERVICE_UNAVAILABLE, format!("no channels configured for {api_type}"))
        }
        DispatchError::NoApiKeys { channel } => {
            (StatusCode::SERVICE_UNAVAILABLE, format!("no api keys configured for channel {channel}"))
        }
        DispatchError::AllExhausted { had_retryable_failure: true, status, body } => {
            return (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE),
                Json(serde_json::from_str::<Value>(body).unwrap_or_else(|_| json!({"raw": body}))),
            )
                .into_response();
        }
        DispatchError::AllExhausted { status, .. } => {
            (StatusCode::from_u16(*status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE), "no upstream available for this request".to_string())
        }
        DispatchError::TerminalUpstream { status, body } => {
            return (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST),
                Json(serde_json::from_str::<Value>(body).unwrap_or_else(|_| json!({"raw": body}))),
            )
                .into_response();
        }
    };
    (status, Json(dialect_error_body(dialect, status.as_u16(), code, &message))).into_response()
}

async fn dispatch_and_respond(
    state: &AppState,
    fingerprint: RequestFingerprint,
    api_type: &str,
) -> Response {
    let Some(channels) = state.config.channels.for_api_type(api_type) else {
        return dispatch_error_response(
            fingerprint.client_dialect,
            DispatchError::no_channels(api_type),
        );
    };

    match state
        .dispatcher
        .dispatch(&fingerprint, channels, &dispatcher_config(state, api_type))
        .await
    {
        Ok(outcome) => match outcome.body {
            DispatchBody::Json(value) => {
                (StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::OK), Json(value)).into_response()
            }
            DispatchBody::Stream(stream) => {
                let body = Body::from_stream(stream);
                Response::builder()
                    .status(StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::OK))
                    .header("content-type", "text/event-stream")
                    .header("cache-control", "no-cache")
                    .header("connection", "keep-alive")
                    .header("x-accel-buffering", "no")
                    .body(body)
                    .expect("well-formed streaming response")
            }
        },
        Err(err) => dispatch_error_response(fingerprint.client_dialect, err),
    }
}

pub async fn messages(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let is_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let model = body.get("model").and_then(Value::as_str).unwrap_or_default().to_string();
    let user_id = extract_user_id(&headers, &body);
    let fingerprint = RequestFingerprint {
        client_dialect: ServiceType::MessagesStyle,
        model_name: model,
        user_id,
        is_stream,
        raw_body: body,
    };
    dispatch_and_respond(&state, fingerprint, "messages").await
}

pub async fn count_tokens(Json(body): Json<Value>) -> Response {
    let canonical = match crate::translator::dialect::parse_request(ServiceType::MessagesStyle, &body) {
        Ok(c) => c,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(dialect_error_body(ServiceType::MessagesStyle, 400, "INVALID_REQUEST", &e.to_string())),
            )
                .into_response()
        }
    };
    let estimator = crate::metrics::HeuristicEstimator;
    let mut text = canonical.system.clone().unwrap_or_default();
    for message in &canonical.messages {
        text.push_str(&message.content);
    }
    let input_tokens = estimator.estimate(&canonical.model, &text);
    (StatusCode::OK, Json(json!({"input_tokens": input_tokens}))).into_response()
}

pub async fn chat_completions(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let is_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let model = body.get("model").and_then(Value::as_str).unwrap_or_default().to_string();
    let user_id = extract_user_id(&headers, &body);
    let fingerprint = RequestFingerprint {
        client_dialect: ServiceType::OpenaiStyle,
        model_name: model,
        user_id,
        is_stream,
        raw_body: body,
    };
    dispatch_and_respond(&state, fingerprint, "responses").await
}

/// Axum path params split on `:` at route level, not within a segment, so
/// `{model}:{generateContent|streamGenerateContent}` is captured as one
/// `model_action` segment and split here.
pub async fn gemini_generate_compat(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let (model, action) = match model_action.split_once(':') {
        Some((m, a)) => (m.to_string(), a.to_string()),
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(dialect_error_body(ServiceType::GeminiStyle, 400, "INVALID_REQUEST", "missing :action suffix")),
            )
                .into_response()
        }
    };
    let is_stream = action == "streamGenerateContent";
    let user_id = extract_user_id(&headers, &body);
    let mut body = body;
    if let Value::Object(ref mut map) = body {
        map.entry("model").or_insert_with(|| Value::String(model.clone()));
    }
    let fingerprint = RequestFingerprint {
        client_dialect: ServiceType::GeminiStyle,
        model_name: model,
        user_id,
        is_stream,
        raw_body: body,
    };
    dispatch_and_respond(&state, fingerprint, "gemini").await
}

fn normalize_query(params: &HashMap<String, String>) -> String {
    let mut pairs: Vec<(&String, &String)> = params.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn model_entry(id: &str) -> Value {
    json!({"id": id, "object": "model", "created": 0, "owned_by": "gateway"})
}

fn collect_model_ids(channels: &crate::models::channel::ChannelSet) -> Vec<String> {
    let mut ids = Vec::new();
    for channel in &channels.channels {
        for client_model in channel.model_mapping.keys() {
            if !ids.contains(client_model) {
                ids.push(client_model.clone());
            }
        }
    }
    ids
}

const MODEL_CACHE_TTL: Duration = Duration::from_secs(60);

pub async fn list_models(State(state): State<Arc<AppState>>, Query(params): Query<HashMap<String, String>>) -> Response {
    let cache_key = normalize_query(&params);
    {
        let cache = state.model_cache.read().await;
        if let Some(entry) = cache.get(&cache_key) {
            if entry.fetched_at.elapsed() < MODEL_CACHE_TTL {
                return (StatusCode::OK, Json(entry.data.clone())).into_response();
            }
        }
    }

    let mut ids = collect_model_ids(&state.config.channels.messages);
    for id in collect_model_ids(&state.config.channels.responses) {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    let data = json!({
        "object": "list",
        "data": ids.iter().map(|id| model_entry(id)).collect::<Vec<_>>(),
    });

    state.model_cache.write().await.insert(
        cache_key,
        CachedModelList {
            data: data.clone(),
            fetched_at: tokio::time::Instant::now(),
        },
    );

    (StatusCode::OK, Json(data)).into_response()
}

pub async fn get_model(State(state): State<Arc<AppState>>, Path(model): Path<String>) -> Response {
    let found = collect_model_ids(&state.config.channels.messages).contains(&model)
        || collect_model_ids(&state.config.channels.responses).contains(&model);
    if found {
        (StatusCode::OK, Json(model_entry(&model))).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"message": format!("model {model} not found"), "type": "invalid_request_error", "code": 404}})),
        )
            .into_response()
    }
}

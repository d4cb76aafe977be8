//! Format Translator (C6): request & response conversion between the three
//! wire dialects, including SSE streaming conversion.

pub mod canonical;
pub mod dialect;
pub mod sse;
pub mod usage_extract;

use serde_json::Value;

use crate::errors::TranslatorError;
use crate::models::channel::ServiceType;
use crate::models::Usage;

pub use sse::SseTranslator;
pub use usage_extract::RawUsage;

/// One fully-formed upstream request: method is always POST for this
/// surface, so only URL/headers/body are modeled.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// Converts a client request body into the shape the selected upstream
/// expects, applying `modelMapping` before URL construction.
pub fn to_provider(
    client_dialect: ServiceType,
    upstream_dialect: ServiceType,
    client_body: &Value,
    upstream_model: &str,
    api_key: &str,
    base_url: &str,
    is_stream: bool,
) -> Result<ProviderRequest, TranslatorError> {
    let mut canonical = dialect::parse_request(client_dialect, client_body)?;
    canonical.model = upstream_model.to_string();
    canonical.stream = is_stream;

    let body = dialect::render_request(upstream_dialect, &canonical);
    let url = dialect::provider_url(base_url, upstream_dialect, upstream_model, is_stream);
    let headers = dialect::auth_headers(upstream_dialect, api_key);

    Ok(ProviderRequest { url, headers, body })
}

/// Converts a unary upstream response back into the client's dialect,
/// returning the body to forward plus canonical usage for the metrics
/// engine.
pub fn from_provider_unary(
    upstream_dialect: ServiceType,
    client_dialect: ServiceType,
    upstream_body: &Value,
    client_model: &str,
    estimate_low_usage: bool,
    estimator: &dyn crate::metrics::UsageEstimator,
) -> Result<(Value, Usage), TranslatorError> {
    let canonical = dialect::parse_response(upstream_dialect, upstream_body)?;
    let usage = usage_extract::reconcile_usage(
        canonical.usage,
        estimate_low_usage,
        estimator,
        client_model,
        "",
        &canonical.text,
    );

    if upstream_dialect == client_dialect {
        let mut body = upstream_body.clone();
        patch_model_field(client_dialect, &mut body, client_model);
        return Ok((body, usage));
    }

    let mut canonical = canonical;
    canonical.model = client_model.to_string();
    let body = dialect::render_response(client_dialect, &canonical);
    Ok((body, usage))
}


/// Rewrites the upstream-echoed model name to the client-requested one on
/// the same-dialect passthrough path, mirroring `sse.rs`'s `message_start`
/// patch for the unary case.
fn patch_model_field(dialect: ServiceType, body: &mut Value, client_model: &str) {
    let Value::Object(map) = body else { return };
    let key = match dialect {
        ServiceType::MessagesStyle | ServiceType::OpenaiStyle => "model",
        ServiceType::GeminiStyle => "modelVersion",
    };
    if map.contains_key(key) {
        map.insert(key.to_string(), Value::String(client_model.to_string()));
    }
}

use serde::{Deserialize, Serialize};

use super::channel::ServiceType;

/// Everything the dispatcher needs to know about one inbound request,
/// derived once at the edge of the web layer.
///
/// `user_id` is the trace-affinity key; extracting it from the raw body,
/// a header, or falling back to empty is the web layer's job, not this
/// struct's — by the time a `RequestFingerprint` exists the extraction has
/// already happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFingerprint {
    pub client_dialect: ServiceType,
    pub model_name: String,
    pub user_id: String,
    pub is_stream: bool,
    pub raw_body: serde_json::Value,
}

impl RequestFingerprint {
    pub fn has_trace_affinity_key(&self) -> bool {
        !self.user_id.is_empty()
    }
}

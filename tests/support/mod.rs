//! Shared test doubles for the end-to-end scenario tests: a scripted
//! [`FakeTransport`] standing in for live upstream HTTP, and helpers for
//! building channels/fingerprints without repeating the full struct
//! literals in every scenario.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use llm_gateway::circuit::clock::ManualClock;
use llm_gateway::circuit::CircuitBreakerConfig;
use llm_gateway::dispatcher::transport::{TransportBody, TransportError, TransportResponse, UpstreamTransport};
use llm_gateway::dispatcher::{Dispatcher, DispatcherConfig};
use llm_gateway::metrics::{HeuristicEstimator, MetricsConfig, MetricsEngine};
use llm_gateway::models::channel::{Channel, ChannelSet, ChannelStatus, ServiceType};
use llm_gateway::models::RequestFingerprint;
use llm_gateway::scheduler::{Scheduler, SchedulingStrategy};
use llm_gateway::translator::ProviderRequest;
use llm_gateway::url_manager::{UrlManager, UrlManagerConfig};
use tokio::sync::Mutex as TokioMutex;

/// One scripted upstream response, consumed in order per `.send()` call
/// regardless of which (channel, url, key) triple it was addressed to —
/// scenarios script a per-call sequence, not a per-endpoint routing table.
pub enum Scripted {
    Unary(u16, &'static str),
    Stream(u16, Vec<&'static str>),
    Transport(TransportError),
}

pub struct FakeTransport {
    script: TokioMutex<VecDeque<Scripted>>,
    pub calls: TokioMutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: TokioMutex::new(script.into_iter().collect()),
            calls: TokioMutex::new(Vec::new()),
        }
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl UpstreamTransport for FakeTransport {
    async fn send(
        &self,
        req: ProviderRequest,
        _is_stream: bool,
        _insecure: bool,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.lock().await.push(req.url.clone());
        let mut guard = self.script.lock().await;
        match guard.pop_front().expect("script exhausted") {
            Scripted::Unary(status, body) => Ok(TransportResponse {
                status,
                body: TransportBody::Unary(Bytes::from(body)),
            }),
            Scripted::Stream(status, frames) => {
                let chunks: Vec<Result<Bytes, TransportError>> =
                    frames.into_iter().map(|f| Ok(Bytes::from(f))).collect();
                let stream = futures::stream::iter(chunks);
                Ok(TransportResponse {
                    status,
                    body: TransportBody::Streaming(Box::pin(stream)),
                })
            }
            Scripted::Transport(e) => Err(e),
        }
    }
}

pub fn channel(
    name: &str,
    priority: i64,
    service_type: ServiceType,
    urls: &[&str],
    keys: &[&str],
) -> Channel {
    Channel {
        name: name.to_string(),
        service_type,
        base_urls: urls.iter().map(|s| s.to_string()).collect(),
        api_keys: keys.iter().map(|s| s.to_string()).collect(),
        priority,
        status: ChannelStatus::Active,
        model_mapping: Default::default(),
        promotion_until: None,
        low_quality: false,
        insecure_skip_verify: false,
    }
}

pub fn messages_fingerprint(model: &str, is_stream: bool) -> RequestFingerprint {
    RequestFingerprint {
        client_dialect: ServiceType::MessagesStyle,
        model_name: model.to_string(),
        user_id: String::new(),
        is_stream,
        raw_body: serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 64,
        }),
    }
}

pub fn dispatcher_config(api_type: &str) -> DispatcherConfig {
    DispatcherConfig {
        api_type: api_type.to_string(),
        fuzzy_mode: false,
        estimate_low_usage: true,
    }
}

pub fn test_dispatcher(transport: FakeTransport, clock: Arc<ManualClock>) -> Dispatcher {
    let clock: Arc<dyn llm_gateway::circuit::clock::Clock> = clock;
    let scheduler = Arc::new(Scheduler::new(
        SchedulingStrategy::Failover,
        chrono::Duration::minutes(10),
        Arc::clone(&clock),
    ));
    let url_manager = Arc::new(UrlManager::new(UrlManagerConfig::default(), Arc::clone(&clock)));
    let metrics = Arc::new(MetricsEngine::new(
        MetricsConfig {
            breaker: CircuitBreakerConfig::from_window(20),
            ..MetricsConfig::default()
        },
        Arc::clone(&clock),
    ));
    Dispatcher::new(scheduler, url_manager, metrics, Arc::new(transport), Arc::new(HeuristicEstimator))
}

pub fn single_channel_set(ch: Channel) -> ChannelSet {
    ChannelSet { channels: vec![ch] }
}

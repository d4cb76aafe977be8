//! Failover Dispatcher (C5): the per-request state machine that walks
//! channels -> baseURLs -> keys, classifies upstream errors, drives
//! dialect conversion, and hands streaming responses back to the caller.

pub mod classify;
pub mod transport;

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::{DispatchError, DispatchResult};
use crate::metrics::{MetricsEngine, UsageEstimator};
use crate::models::channel::{Channel, ChannelSet};
use crate::models::RequestFingerprint;
use crate::scheduler::Scheduler;
use crate::translator::{self, SseTranslator};
use crate::url_manager::UrlManager;

use classify::classify_error;
use transport::{TransportBody, TransportError, UpstreamTransport};

pub enum DispatchBody {
    Json(Value),
    Stream(Pin<Box<dyn Stream<Item = Result<Bytes, DispatchError>> + Send>>),
}

pub struct DispatchOutcome {
    pub status: u16,
    pub body: DispatchBody,
}

pub struct DispatcherConfig {
    pub api_type: String,
    pub fuzzy_mode: bool,
    pub estimate_low_usage: bool,
}

pub struct Dispatcher {
    scheduler: Arc<Scheduler>,
    url_manager: Arc<UrlManager>,
    metrics: Arc<MetricsEngine>,
    transport: Arc<dyn UpstreamTransport>,
    estimator: Arc<dyn UsageEstimator>,
    deprioritized: RwLock<HashSet<String>>,
}

impl Dispatcher {
    pub fn new(
        scheduler: Arc<Scheduler>,
        url_manager: Arc<UrlManager>,
        metrics: Arc<MetricsEngine>,
        transport: Arc<dyn UpstreamTransport>,
        estimator: Arc<dyn UsageEstimator>,
    ) -> Self {
        Self {
            scheduler,
            url_manager,
            metrics,
            transport,
            estimator,
            deprioritized: RwLock::new(HashSet::new()),
        }
    }

    pub async fn dispatch(
        &self,
        fingerprint: &RequestFingerprint,
        channels: &ChannelSet,
        config: &DispatcherConfig,
    ) -> DispatchResult<DispatchOutcome> {
        let mut failed_channels: Vec<usize> = Vec::new();
        let mut last_failover_err: Option<(u16, String)> = None;
        let max_attempts = channels.active_candidates(&[]).len();
        if max_attempts == 0 {
            return Err(DispatchError::no_channels(&config.api_type));
        }

        for _ in 0..max_attempts {
            let selection = match self
                .scheduler
                .select_channel(channels, &fingerprint.user_id, &failed_channels, &config.api_type)
                .await
            {
                Ok(s) => s,
                Err(_) => break,
            };
            let channel_index = selection.channel_index;
            let Some(channel) = channels.get(channel_index) else {
                failed_channels.push(channel_index);
                continue;
            };
            if channel.api_keys.is_empty() {
                return Err(DispatchError::no_api_keys(&channel.name));
            }

            let sorted_urls = self.url_manager.get_sorted_urls(channel_index, &channel.base_urls).await;
            let first_url = sorted_urls.first().map(|u| u.url.clone()).unwrap_or_default();
            let force_probe = self
                .metrics
                .are_all_keys_suspended(&first_url, &channel.api_keys)
                .await;

            let mut deprioritize_candidates: Vec<String> = Vec::new();

            for sorted_url in &sorted_urls {
                let url = &sorted_url.url;
                let mut failed_keys: Vec<String> = Vec::new();

                for _attempt in 0..channel.api_keys.len() {
                    let Some(api_key) = self.next_key(channel, &failed_keys).await else {
                        break;
                    };
                    let api_key = api_key.to_string();

                    if !force_probe && self.metrics.should_suspend_key(url, &api_key).await {
                        failed_keys.push(api_key);
                        continue;
                    }

                    let outcome = self
                        .attempt(fingerprint, channel, url, &api_key, config)
                        .await;

                    match outcome {
                        AttemptOutcome::Transport(_) => {
                            failed_keys.push(api_key.clone());
                            self.metrics
                                .record_failure(url, &api_key, &fingerprint.model_name, &config.api_type)
                                .await;
                            self.url_manager.mark_failure(channel_index, url).await;
                        }
                        AttemptOutcome::Success(outcome) => {
                            self.url_manager.mark_success(channel_index, url).await;
                            for key in deprioritize_candidates.drain(..) {
                                self.deprioritized.write().await.insert(key);
                            }
                            self.scheduler.set_trace_affinity(&fingerprint.user_id, channel_index).await;
                            return Ok(outcome);
                        }
                        AttemptOutcome::Retryable { status, body, quota_like } => {
                            failed_keys.push(api_key.clone());
                            self.metrics
                                .record_failure(url, &api_key, &fingerprint.model_name, &config.api_type)
                                .await;
                            self.url_manager.mark_failure(channel_index, url).await;
                            last_failover_err = Some((status, body));
                            if quota_like {
                                deprioritize_candidates.push(api_key);
                            }
                        }
                        AttemptOutcome::Terminal { status, body } => {
                            self.metrics
                                .record_failure(url, &api_key, &fingerprint.model_name, &config.api_type)
                                .await;
                            return Ok(DispatchOutcome {
                                status,
                                body: DispatchBody::Json(
                                    serde_json::from_str(&body).unwrap_or_else(|_| serde_json::json!({"raw": body})),
                                ),
                            });
                        }
                    }
                }
            }

            failed_channels.push(channel_index);
        }

        match last_failover_err {
            Some((status, body)) => Ok(DispatchOutcome {
                status,
                body: DispatchBody::Json(serde_json::from_str(&body).unwrap_or_else(|_| serde_json::json!({"raw": body}))),
            }),
            None => Err(DispatchError::AllExhausted {
                status: 503,
                body: "no upstream available".to_string(),
                had_retryable_failure: false,
            }),
        }
    }

    /// Round-robins starting from the channel's key list, skipping failed
    /// keys, and deferring globally-deprioritized keys behind fresh ones
    /// (optimization, not a correctness requirement, per spec §4.5).
    async fn next_key(&self, channel: &Channel, failed: &[String]) -> Option<String> {
        let deprioritized = self.deprioritized.read().await;
        let mut fresh = None;
        let mut demoted = None;
        for key in &channel.api_keys {
            if failed.iter().any(|f| f == key) {
                continue;
            }
            if deprioritized.contains(key) {
                demoted.get_or_insert_with(|| key.clone());
            } else {
                fresh.get_or_insert_with(|| key.clone());
                break;
            }
        }
        fresh.or(demoted)
    }

    async fn attempt(
        &self,
        fingerprint: &RequestFingerprint,
        channel: &Channel,
        url: &str,
        api_key: &str,
        config: &DispatcherConfig,
    ) -> AttemptOutcome {
        let upstream_model = channel.map_model(&fingerprint.model_name).to_string();
        let provider_req = match translator::to_provider(
            fingerprint.client_dialect,
            channel.service_type,
            &fingerprint.raw_body,
            &upstream_model,
            api_key,
            url,
            fingerprint.is_stream,
        ) {
            Ok(req) => req,
            Err(_) => {
                return AttemptOutcome::Terminal {
                    status: 400,
                    body: r#"{"error":{"message":"malformed request"}}"#.to_string(),
                }
            }
        };

        let resp = match self
            .transport
            .send(provider_req, fingerprint.is_stream, channel.insecure_skip_verify)
            .await
        {
            Ok(r) => r,
            Err(e) => return AttemptOutcome::Transport(e),
        };

        if (200..300).contains(&resp.status) {
            return self.handle_success(resp, fingerprint, channel, url, api_key, config).await;
        }

        let body_text = match resp.body {
            TransportBody::Unary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            TransportBody::Streaming(mut stream) => {
                let mut buf = Vec::new();
                while let Some(chunk) = stream.next().await {
                    if let Ok(bytes) = chunk {
                        buf.extend_from_slice(&bytes);
                    }
                }
                String::from_utf8_lossy(&buf).to_string()
            }
        };

        let (retry, quota_like) = classify_error(resp.status, &body_text, config.fuzzy_mode);
        if retry {
            AttemptOutcome::Retryable {
                status: resp.status,
                body: body_text,
                quota_like,
            }
        } else {
            AttemptOutcome::Terminal {
                status: resp.status,
                body: body_text,
            }
        }
    }

    async fn handle_success(
        &self,
        resp: transport::TransportResponse,
        fingerprint: &RequestFingerprint,
        channel: &Channel,
        url: &str,
        api_key: &str,
        config: &DispatcherConfig,
    ) -> AttemptOutcome {
        match resp.body {
            TransportBody::Unary(bytes) => {
                let upstream_body: Value = match serde_json::from_slice(&bytes) {
                    Ok(v) => v,
                    Err(_) => {
                        return AttemptOutcome::Terminal {
                            status: 502,
                            body: "upstream returned a malformed response body".to_string(),
                        }
                    }
                };
                match translator::from_provider_unary(
                    channel.service_type,
                    fingerprint.client_dialect,
                    &upstream_body,
                    &fingerprint.model_name,
                    config.estimate_low_usage,
                    self.estimator.as_ref(),
                ) {
                    Ok((client_body, usage)) => {
                        self.metrics
                            .record_success(
                                url,
                                api_key,
                                Some(usage),
                                &fingerprint.model_name,
                                0,
                                &config.api_type,
                            )
                            .await;
                        AttemptOutcome::Success(DispatchOutcome {
                            status: 200,
                            body: DispatchBody::Json(client_body),
                        })
                    }
                    Err(_) => AttemptOutcome::Terminal {
                        status: 502,
                        body: "failed to translate upstream response".to_string(),
                    },
                }
            }
            TransportBody::Streaming(inner) => {
                let response_id = uuid::Uuid::new_v4().to_string();
                let mut sse = SseTranslator::new(
                    channel.service_type,
                    fingerprint.client_dialect,
                    fingerprint.model_name.clone(),
                    response_id,
                );
                let metrics = Arc::clone(&self.metrics);
                let model = fingerprint.model_name.clone();
                let api_type = config.api_type.clone();
                let url = url.to_string();
                let api_key = api_key.to_string();

                let stream = futures::stream::unfold(
                    (inner, sse, metrics, model, api_type, url, api_key),
                    |(mut inner, mut sse, metrics, model, api_type, url, api_key)| async move {
                        match inner.next().await {
                            Some(Ok(bytes)) => {
                                let converted = sse.feed(bytes.as_ref());
                                Some((
                                    Ok(Bytes::from(converted)),
                                    (inner, sse, metrics, model, api_type, url, api_key),
                                ))
                            }
                            Some(Err(e)) => Some((
                                Err(DispatchError::AllExhausted {
                                    status: 502,
                                    body: e.to_string(),
                                    had_retryable_failure: true,
                                }),
                                (inner, sse, metrics, model, api_type, url, api_key),
                            )),
                            None => {
                                metrics
                                    .record_success(&url, &api_key, Some(sse.canonical_usage()), &model, 0, &api_type)
                                    .await;
                                None
                            }
                        }
                    },
                );

                AttemptOutcome::Success(DispatchOutcome {
                    status: 200,
                    body: DispatchBody::Stream(Box::pin(stream)),
                })
            }
        }
    }
}

enum AttemptOutcome {
    Success(DispatchOutcome),
    Transport(TransportError),
    Retryable { status: u16, body: String, quota_like: bool },
    Terminal { status: u16, body: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::clock::ManualClock;
    use crate::circuit::CircuitBreakerConfig;
    use crate::metrics::{HeuristicEstimator, MetricsConfig, MetricsEngine};
    use crate::models::channel::{ChannelStatus, ServiceType};
    use crate::scheduler::{Scheduler, SchedulingStrategy};
    use crate::url_manager::{UrlManager, UrlManagerConfig};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Mutex as TokioMutex;

    enum Scripted {
        Unary(u16, &'static str),
        Transport(TransportError),
    }

    struct FakeTransport {
        script: TokioMutex<VecDeque<Scripted>>,
    }

    impl FakeTransport {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: TokioMutex::new(script.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl UpstreamTransport for FakeTransport {
        async fn send(
            &self,
            _req: crate::translator::ProviderRequest,
            _is_stream: bool,
            _insecure: bool,
        ) -> Result<transport::TransportResponse, TransportError> {
            let mut guard = self.script.lock().await;
            match guard.pop_front().expect("script exhausted") {
                Scripted::Unary(status, body) => Ok(transport::TransportResponse {
                    status,
                    body: TransportBody::Unary(Bytes::from(body)),
                }),
                Scripted::Transport(e) => Err(e),
            }
        }
    }

    fn messages_request() -> Value {
        serde_json::json!({
            "model": "claude-3",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 64,
        })
    }

    fn fingerprint(body: Value, is_stream: bool) -> RequestFingerprint {
        RequestFingerprint {
            client_dialect: ServiceType::MessagesStyle,
            model_name: "claude-3".to_string(),
            user_id: String::new(),
            is_stream,
            raw_body: body,
        }
    }

    fn single_channel(name: &str, urls: &[&str], keys: &[&str]) -> ChannelSet {
        ChannelSet {
            channels: vec![Channel {
                name: name.to_string(),
                service_type: ServiceType::MessagesStyle,
                base_urls: urls.iter().map(|s| s.to_string()).collect(),
                api_keys: keys.iter().map(|s| s.to_string()).collect(),
                priority: 0,
                status: ChannelStatus::Active,
                model_mapping: Default::default(),
                promotion_until: None,
                low_quality: false,
                insecure_skip_verify: false,
            }],
        }
    }

    fn test_dispatcher(transport: FakeTransport) -> Dispatcher {
        let clock: Arc<dyn crate::circuit::clock::Clock> = Arc::new(ManualClock::new(chrono::Utc::now()));
        let scheduler = Arc::new(Scheduler::new(SchedulingStrategy::Failover, chrono::Duration::minutes(10), Arc::clone(&clock)));
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

    fn dispatcher_config() -> DispatcherConfig {
        DispatcherConfig {
            api_type: "messages".to_string(),
            fuzzy_mode: false,
            estimate_low_usage: true,
        }
    }

    #[tokio::test]
    async fn successful_first_attempt_returns_translated_body() {
        let body = r#"{"id":"msg_1","model":"claude-3","content":[{"type":"text","text":"hello"}],"stop_reason":"end_turn","usage":{"input_tokens":5,"output_tokens":3}}"#;
        let dispatcher = test_dispatcher(FakeTransport::new(vec![Scripted::Unary(200, body)]));
        let channels = single_channel("primary", &["https://a.example"], &["key-a"]);
        let outcome = dispatcher
            .dispatch(&fingerprint(messages_request(), false), &channels, &dispatcher_config())
            .await
            .expect("dispatch succeeds");
        assert_eq!(outcome.status, 200);
        match outcome.body {
            DispatchBody::Json(v) => assert_eq!(v["content"][0]["text"], "hello"),
            _ => panic!("expected json body"),
        }
    }

    #[tokio::test]
    async fn failed_key_fails_over_to_next_key_on_same_url() {
        let ok_body = r#"{"id":"msg_2","model":"claude-3","content":[{"type":"text","text":"ok"}],"stop_reason":"end_turn","usage":{"input_tokens":1,"output_tokens":1}}"#;
        let dispatcher = test_dispatcher(FakeTransport::new(vec![
            Scripted::Unary(500, r#"{"error":"boom"}"#),
            Scripted::Unary(200, ok_body),
        ]));
        let channels = single_channel("primary", &["https://a.example"], &["key-a", "key-b"]);
        let outcome = dispatcher
            .dispatch(&fingerprint(messages_request(), false), &channels, &dispatcher_config())
            .await
            .expect("dispatch succeeds after failover");
        assert_eq!(outcome.status, 200);
    }

    #[tokio::test]
    async fn terminal_error_is_forwarded_verbatim_without_further_retry() {
        let dispatcher = test_dispatcher(FakeTransport::new(vec![Scripted::Unary(
            422,
            r#"{"error":"bad request body"}"#,
        )]));
        let channels = single_channel("primary", &["https://a.example"], &["key-a", "key-b"]);
        let outcome = dispatcher
            .dispatch(&fingerprint(messages_request(), false), &channels, &dispatcher_config())
            .await
            .expect("terminal error still returns Ok with the upstream status");
        assert_eq!(outcome.status, 422);
    }

    #[tokio::test]
    async fn transport_error_fails_over_across_urls() {
        let ok_body = r#"{"id":"msg_3","model":"claude-3","content":[{"type":"text","text":"second url"}],"stop_reason":"end_turn","usage":{"input_tokens":1,"output_tokens":1}}"#;
        let dispatcher = test_dispatcher(FakeTransport::new(vec![
            Scripted::Transport(TransportError::Connect("refused".to_string())),
            Scripted::Unary(200, ok_body),
        ]));
        let channels = single_channel(
            "primary",
            &["https://a.example", "https://b.example"],
            &["key-a"],
        );
        let outcome = dispatcher
            .dispatch(&fingerprint(messages_request(), false), &channels, &dispatcher_config())
            .await
            .expect("dispatch succeeds on second url");
        assert_eq!(outcome.status, 200);
    }

    #[tokio::test]
    async fn all_channels_exhausted_surfaces_last_failover_error() {
        let dispatcher = test_dispatcher(FakeTransport::new(vec![Scripted::Unary(
            503,
            r#"{"error":"service unavailable"}"#,
        )]));
        let channels = single_channel("primary", &["https://a.example"], &["key-a"]);
        let outcome = dispatcher
            .dispatch(&fingerprint(messages_request(), false), &channels, &dispatcher_config())
            .await
            .expect("exhausted retryable failures surface as Ok with the last status");
        assert_eq!(outcome.status, 503);
    }
}

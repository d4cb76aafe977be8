//! Within one channel, the first baseURL is rate-limited and the second
//! succeeds; the success must be attributed to the second URL's
//! `originalIdx` (1), not the first (0), in the URL manager's own state.

mod support;

use std::sync::Arc;

use chrono::Utc;
use llm_gateway::circuit::clock::{Clock, ManualClock};
use llm_gateway::circuit::CircuitBreakerConfig;
use llm_gateway::dispatcher::Dispatcher;
use llm_gateway::metrics::{HeuristicEstimator, MetricsConfig, MetricsEngine};
use llm_gateway::scheduler::{Scheduler, SchedulingStrategy};
use llm_gateway::url_manager::{UrlManager, UrlManagerConfig};
use support::{channel, dispatcher_config, messages_fingerprint, single_channel_set, FakeTransport, Scripted};
use llm_gateway::models::channel::ServiceType;

#[tokio::test]
async fn success_on_second_url_is_attributed_to_its_original_index() {
    let ok_body = r#"{"id":"msg_3","model":"claude-3","content":[{"type":"text","text":"second url"}],"stop_reason":"end_turn","usage":{"input_tokens":2,"output_tokens":2}}"#;
    let transport = FakeTransport::new(vec![
        Scripted::Unary(429, r#"{"error":{"message":"rate_limit exceeded"}}"#),
        Scripted::Unary(200, ok_body),
    ]);

    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
    let scheduler = Arc::new(Scheduler::new(SchedulingStrategy::Failover, chrono::Duration::minutes(10), Arc::clone(&clock)));
    let url_manager = Arc::new(UrlManager::new(UrlManagerConfig::default(), Arc::clone(&clock)));
    let metrics = Arc::new(MetricsEngine::new(
        MetricsConfig { breaker: CircuitBreakerConfig::from_window(20), ..MetricsConfig::default() },
        Arc::clone(&clock),
    ));
    let dispatcher = Dispatcher::new(
        Arc::clone(&scheduler),
        Arc::clone(&url_manager),
        metrics,
        Arc::new(transport),
        Arc::new(HeuristicEstimator),
    );

    let base_urls = vec!["https://u1.example".to_string(), "https://u2.example".to_string()];
    let channels = single_channel_set(channel(
        "primary",
        0,
        ServiceType::MessagesStyle,
        &["https://u1.example", "https://u2.example"],
        &["only-key"],
    ));

    let outcome = dispatcher
        .dispatch(&messages_fingerprint("claude-3", false), &channels, &dispatcher_config("messages"))
        .await
        .expect("second url succeeds after the first is rate-limited");
    assert_eq!(outcome.status, 200);

    let sorted = url_manager.get_sorted_urls(0, &base_urls).await;
    let winner = sorted.iter().find(|s| s.url == "https://u2.example").unwrap();
    assert_eq!(winner.original_idx, 1);
    assert!(winner.available);

    let loser = sorted.iter().find(|s| s.url == "https://u1.example").unwrap();
    assert_eq!(loser.original_idx, 0);
    assert!(!loser.available);
}

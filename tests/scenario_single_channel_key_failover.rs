//! First key rate-limited, second key on the same channel succeeds.

mod support;

use std::sync::Arc;

use chrono::Utc;
use llm_gateway::circuit::clock::ManualClock;
use llm_gateway::dispatcher::DispatchBody;
use llm_gateway::models::channel::ServiceType;
use support::{channel, dispatcher_config, messages_fingerprint, single_channel_set, test_dispatcher, FakeTransport, Scripted};

#[tokio::test]
async fn rate_limited_key_fails_over_to_second_key() {
    let ok_body = r#"{"id":"msg_1","model":"claude-3","content":[{"type":"text","text":"hi there"}],"stop_reason":"end_turn","usage":{"input_tokens":3,"output_tokens":2}}"#;
    let transport = FakeTransport::new(vec![
        Scripted::Unary(429, r#"{"error":{"message":"rate_limit exceeded"}}"#),
        Scripted::Unary(200, ok_body),
    ]);
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let dispatcher = test_dispatcher(transport, clock);

    let channels = single_channel_set(channel(
        "primary",
        0,
        ServiceType::MessagesStyle,
        &["https://a.example"],
        &["key-limited", "key-good"],
    ));

    let outcome = dispatcher
        .dispatch(&messages_fingerprint("claude-3", false), &channels, &dispatcher_config("messages"))
        .await
        .expect("second key succeeds after first is rate-limited");

    assert_eq!(outcome.status, 200);
    match outcome.body {
        DispatchBody::Json(v) => assert_eq!(v["content"][0]["text"], "hi there"),
        _ => panic!("expected a unary json body"),
    }
}

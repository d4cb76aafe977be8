//! Priority-1 channel always fails; priority-2 channel succeeds. The
//! failover strategy must exhaust the higher-priority channel's keys
//! before moving on, not interleave them.

mod support;

use std::sync::Arc;

use chrono::Utc;
use llm_gateway::circuit::clock::ManualClock;
use llm_gateway::dispatcher::DispatchBody;
use llm_gateway::models::channel::{ChannelSet, ServiceType};
use support::{channel, dispatcher_config, messages_fingerprint, test_dispatcher, FakeTransport, Scripted};

#[tokio::test]
async fn lower_priority_channel_is_reached_after_higher_priority_exhausts() {
    let ok_body = r#"{"id":"msg_2","model":"claude-3","content":[{"type":"text","text":"from backup"}],"stop_reason":"end_turn","usage":{"input_tokens":4,"output_tokens":2}}"#;
    let transport = FakeTransport::new(vec![
        Scripted::Unary(500, r#"{"error":"always down"}"#),
        Scripted::Unary(200, ok_body),
    ]);
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let dispatcher = test_dispatcher(transport, clock);

    let channels = ChannelSet {
        channels: vec![
            channel("flaky", 1, ServiceType::MessagesStyle, &["https://flaky.example"], &["key-a"]),
            channel("backup", 2, ServiceType::MessagesStyle, &["https://backup.example"], &["key-b"]),
        ],
    };

    let outcome = dispatcher
        .dispatch(&messages_fingerprint("claude-3", false), &channels, &dispatcher_config("messages"))
        .await
        .expect("backup channel succeeds once the priority-1 channel is exhausted");

    assert_eq!(outcome.status, 200);
    match outcome.body {
        DispatchBody::Json(v) => assert_eq!(v["content"][0]["text"], "from backup"),
        _ => panic!("expected a unary json body"),
    }
}

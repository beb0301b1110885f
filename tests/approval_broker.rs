//! Integration tests for the approval handshake.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use clawd::approval::{prompts, ApprovalBroker};
use clawd::comm::{ChatTarget, ConversationKey, TransportRegistry};
use clawd::events::{ApprovalOutcome, CoordinatorEvent, EventBus};
use common::RecordingTransport;

async fn broker() -> (ApprovalBroker, Arc<RecordingTransport>, EventBus) {
    let events = EventBus::new();
    let transports = TransportRegistry::new();
    let transport = Arc::new(RecordingTransport::new());
    transports.register(transport.clone()).await;
    (ApprovalBroker::new(transports, events.clone()), transport, events)
}

fn key() -> ConversationKey {
    ConversationKey::from("agent:main:test:dm:chat-1")
}

fn target() -> ChatTarget {
    ChatTarget::new(common::PLATFORM, common::CHAT)
}

#[tokio::test]
async fn reply_resolves_the_waiting_request() {
    let (broker, transport, _events) = broker().await;

    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .request_approval(&key(), &target(), "Proceed?", Duration::from_secs(5))
                .await
        })
    };

    assert_eq!(transport.wait_for_messages(1).await, vec!["Proceed?"]);
    assert!(broker.is_pending(&key()));
    assert!(broker.resolve(&key(), "yes"));
    assert_eq!(waiter.await.unwrap().as_deref(), Some("yes"));
    assert!(!broker.is_pending(&key()));
    assert_eq!(broker.pending_count(), 0);
}

#[tokio::test]
async fn resolve_without_a_wait_is_a_normal_message() {
    let (broker, _transport, _events) = broker().await;
    assert!(!broker.resolve(&key(), "hello"));
}

#[tokio::test]
async fn unanswered_request_times_out_to_none() {
    let (broker, _transport, events) = broker().await;
    let mut rx = events.subscribe();

    let timeout = Duration::from_millis(50);
    let started = Instant::now();
    let reply = broker.request_approval(&key(), &target(), "Proceed?", timeout).await;
    assert_eq!(reply, None);
    assert!(started.elapsed() >= timeout, "gave up after {:?}", started.elapsed());
    assert!(!broker.is_pending(&key()));
    // A late reply is treated as a normal message.
    assert!(!broker.resolve(&key(), "yes"));

    let mut outcomes = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        if let CoordinatorEvent::ApprovalResolved { outcome, .. } = ev {
            outcomes.push(outcome);
        }
    }
    assert_eq!(outcomes, vec![ApprovalOutcome::TimedOut]);
}

#[tokio::test]
async fn newer_request_preempts_the_older_one() {
    let (broker, transport, _events) = broker().await;

    let first = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .request_approval(&key(), &target(), "first?", Duration::from_secs(5))
                .await
        })
    };
    transport.wait_for_messages(1).await;

    let second = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .request_approval(&key(), &target(), "second?", Duration::from_secs(5))
                .await
        })
    };

    assert_eq!(first.await.unwrap(), None);
    transport.wait_for_messages(2).await;
    assert!(broker.resolve(&key(), "2"));
    assert_eq!(second.await.unwrap().as_deref(), Some("2"));
}

#[tokio::test]
async fn cancel_releases_the_waiter() {
    let (broker, transport, _events) = broker().await;

    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .request_approval(&key(), &target(), "Proceed?", Duration::from_secs(5))
                .await
        })
    };
    transport.wait_for_messages(1).await;

    assert!(broker.cancel(&key()));
    assert_eq!(waiter.await.unwrap(), None);
    assert!(!broker.cancel(&key()));
}

#[tokio::test]
async fn undeliverable_prompt_resolves_immediately() {
    let (broker, _transport, _events) = broker().await;
    let nowhere = ChatTarget::new("carrier-pigeon", "1");

    let reply = tokio::time::timeout(
        Duration::from_secs(1),
        broker.request_approval(&key(), &nowhere, "Proceed?", Duration::from_secs(30)),
    )
    .await
    .expect("an undeliverable prompt must not wait for the timeout");
    assert_eq!(reply, None);
    assert!(!broker.is_pending(&key()));
}

#[test]
fn prompt_helpers_round_trip_choices() {
    let options = vec!["Monday".to_string(), "Friday".to_string()];
    let prompt = prompts::question_prompt("Which day?", &options);
    assert!(prompt.contains("1. Monday"));
    assert!(prompt.contains("2. Friday"));
    assert_eq!(prompts::parse_choice("2", &options), "Friday");
    assert_eq!(prompts::parse_choice("  saturday ", &options), "saturday");

    assert!(prompts::parse_permission("Y"));
    assert!(prompts::parse_permission(" yes "));
    assert!(!prompts::parse_permission("sure, why not"));
}

//! Purpose: Exercise the change subscriber's delivery and self-healing.
//! Exports: None (integration test module).
//! Role: Validate DataChanged delivery, decode-error isolation, backoff, and shutdown.
//! Invariants: Time-dependent tests run on a paused clock, so backoff waits are virtual.

use clouddb::api::{
    Client, ClientConfig, ErrorKind, Event, MemoryConnector, MemoryStore, Operation,
    SubscriberState,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

const PROJECT: &str = "proj";

fn listening_client(store: &Arc<MemoryStore>) -> (Client<MemoryConnector>, UnboundedReceiver<Event>) {
    Client::builder(ClientConfig::new(PROJECT, "token"))
        .connector(store.connector())
        .build()
}

async fn next_event(events: &mut UnboundedReceiver<Event>) -> TestResult<Event> {
    let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await?
        .ok_or("event channel closed")?;
    Ok(event)
}

async fn wait_for_state(client: &Client<MemoryConnector>, wanted: SubscriberState) -> TestResult<()> {
    let mut states = client.watch_subscriber();
    tokio::time::timeout(Duration::from_secs(60), states.wait_for(|state| *state == wanted))
        .await??;
    Ok(())
}

fn changed(tag: &str, value: serde_json::Value) -> Event {
    Event::DataChanged {
        tag: tag.to_string(),
        value,
    }
}

#[tokio::test(start_paused = true)]
async fn reaches_subscribed_after_failed_attempts_with_fixed_backoff() -> TestResult<()> {
    let store = MemoryStore::new();
    store.fail_next_subscribes(3);
    let started = Instant::now();
    let (client, _events) = listening_client(&store);

    wait_for_state(&client, SubscriberState::Subscribed).await?;

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(9), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "{elapsed:?}");
    assert_eq!(store.connect_count(), 4);
    assert_eq!(store.subscriber_count(), 1);
    Ok(())
}

#[tokio::test]
async fn own_writes_come_back_as_one_change_per_value() -> TestResult<()> {
    let store = MemoryStore::new();
    let (client, mut events) = listening_client(&store);
    wait_for_state(&client, SubscriberState::Subscribed).await?;

    client.store_value("x", &json!("a"))?;
    client.store_value("x", &json!({"b": 2}))?;

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(next_event(&mut events).await?);
    }
    let changes: Vec<&Event> = seen
        .iter()
        .filter(|event| matches!(event, Event::DataChanged { .. }))
        .collect();
    assert_eq!(changes, vec![&changed("x", json!("a")), &changed("x", json!({"b": 2}))]);
    assert!(seen.contains(&Event::UpdateDone {
        tag: "x".to_string(),
        operation: Operation::StoreValue,
    }));
    Ok(())
}

#[tokio::test]
async fn undecodable_notification_is_reported_without_resubscribing() -> TestResult<()> {
    let store = MemoryStore::new();
    let (client, mut events) = listening_client(&store);
    wait_for_state(&client, SubscriberState::Subscribed).await?;

    store.publish(PROJECT, "definitely not json");
    match next_event(&mut events).await? {
        Event::Error { kind, .. } => assert_eq!(kind, ErrorKind::Decode),
        other => return Err(format!("expected decode error, got {other:?}").into()),
    }

    store.publish(PROJECT, json!(["t", ["[1,2]"]]).to_string());
    assert_eq!(next_event(&mut events).await?, changed("t", json!([1, 2])));
    assert_eq!(client.subscriber_state(), SubscriberState::Subscribed);
    assert_eq!(store.connect_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dropped_stream_is_resubscribed_after_backoff() -> TestResult<()> {
    let store = MemoryStore::new();
    let (client, mut events) = listening_client(&store);
    wait_for_state(&client, SubscriberState::Subscribed).await?;

    let dropped_at = Instant::now();
    store.disconnect_subscribers();
    wait_for_state(&client, SubscriberState::Starting).await?;
    wait_for_state(&client, SubscriberState::Subscribed).await?;
    assert!(dropped_at.elapsed() >= Duration::from_secs(3));
    assert_eq!(store.connect_count(), 2);

    store.publish(PROJECT, json!(["t", ["true"]]).to_string());
    assert_eq!(next_event(&mut events).await?, changed("t", json!(true)));
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_the_subscriber_for_good() -> TestResult<()> {
    let store = MemoryStore::new();
    let (client, _events) = listening_client(&store);
    wait_for_state(&client, SubscriberState::Subscribed).await?;

    client.shutdown().await;

    assert_eq!(client.subscriber_state(), SubscriberState::Stopped);
    assert_eq!(store.subscriber_count(), 0);
    assert!(!client.is_usable());
    let err = client.store_value("x", &json!(1)).expect_err("shut down");
    assert_eq!(err.kind(), ErrorKind::Shutdown);
    let err = client.start_listening().expect_err("shut down");
    assert_eq!(err.kind(), ErrorKind::Shutdown);
    Ok(())
}

#[tokio::test]
async fn rejected_token_stops_subscriber_and_reports_once() -> TestResult<()> {
    let store = MemoryStore::with_token("right");
    let (client, mut events) = Client::builder(ClientConfig::new(PROJECT, "wrong"))
        .connector(store.connector())
        .build();

    match next_event(&mut events).await? {
        Event::Error { kind, .. } => assert_eq!(kind, ErrorKind::Auth),
        other => return Err(format!("expected auth error, got {other:?}").into()),
    }
    wait_for_state(&client, SubscriberState::Stopped).await?;
    assert!(!client.is_usable());
    assert_eq!(store.connect_count(), 1);
    assert!(events.try_recv().is_err());
    Ok(())
}

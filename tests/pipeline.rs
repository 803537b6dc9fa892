//! Purpose: Exercise the write-coalescing pipeline against the in-process store.
//! Exports: None (integration test module).
//! Role: Validate coalescing, cross-tag ordering, exclusivity, and fault containment.
//! Invariants: Every wait on an event is bounded so a lost event fails instead of hanging.

use clouddb::api::{
    Client, ClientConfig, ErrorKind, Event, MemoryConnector, MemoryStore, Operation, ScriptCall,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

const PROJECT: &str = "proj";

fn client(store: &Arc<MemoryStore>) -> (Client<MemoryConnector>, UnboundedReceiver<Event>) {
    Client::builder(ClientConfig::new(PROJECT, "token"))
        .connector(store.connector())
        .listen(false)
        .build()
}

async fn next_event(events: &mut UnboundedReceiver<Event>) -> TestResult<Event> {
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await?
        .ok_or("event channel closed")?;
    Ok(event)
}

fn done(tag: &str) -> Event {
    Event::UpdateDone {
        tag: tag.to_string(),
        operation: Operation::StoreValue,
    }
}

fn write(tag: &str, values: &[Value]) -> ScriptCall {
    let encoded: Vec<String> = values.iter().map(Value::to_string).collect();
    ScriptCall {
        script: "set_and_publish",
        keys: vec![tag.to_string()],
        args: vec![
            encoded.last().cloned().unwrap_or_default(),
            Value::from(encoded.clone()).to_string(),
            PROJECT.to_string(),
        ],
    }
}

#[tokio::test]
async fn same_tag_burst_becomes_one_write_in_call_order() -> TestResult<()> {
    let store = MemoryStore::new();
    let (client, mut events) = client(&store);

    let values: Vec<Value> = (1..=6).map(|n| json!({"drag": n})).collect();
    for value in &values {
        client.store_value("x", value)?;
    }

    assert_eq!(next_event(&mut events).await?, done("x"));
    assert_eq!(store.script_calls(), vec![write("x", &values)]);
    assert_eq!(store.value("proj:x"), Some(json!({"drag": 6}).to_string()));
    assert!(events.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn interleaved_tags_flush_separately_in_order() -> TestResult<()> {
    let store = MemoryStore::new();
    let (client, mut events) = client(&store);

    client.store_value("A", &json!(1))?;
    client.store_value("B", &json!(2))?;
    client.store_value("A", &json!(3))?;

    assert_eq!(next_event(&mut events).await?, done("A"));
    assert_eq!(next_event(&mut events).await?, done("B"));
    assert_eq!(next_event(&mut events).await?, done("A"));
    assert_eq!(
        store.script_calls(),
        vec![
            write("A", &[json!(1)]),
            write("B", &[json!(2)]),
            write("A", &[json!(3)]),
        ]
    );
    assert_eq!(store.value("proj:A").as_deref(), Some("3"));
    Ok(())
}

#[tokio::test]
async fn x_x_y_scenario_issues_two_writes() -> TestResult<()> {
    let store = MemoryStore::new();
    let (client, mut events) = client(&store);

    client.store_value("x", &json!("a"))?;
    client.store_value("x", &json!("b"))?;
    client.store_value("y", &json!("c"))?;

    assert_eq!(next_event(&mut events).await?, done("x"));
    assert_eq!(next_event(&mut events).await?, done("y"));
    assert_eq!(
        store.script_calls(),
        vec![write("x", &[json!("a"), json!("b")]), write("y", &[json!("c")])]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stores_and_gets_never_overlap_on_the_connection() -> TestResult<()> {
    let store = MemoryStore::new();
    let (client, mut events) = client(&store);

    for n in 0..10 {
        client.store_value(&format!("s{n}"), &json!(n))?;
        client.get_value(&format!("g{n}"), &json!(null))?;
    }

    let mut completions = 0;
    let mut reads = 0;
    while completions + reads < 20 {
        match next_event(&mut events).await? {
            Event::UpdateDone { .. } => completions += 1,
            Event::GotValue { .. } => reads += 1,
            other => return Err(format!("unexpected event {other:?}").into()),
        }
    }
    assert_eq!((completions, reads), (10, 10));
    assert_eq!(store.max_concurrent_operations(), 1);
    assert_eq!(store.connect_count(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_flush_drops_queue_and_next_store_uses_fresh_connection() -> TestResult<()> {
    let store = MemoryStore::new();
    let (client, mut events) = client(&store);

    store.fail_next_evals(1);
    client.store_value("x", &json!(1))?;
    client.store_value("y", &json!(2))?;
    client.store_value("z", &json!(3))?;

    match next_event(&mut events).await? {
        Event::Error { kind, message } => {
            assert_eq!(kind, ErrorKind::Protocol);
            assert!(message.contains("injected fault"), "{message}");
            assert!(message.contains("(tag: x)"), "{message}");
        }
        other => return Err(format!("expected flush error, got {other:?}").into()),
    }
    match next_event(&mut events).await? {
        Event::Error { message, .. } => assert!(message.starts_with("2 queued"), "{message}"),
        other => return Err(format!("expected discard notice, got {other:?}").into()),
    }
    assert_eq!(client.pending_writes(), 0);
    assert_eq!(store.value("proj:y"), None);
    assert_eq!(store.value("proj:z"), None);

    client.store_value("w", &json!(4))?;
    assert_eq!(next_event(&mut events).await?, done("w"));
    assert_eq!(store.script_calls(), vec![write("w", &[json!(4)])]);
    assert_eq!(store.connect_count(), 2);
    Ok(())
}

#[tokio::test]
async fn shutdown_reports_writes_it_discards() -> TestResult<()> {
    let store = MemoryStore::new();
    let (client, mut events) = client(&store);

    client.store_value("x", &json!(1))?;
    client.shutdown().await;

    match next_event(&mut events).await? {
        Event::Error { kind, message } => {
            assert_eq!(kind, ErrorKind::Shutdown);
            assert!(message.starts_with("1 queued write(s) discarded at shutdown"), "{message}");
        }
        other => return Err(format!("expected discard notice, got {other:?}").into()),
    }
    assert_eq!(client.pending_writes(), 0);
    assert_eq!(store.value("proj:x"), None);
    assert!(!client.is_usable());
    Ok(())
}

#[tokio::test]
async fn offline_store_is_reported_and_not_queued() -> TestResult<()> {
    let store = MemoryStore::new();
    let (client, mut events) = Client::builder(ClientConfig::new(PROJECT, "token"))
        .connector(store.connector())
        .connectivity(|| false)
        .listen(false)
        .build();

    client.store_value("x", &json!(1))?;
    match next_event(&mut events).await? {
        Event::Error { kind, .. } => assert_eq!(kind, ErrorKind::Offline),
        other => return Err(format!("expected offline error, got {other:?}").into()),
    }
    assert_eq!(client.pending_writes(), 0);
    assert_eq!(store.connect_count(), 0);
    Ok(())
}

//! Purpose: Keep a live change-notification stream for the project channel.
//! Exports: `Subscriber`, `SubscriberState`, `SubscriberContext`, `decode_change`.
//! Role: Change Subscriber; one long-lived task with an explicit retry loop.
//! Invariants: At most one listening task per client.
//! Invariants: Retries wait the configured backoff and stop once the client is unusable.
//! Invariants: A payload that fails to decode is reported but does not drop the stream.
use super::connection::ConnectionManager;
use super::event::{Event, EventSink};
use crate::core::error::{ClientResult, Error, ErrorKind};
use crate::core::lifecycle::ClientState;
use crate::transport::{Connector, StoreConnection, Subscription};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscriberState {
    Stopped,
    Starting,
    Subscribed,
}

pub struct SubscriberContext<C: Connector> {
    pub connections: Arc<ConnectionManager<C>>,
    pub state: Arc<ClientState>,
    pub events: Arc<dyn EventSink>,
    pub channel: String,
    pub backoff: Duration,
}

pub struct Subscriber {
    status: Arc<watch::Sender<SubscriberState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Subscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscriber {
    pub fn new() -> Self {
        let (status, _) = watch::channel(SubscriberState::Stopped);
        Self {
            status: Arc::new(status),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SubscriberState {
        *self.status.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<SubscriberState> {
        self.status.subscribe()
    }

    /// Start listening unless a task is already running or the client is unusable.
    pub fn start<C: Connector>(&self, ctx: SubscriberContext<C>) -> bool {
        let mut task = self.lock();
        if task.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }
        if !ctx.state.is_usable() {
            return false;
        }
        let status = Arc::clone(&self.status);
        *task = Some(tokio::spawn(run(ctx, status)));
        true
    }

    /// Abort the listening task without waiting for it to unwind.
    pub fn stop_now(&self) {
        if let Some(task) = self.lock().take() {
            task.abort();
        }
        self.status.send_replace(SubscriberState::Stopped);
    }

    /// Abort the listening task and wait until it has fully stopped.
    pub async fn stop(&self) {
        let task = self.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            debug!("change subscriber stopped");
        }
        self.status.send_replace(SubscriberState::Stopped);
    }

    fn lock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

async fn run<C: Connector>(ctx: SubscriberContext<C>, status: Arc<watch::Sender<SubscriberState>>) {
    let mut attempt: u64 = 0;
    while ctx.state.is_usable() {
        attempt += 1;
        status.send_replace(SubscriberState::Starting);
        match listen(&ctx, &status).await {
            Ok(()) => info!(channel = %ctx.channel, "change stream ended"),
            Err(err) => warn!(channel = %ctx.channel, attempt, error = %err, "change subscription failed"),
        }
        if !ctx.state.is_usable() {
            break;
        }
        status.send_replace(SubscriberState::Starting);
        debug!(backoff_ms = ctx.backoff.as_millis() as u64, "waiting before resubscribing");
        tokio::time::sleep(ctx.backoff).await;
    }
    status.send_replace(SubscriberState::Stopped);
}

async fn listen<C: Connector>(
    ctx: &SubscriberContext<C>,
    status: &watch::Sender<SubscriberState>,
) -> ClientResult<()> {
    let conn = ctx.connections.acquire_for_subscription().await?;
    let mut stream = conn.subscribe(&ctx.channel).await?;
    status.send_replace(SubscriberState::Subscribed);
    info!(channel = %ctx.channel, "subscribed to change stream");
    while let Some(payload) = stream.next_message().await? {
        match decode_change(&payload) {
            Ok((tag, values)) => {
                for value in values {
                    ctx.events.deliver(Event::DataChanged {
                        tag: tag.clone(),
                        value,
                    });
                }
            }
            Err(err) => {
                warn!(error = %err, "undecodable change notification");
                ctx.events.deliver(Event::from_error(&err));
            }
        }
    }
    Ok(())
}

/// Split a published `[tag, [encoded, ...]]` notification into the tag and
/// its decoded values. A bare second element is treated as a single value.
pub fn decode_change(payload: &str) -> ClientResult<(String, Vec<Value>)> {
    let parsed: Value = serde_json::from_str(payload).map_err(|err| {
        Error::new(ErrorKind::Decode)
            .with_message(format!("change notification is not JSON: {err}"))
    })?;
    let Value::Array(mut parts) = parsed else {
        return Err(Error::new(ErrorKind::Decode)
            .with_message("change notification is not a [tag, values] pair"));
    };
    if parts.len() != 2 {
        return Err(Error::new(ErrorKind::Decode)
            .with_message("change notification is not a [tag, values] pair"));
    }
    let body = parts.pop().unwrap_or(Value::Null);
    let tag = match parts.pop() {
        Some(Value::String(tag)) => tag,
        _ => {
            return Err(Error::new(ErrorKind::Decode)
                .with_message("change notification tag is not a string"));
        }
    };
    let items = match body {
        Value::Array(items) => items,
        single => vec![single],
    };
    let values = items
        .into_iter()
        .map(|item| decode_item(item, &tag))
        .collect::<ClientResult<Vec<_>>>()?;
    Ok((tag, values))
}

fn decode_item(item: Value, tag: &str) -> ClientResult<Value> {
    match item {
        Value::String(encoded) => serde_json::from_str(&encoded).map_err(|err| {
            Error::new(ErrorKind::Decode)
                .with_message(format!("changed value is not JSON: {err}"))
                .with_tag(tag)
        }),
        other => Ok(other),
    }
}

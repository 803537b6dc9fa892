//! Purpose: Public client facade: store, retrieve, list operations, and change events.
//! Exports: `Client`, `ClientBuilder`.
//! Role: Wires config, lifecycle, connection manager, executor, pipeline, and subscriber.
//! Invariants: Configuration errors and use after shutdown/death fail at the call site.
//! Invariants: Every other outcome (including offline) is delivered as an `Event`.
//! Invariants: Work against the shared connection only ever runs on the executor.
//! Notes: Building a client spawns tasks, so it must happen inside a tokio runtime.
use super::config::{ClientConfig, resolve_server};
use super::connection::{ConnectionManager, dead_error};
use super::event::{Event, EventSink, Operation};
use super::executor::Executor;
use super::pipeline::{self, StoreQueue};
use super::scripted;
use super::subscriber::{Subscriber, SubscriberContext, SubscriberState};
use crate::core::error::{ClientResult, Error, ErrorKind};
use crate::core::lifecycle::ClientState;
use crate::transport::{Connector, Endpoint, RedisConnector, StoreConnection};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

type Connectivity = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct ClientBuilder<C: Connector = RedisConnector> {
    config: ClientConfig,
    connector: C,
    connectivity: Connectivity,
    listen: bool,
}

impl ClientBuilder<RedisConnector> {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connector: RedisConnector::new(),
            connectivity: Arc::new(|| true),
            listen: true,
        }
    }
}

impl<C: Connector> ClientBuilder<C> {
    /// Use a different transport, e.g. the in-process store.
    pub fn connector<D: Connector>(self, connector: D) -> ClientBuilder<D> {
        ClientBuilder {
            config: self.config,
            connector,
            connectivity: self.connectivity,
            listen: self.listen,
        }
    }

    /// Predicate consulted before each operation; `false` means offline.
    pub fn connectivity(mut self, online: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.connectivity = Arc::new(online);
        self
    }

    /// Whether to start the change subscriber as soon as the client is built.
    pub fn listen(mut self, listen: bool) -> Self {
        self.listen = listen;
        self
    }

    pub fn build(self) -> (Client<C>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.build_with_sink(Arc::new(tx)), rx)
    }

    pub fn build_with_sink(self, events: Arc<dyn EventSink>) -> Client<C> {
        let state = Arc::new(ClientState::new());
        let connections = Arc::new(ConnectionManager::new(
            self.connector,
            self.config.endpoint(),
            self.config.token.clone(),
            Arc::clone(&state),
            Arc::clone(&events),
        ));
        let inner = Arc::new(Inner {
            config: self.config,
            state,
            events,
            connections,
            executor: Executor::new(),
            queue: StoreQueue::new(),
            subscriber: Subscriber::new(),
            listening: AtomicBool::new(false),
            connectivity: self.connectivity,
        });
        if self.listen && inner.config.validate().is_ok() {
            inner.listening.store(true, Ordering::Release);
            inner.subscriber.start(inner.subscriber_context());
        }
        Client { inner }
    }
}

pub struct Client<C: Connector = RedisConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Client<RedisConnector> {
    pub fn builder(config: ClientConfig) -> ClientBuilder<RedisConnector> {
        ClientBuilder::new(config)
    }
}

impl<C: Connector> Client<C> {
    /// The configuration the client was built with. `set_server` does not
    /// change it; see [`Client::endpoint`].
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The server new connections are opened against.
    pub fn endpoint(&self) -> Endpoint {
        self.inner.connections.endpoint()
    }

    pub fn is_usable(&self) -> bool {
        self.inner.state.is_usable()
    }

    pub fn cloud_connected(&self) -> bool {
        (self.inner.connectivity)()
    }

    pub fn subscriber_state(&self) -> SubscriberState {
        self.inner.subscriber.state()
    }

    pub fn watch_subscriber(&self) -> watch::Receiver<SubscriberState> {
        self.inner.subscriber.watch()
    }

    /// Writes queued and not yet picked up by the pipeline worker.
    pub fn pending_writes(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn connector(&self) -> &C {
        self.inner.connections.connector()
    }

    /// Start the change subscriber if it is not already running.
    pub fn start_listening(&self) -> ClientResult<()> {
        self.inner.config.validate()?;
        self.inner.ensure_usable()?;
        self.inner.listening.store(true, Ordering::Release);
        self.inner.subscriber.start(self.inner.subscriber_context());
        Ok(())
    }

    /// Queue `value` for `tag`. Completion arrives as `UpdateDone`.
    pub fn store_value(&self, tag: &str, value: &Value) -> ClientResult<()> {
        if !self.preflight(Some(tag))? {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let executor = &self.inner.executor;
        self.inner.queue.push(tag.to_string(), value.to_string(), || {
            executor.submit(move |generation| pipeline::drain(inner, generation))
        });
        Ok(())
    }

    /// Fetch `tag`; an absent tag yields `default`. Arrives as `GotValue`.
    pub fn get_value(&self, tag: &str, default: &Value) -> ClientResult<()> {
        if !self.preflight(Some(tag))? {
            return Ok(());
        }
        let default = default.to_string();
        let owned = tag.to_string();
        self.dispatch(Some(tag), move |inner| fetch(inner, owned, default))
    }

    pub fn append_value_to_list(&self, tag: &str, item: &Value) -> ClientResult<()> {
        if !self.preflight(Some(tag))? {
            return Ok(());
        }
        let item = item.to_string();
        let owned = tag.to_string();
        self.dispatch(Some(tag), move |inner| append(inner, owned, item))
    }

    pub fn remove_first_from_list(&self, tag: &str) -> ClientResult<()> {
        if !self.preflight(Some(tag))? {
            return Ok(());
        }
        let owned = tag.to_string();
        self.dispatch(Some(tag), move |inner| remove_first(inner, owned))
    }

    pub fn clear_tag(&self, tag: &str) -> ClientResult<()> {
        if !self.preflight(Some(tag))? {
            return Ok(());
        }
        let owned = tag.to_string();
        self.dispatch(Some(tag), move |inner| clear(inner, owned))
    }

    pub fn get_tag_list(&self) -> ClientResult<()> {
        if !self.preflight(None)? {
            return Ok(());
        }
        self.dispatch(None, list_tags)
    }

    /// Point the client at another server. The subscriber is stopped first
    /// and restarted against the new endpoint; queued writes are discarded.
    pub async fn set_server(&self, server: &str, port: u16) -> ClientResult<()> {
        self.inner.ensure_usable()?;
        self.inner.subscriber.stop().await;
        let mut endpoint = self.inner.connections.endpoint();
        endpoint.host = resolve_server(server);
        endpoint.port = port;
        info!(%endpoint, "switching server");
        self.inner.connections.set_endpoint(endpoint);
        let generation = self.inner.executor.generation();
        match self.inner.invalidate(generation).await {
            Some(dropped) => self.inner.report_discarded(dropped, "after the server changed"),
            None => self.inner.restart_subscriber(),
        }
        Ok(())
    }

    /// Stop background work and close the connection. Idempotent.
    pub async fn shutdown(&self) {
        if !self.inner.state.request_shutdown() {
            return;
        }
        info!("shutting down client");
        self.inner.subscriber.stop().await;
        let dropped = self.inner.queue.detach();
        if dropped > 0 {
            warn!(dropped, "discarding unsent writes at shutdown");
            self.inner.events.deliver(Event::Error {
                kind: ErrorKind::Shutdown,
                message: format!("{dropped} queued write(s) discarded at shutdown"),
            });
        }
        self.inner.connections.invalidate().await;
    }

    /// Synchronous checks shared by every operation. `Ok(false)` means the
    /// client is offline and an error event has already been delivered.
    fn preflight(&self, tag: Option<&str>) -> ClientResult<bool> {
        self.inner.config.validate()?;
        self.inner.ensure_usable()?;
        if (self.inner.connectivity)() {
            return Ok(true);
        }
        let mut err = Error::new(ErrorKind::Offline)
            .with_message("no network connectivity")
            .with_hint("Retry once the device is back online.");
        if let Some(tag) = tag {
            err = err.with_tag(tag);
        }
        self.inner.events.deliver(Event::from_error(&err));
        Ok(false)
    }

    fn dispatch<F, Fut>(&self, tag: Option<&str>, op: F) -> ClientResult<()>
    where
        F: FnOnce(Arc<Inner<C>>) -> Fut + Send + 'static,
        Fut: Future<Output = ClientResult<Event>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let reply = ReplyGuard {
            events: Arc::clone(&self.inner.events),
            state: Arc::clone(&self.inner.state),
            tag: Some(tag.unwrap_or_default().to_string()),
        };
        let submitted = self.inner.executor.submit(move |generation| async move {
            let mut reply = reply;
            let outcome = match inner.ensure_usable() {
                Ok(()) => op(Arc::clone(&inner)).await,
                Err(err) => Err(err),
            };
            reply.settle();
            match outcome {
                Ok(event) => inner.events.deliver(event),
                Err(err) => {
                    let dropped = if err.kind().is_connection_fault() && inner.state.is_usable() {
                        inner.invalidate(generation).await.unwrap_or(0)
                    } else {
                        0
                    };
                    inner.report(&err);
                    inner.report_discarded(dropped, "after the connection was reset");
                }
            }
        });
        submitted.map(|_| ()).ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("operation executor is not running")
        })
    }
}

pub(crate) struct Inner<C: Connector> {
    pub(crate) config: ClientConfig,
    pub(crate) state: Arc<ClientState>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) connections: Arc<ConnectionManager<C>>,
    pub(crate) executor: Executor,
    pub(crate) queue: StoreQueue,
    pub(crate) subscriber: Subscriber,
    listening: AtomicBool,
    connectivity: Connectivity,
}

impl<C: Connector> Inner<C> {
    pub(crate) fn key(&self, tag: &str) -> String {
        format!("{}:{tag}", self.config.project_id)
    }

    pub(crate) fn ensure_usable(&self) -> ClientResult<()> {
        if self.state.is_usable() {
            Ok(())
        } else {
            Err(self.unusable_error())
        }
    }

    pub(crate) fn unusable_error(&self) -> Error {
        if self.state.is_dead() {
            dead_error()
        } else {
            Error::new(ErrorKind::Shutdown).with_message("client is shut down")
        }
    }

    /// Deliver `err` as an event unless it was already surfaced elsewhere.
    pub(crate) fn report(&self, err: &Error) {
        match err.kind() {
            // The rejected AUTH was reported once when `dead` latched.
            ErrorKind::Auth if self.state.is_dead() => debug!(error = %err, "suppressed"),
            ErrorKind::Shutdown => debug!(error = %err, "operation stopped by shutdown"),
            _ => {
                warn!(error = %err, "operation failed");
                self.events.deliver(Event::from_error(err));
            }
        }
    }

    /// Tear down the shared connection and the worker that observed the
    /// fault. Only the first invalidation for `generation` does anything.
    ///
    /// Returns how many queued writes were discarded, or `None` when another
    /// invalidation got there first. The caller reports the discard after
    /// the error that caused it.
    pub(crate) async fn invalidate(self: &Arc<Self>, generation: u64) -> Option<usize> {
        let replaced = self
            .connections
            .invalidate_if(|| self.executor.replace(generation))
            .await;
        if !replaced {
            debug!(generation, "connection already invalidated");
            return None;
        }
        info!(generation, "connection invalidated");
        let dropped = self.queue.detach();
        if dropped > 0 {
            warn!(dropped, "discarding queued writes after invalidation");
        }
        self.restart_subscriber();
        Some(dropped)
    }

    pub(crate) fn report_discarded(&self, dropped: usize, reason: &str) {
        if dropped == 0 || !self.state.is_usable() {
            return;
        }
        self.events.deliver(Event::Error {
            kind: ErrorKind::Io,
            message: format!("{dropped} queued write(s) discarded {reason}"),
        });
    }

    pub(crate) fn restart_subscriber(&self) {
        if !self.listening.load(Ordering::Acquire) {
            return;
        }
        self.subscriber.stop_now();
        if self.state.is_usable() {
            self.subscriber.start(self.subscriber_context());
        }
    }

    fn subscriber_context(&self) -> SubscriberContext<C> {
        SubscriberContext {
            connections: Arc::clone(&self.connections),
            state: Arc::clone(&self.state),
            events: Arc::clone(&self.events),
            channel: self.config.project_id.clone(),
            backoff: self.config.resubscribe_backoff(),
        }
    }
}

impl<C: Connector> Drop for Inner<C> {
    fn drop(&mut self) {
        self.state.request_shutdown();
        self.subscriber.stop_now();
    }
}

/// Reports an operation that was queued but never ran because its worker
/// was replaced. Silent once the client is dead or shut down.
struct ReplyGuard {
    events: Arc<dyn EventSink>,
    state: Arc<ClientState>,
    tag: Option<String>,
}

impl ReplyGuard {
    fn settle(&mut self) {
        self.tag = None;
    }
}

impl Drop for ReplyGuard {
    fn drop(&mut self) {
        let Some(tag) = self.tag.take() else {
            return;
        };
        if self.state.is_usable() {
            let mut err = Error::new(ErrorKind::Io)
                .with_message("operation abandoned after the connection was reset");
            if !tag.is_empty() {
                err = err.with_tag(tag);
            }
            self.events.deliver(Event::from_error(&err));
        }
    }
}

async fn fetch<C: Connector>(inner: Arc<Inner<C>>, tag: String, default: String) -> ClientResult<Event> {
    let key = inner.key(&tag);
    let stored = {
        let mut conn = inner.connections.acquire().await?;
        conn.get(&key).await?
    };
    let value = decode_value(&stored.unwrap_or(default), &tag)?;
    Ok(Event::GotValue { tag, value })
}

async fn append<C: Connector>(inner: Arc<Inner<C>>, tag: String, item: String) -> ClientResult<Event> {
    {
        let mut conn = inner.connections.acquire().await?;
        scripted::append(&mut *conn, &inner.config.project_id, &tag, &item).await?;
    }
    Ok(Event::UpdateDone {
        tag,
        operation: Operation::AppendValueToList,
    })
}

async fn remove_first<C: Connector>(inner: Arc<Inner<C>>, tag: String) -> ClientResult<Event> {
    let removed = {
        let mut conn = inner.connections.acquire().await?;
        scripted::pop_front(&mut *conn, &inner.config.project_id, &tag).await?
    };
    let value = decode_value(&removed, &tag)?;
    Ok(Event::FirstRemoved { tag, value })
}

async fn clear<C: Connector>(inner: Arc<Inner<C>>, tag: String) -> ClientResult<Event> {
    let key = inner.key(&tag);
    {
        let mut conn = inner.connections.acquire().await?;
        conn.del(&key).await?;
    }
    Ok(Event::UpdateDone {
        tag,
        operation: Operation::ClearTag,
    })
}

async fn list_tags<C: Connector>(inner: Arc<Inner<C>>) -> ClientResult<Event> {
    let prefix = inner.key("");
    let keys = {
        let mut conn = inner.connections.acquire().await?;
        conn.keys(&format!("{prefix}*")).await?
    };
    let mut tags: Vec<String> = keys
        .iter()
        .filter_map(|key| key.strip_prefix(prefix.as_str()))
        .map(str::to_string)
        .collect();
    tags.sort();
    Ok(Event::TagList { tags })
}

fn decode_value(encoded: &str, tag: &str) -> ClientResult<Value> {
    serde_json::from_str(encoded).map_err(|err| {
        Error::new(ErrorKind::Decode)
            .with_message(format!("stored value is not JSON: {err}"))
            .with_tag(tag)
    })
}

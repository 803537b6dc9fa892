//! Purpose: In-process store with the same contract as the network store.
//! Exports: `MemoryStore`, `MemoryConnector`, `MemoryConnection`, `MemorySubscription`, `ScriptCall`.
//! Role: Backs tests and embedders; emulates the three scripts, pub/sub, and auth.
//! Invariants: Scripts run only by digest once registered through `eval` (NOSCRIPT otherwise).
//! Invariants: Each script body runs under one lock, matching server-side atomicity.
//! Notes: Fault injection counters let tests fail the next N connects, evals, or subscribes.
use super::{Connector, Endpoint, StoreConnection, Subscription};
use crate::core::error::{ClientResult, Error, ErrorKind};
use crate::core::resp::RespValue;
use crate::core::scripts::{self, APPEND, POP_FRONT, SET_AND_PUBLISH};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 1024;

/// One executed script invocation, as seen by the store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptCall {
    pub script: &'static str,
    pub keys: Vec<String>,
    pub args: Vec<String>,
}

#[derive(Clone, Debug)]
enum Broadcast {
    Message { channel: String, payload: String },
    Reset,
}

#[derive(Default)]
struct StoreData {
    values: HashMap<String, String>,
    scripts: HashSet<String>,
    calls: Vec<ScriptCall>,
}

pub struct MemoryStore {
    data: Mutex<StoreData>,
    published: broadcast::Sender<Broadcast>,
    token: Option<String>,
    connect_failures: AtomicUsize,
    eval_failures: AtomicUsize,
    subscribe_failures: AtomicUsize,
    connects: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// A store that only accepts connections authenticating with `token`.
    pub fn with_token(token: impl Into<String>) -> Arc<Self> {
        Self::build(Some(token.into()))
    }

    fn build(token: Option<String>) -> Arc<Self> {
        let (published, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            data: Mutex::new(StoreData::default()),
            published,
            token,
            connect_failures: AtomicUsize::new(0),
            eval_failures: AtomicUsize::new(0),
            subscribe_failures: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn connector(self: &Arc<Self>) -> MemoryConnector {
        MemoryConnector {
            store: Arc::clone(self),
        }
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_evals(&self, count: usize) {
        self.eval_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_subscribes(&self, count: usize) {
        self.subscribe_failures.store(count, Ordering::SeqCst);
    }

    /// Drop every live subscription, as a server restart would.
    pub fn disconnect_subscribers(&self) {
        let _ = self.published.send(Broadcast::Reset);
    }

    /// Publish a raw payload on `channel`.
    pub fn publish(&self, channel: &str, payload: impl Into<String>) -> usize {
        self.published
            .send(Broadcast::Message {
                channel: channel.to_string(),
                payload: payload.into(),
            })
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.published.receiver_count()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().values.get(key).cloned()
    }

    pub fn set_value(&self, key: &str, value: impl Into<String>) {
        self.lock().values.insert(key.to_string(), value.into());
    }

    pub fn script_calls(&self) -> Vec<ScriptCall> {
        self.lock().calls.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Highest number of data operations observed running at once.
    pub fn max_concurrent_operations(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn enter(&self) -> OperationGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        OperationGuard { store: self }
    }

    fn run_script(&self, digest: &str, keys: &[&str], args: &[&str]) -> ClientResult<RespValue> {
        if Self::take_fault(&self.eval_failures) {
            return Err(server_error("ERR injected fault"));
        }
        let mut data = self.lock();
        if !data.scripts.contains(digest) {
            return Err(server_error("NOSCRIPT No matching script. Please use EVAL."));
        }
        let script = if digest == SET_AND_PUBLISH.digest() {
            SET_AND_PUBLISH.name()
        } else if digest == APPEND.digest() {
            APPEND.name()
        } else if digest == POP_FRONT.digest() {
            POP_FRONT.name()
        } else {
            return Err(server_error("ERR unsupported script"));
        };
        data.calls.push(ScriptCall {
            script,
            keys: keys.iter().map(|key| key.to_string()).collect(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        });

        let (tag, project) = match script {
            "set_and_publish" => (arg(keys, 0)?, arg(args, 2)?),
            "append" => (arg(keys, 0)?, arg(args, 1)?),
            _ => (arg(keys, 0)?, arg(args, 0)?),
        };
        let key = format!("{project}:{tag}");

        let (reply, published) = match script {
            "set_and_publish" => {
                let batch: Value = decode(arg(args, 1)?)?;
                data.values.insert(key, arg(args, 0)?.to_string());
                (RespValue::SimpleString("OK".to_string()), json!([tag, batch]))
            }
            "append" => {
                let item: Value = decode(arg(args, 0)?)?;
                let mut list = match data.values.get(&key) {
                    None => Vec::new(),
                    Some(current) => match decode(current)? {
                        Value::Array(list) => list,
                        _ => return Err(server_error("You can only append to a list")),
                    },
                };
                list.push(item);
                let encoded = Value::Array(list).to_string();
                data.values.insert(key, encoded.clone());
                (RespValue::bulk(&encoded), json!([tag, [encoded]]))
            }
            _ => {
                let mut list = match data.values.get(&key).map(|current| decode(current)) {
                    Some(Ok(Value::Array(list))) => list,
                    Some(Err(err)) => return Err(err),
                    _ => return Err(server_error("You can only remove elements from a list")),
                };
                let removed = if list.is_empty() {
                    Value::Null
                } else {
                    list.remove(0)
                };
                let encoded = Value::Array(list).to_string();
                data.values.insert(key, encoded.clone());
                (RespValue::bulk(removed.to_string()), json!([tag, [encoded]]))
            }
        };
        drop(data);
        self.publish(project, published.to_string());
        Ok(reply)
    }
}

struct OperationGuard<'a> {
    store: &'a MemoryStore,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.store.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
}

impl MemoryConnector {
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

impl Connector for MemoryConnector {
    type Conn = MemoryConnection;

    async fn connect(&self, endpoint: &Endpoint) -> ClientResult<MemoryConnection> {
        self.store.connects.fetch_add(1, Ordering::SeqCst);
        if MemoryStore::take_fault(&self.store.connect_failures) {
            return Err(Error::new(ErrorKind::Io)
                .with_message(format!("failed to connect to {endpoint}: injected fault")));
        }
        Ok(MemoryConnection {
            store: Arc::clone(&self.store),
            authenticated: self.store.token.is_none(),
        })
    }
}

pub struct MemoryConnection {
    store: Arc<MemoryStore>,
    authenticated: bool,
}

impl MemoryConnection {
    fn ensure_authenticated(&self) -> ClientResult<()> {
        if self.authenticated {
            Ok(())
        } else {
            Err(server_error("NOAUTH Authentication required."))
        }
    }

    async fn operation<T>(&self, run: impl FnOnce(&MemoryStore) -> ClientResult<T>) -> ClientResult<T> {
        self.ensure_authenticated()?;
        let _guard = self.store.enter();
        tokio::task::yield_now().await;
        run(&self.store)
    }
}

impl StoreConnection for MemoryConnection {
    type Subscription = MemorySubscription;

    async fn auth(&mut self, token: &str) -> ClientResult<()> {
        match &self.store.token {
            Some(expected) if expected != token => Err(Error::new(ErrorKind::Auth)
                .with_message("WRONGPASS invalid username-password pair")),
            _ => {
                self.authenticated = true;
                Ok(())
            }
        }
    }

    async fn eval_sha(
        &mut self,
        digest: &str,
        keys: &[&str],
        args: &[&str],
    ) -> ClientResult<RespValue> {
        self.operation(|store| store.run_script(digest, keys, args))
            .await
    }

    async fn eval(&mut self, source: &str, keys: &[&str], args: &[&str]) -> ClientResult<RespValue> {
        let digest = scripts::digest_of(source);
        self.store.lock().scripts.insert(digest.clone());
        self.operation(|store| store.run_script(&digest, keys, args))
            .await
    }

    async fn get(&mut self, key: &str) -> ClientResult<Option<String>> {
        self.operation(|store| Ok(store.lock().values.get(key).cloned()))
            .await
    }

    async fn del(&mut self, key: &str) -> ClientResult<i64> {
        self.operation(|store| Ok(i64::from(store.lock().values.remove(key).is_some())))
            .await
    }

    async fn keys(&mut self, pattern: &str) -> ClientResult<Vec<String>> {
        self.operation(|store| {
            let data = store.lock();
            let mut keys: Vec<String> = match pattern.strip_suffix('*') {
                Some(prefix) => data
                    .values
                    .keys()
                    .filter(|key| key.starts_with(prefix))
                    .cloned()
                    .collect(),
                None => data.values.keys().filter(|key| *key == pattern).cloned().collect(),
            };
            keys.sort();
            Ok(keys)
        })
        .await
    }

    async fn subscribe(self, channel: &str) -> ClientResult<MemorySubscription> {
        self.ensure_authenticated()?;
        if MemoryStore::take_fault(&self.store.subscribe_failures) {
            return Err(Error::new(ErrorKind::Io).with_message("subscribe failed: injected fault"));
        }
        Ok(MemorySubscription {
            rx: self.store.published.subscribe(),
            channel: channel.to_string(),
        })
    }

    async fn close(self) {}
}

pub struct MemorySubscription {
    rx: broadcast::Receiver<Broadcast>,
    channel: String,
}

impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> ClientResult<Option<String>> {
        loop {
            match self.rx.recv().await {
                Ok(Broadcast::Message { channel, payload }) if channel == self.channel => {
                    return Ok(Some(payload));
                }
                Ok(Broadcast::Message { .. }) => continue,
                Ok(Broadcast::Reset) => {
                    return Err(Error::new(ErrorKind::Io).with_message("connection reset by server"));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(Error::new(ErrorKind::Io)
                        .with_message(format!("subscriber lagged by {skipped} messages")));
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

fn server_error(message: &str) -> Error {
    Error::new(ErrorKind::Protocol).with_message(message)
}

fn arg<'a>(values: &[&'a str], index: usize) -> ClientResult<&'a str> {
    values
        .get(index)
        .copied()
        .ok_or_else(|| server_error("ERR wrong number of arguments for script"))
}

fn decode(text: &str) -> ClientResult<Value> {
    serde_json::from_str(text)
        .map_err(|err| server_error(&format!("ERR Error running script: cjson decode failed: {err}")))
}

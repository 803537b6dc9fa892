//! Purpose: Define the seam between the client and a concrete store connection.
//! Exports: `Endpoint`, `Connector`, `StoreConnection`, `Subscription`, implementations.
//! Role: Lets the client run against the network store or an in-process fake.
//! Invariants: A `StoreConnection` is used by one operation at a time (`&mut self`).
//! Invariants: Server error replies surface as `Err`, never as `Ok` values.

pub mod memory;
pub mod redis;
pub mod tls;

use crate::core::error::ClientResult;
use crate::core::resp::RespValue;
use std::fmt;
use std::future::Future;

pub use memory::{MemoryConnector, MemoryStore, ScriptCall};
pub use redis::{RedisConnection, RedisConnector, RedisSubscription};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "rediss" } else { "redis" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

pub trait Connector: Send + Sync + 'static {
    type Conn: StoreConnection;

    fn connect(&self, endpoint: &Endpoint) -> impl Future<Output = ClientResult<Self::Conn>> + Send;
}

pub trait StoreConnection: Send + 'static {
    type Subscription: Subscription;

    fn auth(&mut self, token: &str) -> impl Future<Output = ClientResult<()>> + Send;

    fn eval_sha(
        &mut self,
        digest: &str,
        keys: &[&str],
        args: &[&str],
    ) -> impl Future<Output = ClientResult<RespValue>> + Send;

    fn eval(
        &mut self,
        source: &str,
        keys: &[&str],
        args: &[&str],
    ) -> impl Future<Output = ClientResult<RespValue>> + Send;

    fn get(&mut self, key: &str) -> impl Future<Output = ClientResult<Option<String>>> + Send;

    fn del(&mut self, key: &str) -> impl Future<Output = ClientResult<i64>> + Send;

    fn keys(&mut self, pattern: &str) -> impl Future<Output = ClientResult<Vec<String>>> + Send;

    /// Turn this connection into a subscription on `channel`.
    fn subscribe(
        self,
        channel: &str,
    ) -> impl Future<Output = ClientResult<Self::Subscription>> + Send;

    /// Best-effort close; failures are swallowed.
    fn close(self) -> impl Future<Output = ()> + Send;
}

pub trait Subscription: Send + 'static {
    /// Next published payload, or `None` once the stream has ended.
    fn next_message(&mut self) -> impl Future<Output = ClientResult<Option<String>>> + Send;
}

//! Purpose: Define the public client API for the shared key/value store.
//! Exports: Client, configuration, events, and the building blocks they are made of.
//! Role: Stable boundary for the CLI and embedders; hides wiring between components.
//! Invariants: Application-visible outcomes flow through `Event`s or synchronous `Error`s only.
//! Invariants: Internal modules remain private; only re-exported items are public.

mod client;
mod config;
mod connection;
mod event;
mod executor;
mod pipeline;
mod scripted;
mod subscriber;

pub use crate::core::error::{ClientResult, Error, ErrorKind, to_exit_code};
pub use crate::transport::{Endpoint, MemoryConnector, MemoryStore, RedisConnector, ScriptCall};
pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, DEFAULT_PORT, DEFAULT_RESUBSCRIBE_BACKOFF_MS, DEFAULT_SERVER};
pub use connection::ConnectionManager;
pub use event::{Event, EventSink, Operation};
pub use executor::Executor;
pub use pipeline::{PendingWrite, StoreQueue};
pub use scripted::{append, eval_atomic, pop_front, set_and_publish};
pub use subscriber::{SubscriberState, decode_change};

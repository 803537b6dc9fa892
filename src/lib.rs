//! Purpose: Library crate backing the `clouddb` CLI and embedders.
//! Exports: `api` (client surface), `core` (errors, lifecycle, codec, scripts), `transport`, `event_json`.
//! Role: Resilient client for a shared key/value store with live change notification.
//! Invariants: `api` is the supported surface; `core` and `transport` are building blocks.
//! Invariants: Background work never touches application state except through events.
pub mod api;
pub mod core;
pub mod event_json;
pub mod transport;

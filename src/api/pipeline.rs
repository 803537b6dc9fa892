//! Purpose: Coalesce bursts of store calls into as few scripted writes as possible.
//! Exports: `StoreQueue`, `PendingWrite`, `drain`.
//! Role: Write-Coalescing Pipeline; one drain worker per non-empty queue.
//! Invariants: Items leave the queue in FIFO order; a tag change always flushes first.
//! Invariants: A drain is started only on the empty-to-busy transition (one worker at most).
//! Invariants: Each flush produces exactly one completion or one error event.
//! Notes: After a failed flush every still-queued item is discarded, whatever its tag.
use super::client::Inner;
use super::event::{Event, Operation};
use super::scripted;
use crate::core::error::{ClientResult, Error, ErrorKind};
use crate::transport::Connector;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingWrite {
    pub tag: String,
    pub values: Vec<String>,
}

impl PendingWrite {
    fn new(tag: String, value: String) -> Self {
        Self {
            tag,
            values: vec![value],
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Next {
    Item { tag: String, value: String },
    /// Queue drained; the worker marker has been released.
    Empty,
    /// The queue now belongs to another worker generation.
    Superseded,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<(String, String)>,
    worker: Option<u64>,
}

#[derive(Default)]
pub struct StoreQueue {
    state: Mutex<QueueState>,
}

impl StoreQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item. When no worker owns the queue, `start` is called
    /// (under the queue lock) and returns the generation of the new worker.
    pub fn push(&self, tag: String, value: String, start: impl FnOnce() -> Option<u64>) -> bool {
        let mut state = self.lock();
        state.items.push_back((tag, value));
        if state.worker.is_some() {
            return false;
        }
        state.worker = start();
        state.worker.is_some()
    }

    pub(crate) fn pop(&self, generation: u64) -> Next {
        let mut state = self.lock();
        if state.worker != Some(generation) {
            return Next::Superseded;
        }
        match state.items.pop_front() {
            Some((tag, value)) => Next::Item { tag, value },
            None => {
                state.worker = None;
                Next::Empty
            }
        }
    }

    /// Discard queued items for a failing worker and release its marker.
    pub(crate) fn abort(&self, generation: u64) -> usize {
        let mut state = self.lock();
        let dropped = state.items.len();
        state.items.clear();
        if state.worker == Some(generation) {
            state.worker = None;
        }
        dropped
    }

    /// Discard everything and release whichever worker owned the queue.
    pub(crate) fn detach(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.items.len();
        state.items.clear();
        state.worker = None;
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_worker(&self) -> bool {
        self.lock().worker.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Worker body: runs on the executor under `generation`.
pub(crate) async fn drain<C: Connector>(inner: Arc<Inner<C>>, generation: u64) {
    let mut pending: Option<PendingWrite> = None;
    loop {
        match inner.queue.pop(generation) {
            Next::Item { tag, value } => match pending.as_mut() {
                Some(write) if write.tag == tag => write.values.push(value),
                _ => {
                    let next = PendingWrite::new(tag, value);
                    if let Some(previous) = pending.replace(next) {
                        if let Err(err) = flush(&inner, previous).await {
                            let in_hand = pending.take().map_or(0, |write| write.values.len());
                            fail(&inner, generation, err, in_hand).await;
                            return;
                        }
                    }
                }
            },
            Next::Empty => {
                if let Some(write) = pending.take() {
                    if let Err(err) = flush(&inner, write).await {
                        fail(&inner, generation, err, 0).await;
                    }
                }
                return;
            }
            Next::Superseded => {
                if let Some(write) = pending.take() {
                    warn!(tag = %write.tag, values = write.values.len(), "pending write abandoned by replaced worker");
                    inner.report(
                        &Error::new(ErrorKind::Io)
                            .with_message("write abandoned after the connection was reset")
                            .with_tag(write.tag),
                    );
                }
                return;
            }
        }
    }
}

async fn flush<C: Connector>(inner: &Inner<C>, write: PendingWrite) -> ClientResult<()> {
    if !inner.state.is_usable() {
        return Err(inner.unusable_error().with_tag(write.tag));
    }
    {
        let mut conn = inner.connections.acquire().await?;
        scripted::set_and_publish(&mut *conn, &inner.config.project_id, &write.tag, &write.values)
            .await?;
    }
    debug!(tag = %write.tag, values = write.values.len(), "flushed coalesced write");
    inner.events.deliver(Event::UpdateDone {
        tag: write.tag,
        operation: Operation::StoreValue,
    });
    Ok(())
}

/// The worker is replaced before anything is reported, so a store issued in
/// reaction to the error event lands on the fresh worker.
async fn fail<C: Connector>(inner: &Arc<Inner<C>>, generation: u64, err: Error, in_hand: usize) {
    let aborted = in_hand + inner.queue.abort(generation);
    let dropped = aborted + inner.invalidate(generation).await.unwrap_or(0);
    inner.report(&err);
    if dropped > 0 {
        warn!(dropped, "discarding queued writes after failed flush");
        inner.events.deliver(Event::Error {
            kind: err.kind(),
            message: format!("{dropped} queued write(s) discarded after a failed write"),
        });
    }
}

//! Purpose: Own the single shared store connection and its replacement on faults.
//! Exports: `ConnectionManager`.
//! Role: Pool-of-one offering `acquire`, `invalidate_if`, and `is_healthy`.
//! Invariants: The shared connection is lent to one holder at a time (tokio mutex).
//! Invariants: No connection is opened once the client is dead or shut down.
//! Invariants: Every opened connection is authenticated before it is handed out.
use super::event::{Event, EventSink};
use crate::core::error::{ClientResult, Error, ErrorKind};
use crate::core::lifecycle::ClientState;
use crate::transport::{Connector, Endpoint, StoreConnection};
use std::sync::{Arc, RwLock};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, error};

pub struct ConnectionManager<C: Connector> {
    connector: C,
    endpoint: RwLock<Endpoint>,
    token: String,
    slot: Mutex<Option<C::Conn>>,
    state: Arc<ClientState>,
    events: Arc<dyn EventSink>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        connector: C,
        endpoint: Endpoint,
        token: impl Into<String>,
        state: Arc<ClientState>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            connector,
            endpoint: RwLock::new(endpoint),
            token: token.into(),
            slot: Mutex::new(None),
            state,
            events,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    /// Repoint future connections. The current one stays until invalidated.
    pub fn set_endpoint(&self, endpoint: Endpoint) {
        *self
            .endpoint
            .write()
            .unwrap_or_else(|poison| poison.into_inner()) = endpoint;
    }

    /// Borrow the shared connection, opening it first if there is none.
    pub async fn acquire(&self) -> ClientResult<MappedMutexGuard<'_, C::Conn>> {
        let mut slot = self.slot.lock().await;
        if slot.is_none() {
            *slot = Some(self.open().await?);
        }
        MutexGuard::try_map(slot, Option::as_mut).map_err(|_| {
            Error::new(ErrorKind::Internal).with_message("connection slot emptied while held")
        })
    }

    /// A dedicated connection for a subscription; never shared.
    pub async fn acquire_for_subscription(&self) -> ClientResult<C::Conn> {
        self.open().await
    }

    /// Close and discard the shared connection if `decide` agrees, deciding
    /// while the slot is locked so no operation can pick the old connection up.
    pub async fn invalidate_if(&self, decide: impl FnOnce() -> bool) -> bool {
        let stale = {
            let mut slot = self.slot.lock().await;
            if !decide() {
                return false;
            }
            slot.take()
        };
        if let Some(conn) = stale {
            debug!("closing invalidated connection");
            conn.close().await;
        }
        true
    }

    pub async fn invalidate(&self) {
        self.invalidate_if(|| true).await;
    }

    pub async fn is_healthy(&self) -> bool {
        self.state.is_usable() && self.slot.lock().await.is_some()
    }

    async fn open(&self) -> ClientResult<C::Conn> {
        if self.state.is_dead() {
            return Err(dead_error());
        }
        if self.state.is_shutdown() {
            return Err(Error::new(ErrorKind::Shutdown).with_message("client is shut down"));
        }
        let endpoint = self.endpoint();
        let mut conn = self.connector.connect(&endpoint).await?;
        match conn.auth(&self.token).await {
            Ok(()) => {
                debug!(%endpoint, "authenticated");
                Ok(conn)
            }
            Err(err) => {
                conn.close().await;
                if err.kind() == ErrorKind::Auth && self.state.mark_dead() {
                    error!(%endpoint, error = %err, "authentication rejected; client is now unusable");
                    self.events.deliver(Event::from_error(&err));
                }
                Err(err)
            }
        }
    }
}

pub(crate) fn dead_error() -> Error {
    Error::new(ErrorKind::Auth)
        .with_message("client failed authentication and can no longer be used")
        .with_hint("Recreate the client with a valid token.")
}

#[cfg(test)]
mod tests {
    use super::ConnectionManager;
    use crate::api::event::Event;
    use crate::core::error::ErrorKind;
    use crate::core::lifecycle::ClientState;
    use crate::transport::{Endpoint, MemoryStore, StoreConnection};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "memory".to_string(),
            port: 1,
            tls: false,
        }
    }

    #[tokio::test]
    async fn connection_is_created_lazily_and_reused() {
        let store = MemoryStore::new();
        let (tx, _rx) = mpsc::unbounded_channel::<Event>();
        let manager = ConnectionManager::new(
            store.connector(),
            endpoint(),
            "t",
            Arc::new(ClientState::new()),
            Arc::new(tx),
        );
        assert!(!manager.is_healthy().await);
        assert_eq!(store.connect_count(), 0);
        {
            let mut conn = manager.acquire().await.expect("acquire");
            conn.get("p:x").await.expect("get");
        }
        manager.acquire().await.expect("reuse");
        assert_eq!(store.connect_count(), 1);
        assert!(manager.is_healthy().await);

        manager.invalidate().await;
        assert!(!manager.is_healthy().await);
        manager.acquire().await.expect("reopen");
        assert_eq!(store.connect_count(), 2);
    }

    #[tokio::test]
    async fn rejected_token_latches_dead_and_reports_once() {
        let store = MemoryStore::with_token("right");
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let state = Arc::new(ClientState::new());
        let manager = ConnectionManager::new(
            store.connector(),
            endpoint(),
            "wrong",
            Arc::clone(&state),
            Arc::new(tx),
        );
        let err = manager.acquire().await.err().expect("auth fails");
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(state.is_dead());

        let err = manager.acquire().await.err().expect("dead");
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert_eq!(store.connect_count(), 1);

        assert!(matches!(rx.try_recv(), Ok(Event::Error { kind: ErrorKind::Auth, .. })));
        assert!(rx.try_recv().is_err());
    }
}

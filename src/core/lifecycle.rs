//! Purpose: Hold the per-client lifecycle latches (`shutdown`, `dead`).
//! Exports: `ClientState`.
//! Role: Single source of truth for "may this client keep doing background work".
//! Invariants: Both latches only ever move from false to true.
//! Invariants: `dead` implies no new connection and no subscriber restart.
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct ClientState {
    shutdown: AtomicBool,
    dead: AtomicBool,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_usable(&self) -> bool {
        !self.is_shutdown() && !self.is_dead()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Latch `shutdown`. Returns true for the call that flipped it.
    pub fn request_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::AcqRel)
    }

    /// Latch `dead`. Returns true for the call that flipped it, so the
    /// fatal condition is reported exactly once.
    pub fn mark_dead(&self) -> bool {
        !self.dead.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::ClientState;

    #[test]
    fn fresh_state_is_usable() {
        let state = ClientState::new();
        assert!(state.is_usable());
        assert!(!state.is_dead());
        assert!(!state.is_shutdown());
    }

    #[test]
    fn mark_dead_reports_first_transition_only() {
        let state = ClientState::new();
        assert!(state.mark_dead());
        assert!(!state.mark_dead());
        assert!(state.is_dead());
        assert!(!state.is_usable());
        assert!(!state.is_shutdown());
    }

    #[test]
    fn shutdown_latches() {
        let state = ClientState::new();
        assert!(state.request_shutdown());
        assert!(!state.request_shutdown());
        assert!(!state.is_usable());
        assert!(!state.is_dead());
    }
}

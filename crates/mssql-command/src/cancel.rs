//! The cancellation gate.
//!
//! `Cancel` is the one operation callable from any thread at any time. It
//! is a best-effort suggestion: it wakes a pending reconnect wait, sets
//! the pending-cancel flag, and — when a session or reader is live —
//! forwards an attention request. The executing task samples the flag on
//! entry to each execution, immediately before acquiring the session, and
//! again immediately after.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::connection::AttentionHandle;

/// Shared cancellation state of one command.
///
/// The command and any number of cancelling threads share this through an
/// `Arc`; only the executing task clears the pending flag, and only on
/// entry to a new execution.
#[derive(Default)]
pub struct CancelState {
    pending: AtomicBool,
    wakeup: Notify,
    /// Attention handle of the currently bound session.
    ///
    /// The mutex doubles as the lock cancel must hold while reading the
    /// session handle, so a concurrent close cannot race the read.
    session: Mutex<Option<Arc<dyn AttentionHandle>>>,
    /// Attention forwarding for a live reader when no session is bound.
    reader: Mutex<Option<Arc<dyn AttentionHandle>>>,
}

impl CancelState {
    /// Create a fresh cancellation state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a cancel has been requested since the last execution began.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Clear the pending flag; called by the executing task on entry.
    pub fn clear_pending(&self) {
        self.pending.store(false, Ordering::SeqCst);
    }

    /// Request cancellation. Callable from any thread; never fails.
    pub fn cancel(&self) {
        self.pending.store(true, Ordering::SeqCst);
        // Wake a reconnect wait that may be parked on us.
        self.wakeup.notify_waiters();

        let session = self.session.lock().clone();
        if let Some(attention) = session {
            tracing::debug!("cancel: requesting attention on bound session");
            attention.request_attention();
            return;
        }
        let reader = self.reader.lock().clone();
        if let Some(attention) = reader {
            tracing::debug!("cancel: forwarding to live reader");
            attention.request_attention();
        }
    }

    /// Resolve once a cancel is pending.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            // Register interest before re-checking the flag so a cancel
            // landing between the check and the await cannot be lost.
            notified.as_mut().enable();
            if self.is_pending() {
                return;
            }
            notified.await;
        }
    }

    /// Bind the attention handle of a just-acquired session.
    pub fn bind_session(&self, attention: Arc<dyn AttentionHandle>) {
        *self.session.lock() = Some(attention);
    }

    /// Unbind the session on operation completion.
    pub fn unbind_session(&self) {
        *self.session.lock() = None;
    }

    /// Register a live reader to forward cancels to.
    pub fn bind_reader(&self, attention: Arc<dyn AttentionHandle>) {
        *self.reader.lock() = Some(attention);
    }

    /// Drop the reader registration.
    pub fn unbind_reader(&self) {
        *self.reader.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingAttention {
        requests: AtomicUsize,
    }

    impl AttentionHandle for CountingAttention {
        fn request_attention(&self) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_cancel_sets_pending() {
        let state = CancelState::new();
        assert!(!state.is_pending());
        state.cancel();
        assert!(state.is_pending());
        state.clear_pending();
        assert!(!state.is_pending());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let state = CancelState::new();
        state.cancel();
        state.cancel();
        assert!(state.is_pending());
    }

    #[test]
    fn test_cancel_prefers_bound_session() {
        let state = CancelState::new();
        let session = Arc::new(CountingAttention::default());
        let reader = Arc::new(CountingAttention::default());
        state.bind_session(session.clone());
        state.bind_reader(reader.clone());

        state.cancel();
        assert_eq!(session.requests.load(Ordering::SeqCst), 1);
        assert_eq!(reader.requests.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_falls_back_to_reader() {
        let state = CancelState::new();
        let reader = Arc::new(CountingAttention::default());
        state.bind_reader(reader.clone());

        state.cancel();
        assert_eq!(reader.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_cancel() {
        let state = Arc::new(CancelState::new());
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.cancelled().await })
        };
        state.cancel();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_pending() {
        let state = CancelState::new();
        state.cancel();
        // Must not hang.
        state.cancelled().await;
    }
}

//! Scoped guards around session borrowing and the async counter.
//!
//! The connection owns the session; a command borrows it for one operation
//! and must return it on every catchable exit path, including
//! cancellation. [`SessionLease`] makes that structural: dropping the
//! lease returns the session, and only an explicit [`SessionLease::doom`]
//! (a fatal signal) withholds it. [`AsyncCountGuard`] pairs the
//! connection's async-counter increment and decrement the same way.

use std::sync::Arc;

use crate::connection::{Connection, Session};

/// A borrowed session that returns itself to the connection on drop.
pub struct SessionLease {
    session: Option<Box<dyn Session>>,
    connection: Arc<dyn Connection>,
}

impl SessionLease {
    /// Wrap a freshly acquired session.
    #[must_use]
    pub fn new(session: Box<dyn Session>, connection: Arc<dyn Connection>) -> Self {
        Self {
            session: Some(session),
            connection,
        }
    }

    /// Access the borrowed session.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::doom`]; the lease is consumed there,
    /// so this cannot happen in safe call sequences.
    pub fn session(&mut self) -> &mut dyn Session {
        self.session
            .as_mut()
            .map(|s| s.as_mut())
            .unwrap_or_else(|| unreachable!("session lease used after doom"))
    }

    /// The owning connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// A fatal signal: doom the connection and never return the session.
    pub fn doom(mut self) {
        tracing::warn!("dooming connection; session will not be returned");
        self.session = None;
        self.connection.doom();
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.connection.return_session(session);
        }
    }
}

/// Balances the connection's async-operation counter exactly once.
pub struct AsyncCountGuard {
    connection: Arc<dyn Connection>,
}

impl AsyncCountGuard {
    /// Increment the counter; the matching decrement runs on drop.
    #[must_use]
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        connection.increment_async_count();
        Self { connection }
    }
}

impl Drop for AsyncCountGuard {
    fn drop(&mut self) {
        self.connection.decrement_async_count();
    }
}

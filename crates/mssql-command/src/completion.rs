//! Async completion plumbing: the single-assignment completion promise,
//! the command's async slot, and begin/end method pairing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::driver::AttemptContext;
use crate::error::Error;
use crate::session::{AsyncCountGuard, SessionLease};

/// A single-assignment completion promise.
///
/// Once set, every current and future observer is released. Setting twice
/// is rejected rather than overwriting.
pub struct Completion<T> {
    shared: Arc<CompletionShared<T>>,
}

struct CompletionShared<T> {
    value: Mutex<Option<T>>,
    set: AtomicBool,
    notify: Notify,
}

impl<T: Clone> Completion<T> {
    /// Create an unset completion.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(CompletionShared {
                value: Mutex::new(None),
                set: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Assign the value. Returns `false` when already set.
    pub fn try_set(&self, value: T) -> bool {
        if self.shared.set.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.shared.value.lock() = Some(value);
        self.shared.notify.notify_waiters();
        true
    }

    /// Whether the value has been assigned.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.shared.set.load(Ordering::SeqCst)
    }

    /// Wait for the value.
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register interest before re-checking so an assignment that
            // races the check cannot be lost.
            notified.as_mut().enable();
            if self.shared.set.load(Ordering::SeqCst) {
                if let Some(value) = self.shared.value.lock().clone() {
                    return value;
                }
            }
            notified.await;
        }
    }
}

impl<T: Clone> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Which end method pairs with the pending begin method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndMethod {
    /// `end_execute_non_query`.
    NonQuery,
    /// `end_execute_reader`.
    Reader,
    /// `end_execute_scalar`.
    Scalar,
    /// `end_execute_xml_reader`.
    XmlReader,
}

impl EndMethod {
    /// Method name for mismatch diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NonQuery => "end_execute_non_query",
            Self::Reader => "end_execute_reader",
            Self::Scalar => "end_execute_scalar",
            Self::XmlReader => "end_execute_xml_reader",
        }
    }
}

/// Where the begin phase left the execution.
pub(crate) enum SlotState {
    /// The begin phase failed; the end method surfaces the error.
    Failed(Option<Error>),
    /// The write phase completed; the end method pumps the response.
    Written(Box<WrittenState>),
}

/// Everything the end method needs to finish a written execution.
pub(crate) struct WrittenState {
    pub lease: SessionLease,
    /// Held for its drop side effect: the paired async-count decrement.
    pub guard: AsyncCountGuard,
    pub attempt: AttemptContext,
}

/// The command's single async slot: at most one begin/end pair in flight.
pub(crate) struct AsyncSlot {
    pub end_method: EndMethod,
    pub state: SlotState,
    pub completion: Completion<bool>,
    /// Task wiring an external cancellation token to `Command::cancel`.
    pub cancel_task: Option<tokio::task::JoinHandle<()>>,
    /// Connection close count at begin, to detect a close while pending.
    pub close_count_at_begin: u32,
}

impl Drop for AsyncSlot {
    fn drop(&mut self) {
        if let Some(task) = self.cancel_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_set_once() {
        let completion: Completion<i32> = Completion::new();
        assert!(!completion.is_set());
        assert!(completion.try_set(1));
        assert!(!completion.try_set(2));
        assert!(completion.is_set());
    }

    #[tokio::test]
    async fn test_completion_releases_waiters() {
        let completion: Completion<i32> = Completion::new();
        let observer = completion.clone();
        let waiter = tokio::spawn(async move { observer.wait().await });
        completion.try_set(7);
        assert_eq!(waiter.await.unwrap(), 7);
        // Late observers see the value immediately.
        assert_eq!(completion.wait().await, 7);
    }

    #[test]
    fn test_end_method_names() {
        assert_eq!(EndMethod::NonQuery.name(), "end_execute_non_query");
        assert_eq!(EndMethod::XmlReader.name(), "end_execute_xml_reader");
    }
}

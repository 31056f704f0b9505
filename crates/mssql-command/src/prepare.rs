//! The prepare/execute state machine.
//!
//! A command that prepares moves through
//! `Unprepared -> PreparePending -> Prepared{handle}`. Mutations that make
//! the prepared plan stale push it back to `PreparePending`; the handle is
//! preserved across that transition so the next prepare-execute can reuse
//! it — unless the connection's close or reconnect counter has advanced,
//! which invalidates server-side handles wholesale.

/// Prepared-plan state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareState {
    /// No plan; parameterized text executes through `sp_executesql`.
    Unprepared,
    /// A prepare was requested; the next execution sends `sp_prepexec`.
    PreparePending {
        /// A prior handle the prepare-execute may reuse, when still valid.
        reusable_handle: Option<i32>,
    },
    /// A server-side plan exists.
    Prepared {
        /// The server-assigned plan handle.
        handle: i32,
        /// Connection close count when the handle was issued.
        close_count: u32,
        /// Connection reconnect count when the handle was issued.
        reconnect_count: u32,
    },
}

impl PrepareState {
    /// Whether a plan handle is live.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        matches!(self, Self::Prepared { .. })
    }

    /// The live handle, when prepared.
    #[must_use]
    pub fn handle(&self) -> Option<i32> {
        match self {
            Self::Prepared { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    /// Whether a handle issued at `(close_count, reconnect_count)` is still
    /// valid on a connection showing the given current counters.
    fn handle_survives(
        close_count: u32,
        reconnect_count: u32,
        current_close: u32,
        current_reconnect: u32,
    ) -> bool {
        close_count == current_close && reconnect_count == current_reconnect
    }

    /// React to a prepare request.
    ///
    /// Returns `true` when the request changed the state; a no-op prepare
    /// (already pending, or already prepared and clean) returns `false`.
    pub fn request_prepare(&mut self) -> bool {
        match *self {
            Self::Unprepared => {
                *self = Self::PreparePending {
                    reusable_handle: None,
                };
                true
            }
            Self::PreparePending { .. } | Self::Prepared { .. } => false,
        }
    }

    /// A mutation made the prepared plan stale.
    ///
    /// Prepared demotes to pending, keeping the handle for reuse when the
    /// connection counters have not advanced.
    pub fn invalidate(&mut self, current_close: u32, current_reconnect: u32) {
        if let Self::Prepared {
            handle,
            close_count,
            reconnect_count,
        } = *self
        {
            let reusable_handle =
                Self::handle_survives(close_count, reconnect_count, current_close, current_reconnect)
                    .then_some(handle);
            *self = Self::PreparePending { reusable_handle };
        }
    }

    /// An explicit unprepare: same demotion as [`Self::invalidate`], but
    /// from any state.
    pub fn unprepare(&mut self, current_close: u32, current_reconnect: u32) {
        match *self {
            Self::Prepared { .. } => self.invalidate(current_close, current_reconnect),
            Self::Unprepared => {
                *self = Self::PreparePending {
                    reusable_handle: None,
                };
            }
            Self::PreparePending { .. } => {}
        }
    }

    /// The connection was replaced: any handle is gone.
    pub fn reset(&mut self) {
        *self = Self::Unprepared;
    }

    /// The prepare-execute round trip returned a handle.
    pub fn promote(&mut self, handle: i32, close_count: u32, reconnect_count: u32) {
        *self = Self::Prepared {
            handle,
            close_count,
            reconnect_count,
        };
    }

    /// The handle to put in an `sp_prepexec`, when one can be reused.
    #[must_use]
    pub fn reusable_handle(&self, current_close: u32, current_reconnect: u32) -> Option<i32> {
        match *self {
            Self::PreparePending { reusable_handle } => reusable_handle,
            Self::Prepared {
                handle,
                close_count,
                reconnect_count,
            } => Self::handle_survives(
                close_count,
                reconnect_count,
                current_close,
                current_reconnect,
            )
            .then_some(handle),
            Self::Unprepared => None,
        }
    }
}

impl Default for PrepareState {
    fn default() -> Self {
        Self::Unprepared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_prepare_from_unprepared() {
        let mut state = PrepareState::Unprepared;
        assert!(state.request_prepare());
        assert_eq!(
            state,
            PrepareState::PreparePending {
                reusable_handle: None
            }
        );
    }

    #[test]
    fn test_request_prepare_idempotent() {
        let mut state = PrepareState::PreparePending {
            reusable_handle: None,
        };
        assert!(!state.request_prepare());

        let mut state = PrepareState::Prepared {
            handle: 7,
            close_count: 0,
            reconnect_count: 0,
        };
        assert!(!state.request_prepare());
        assert!(state.is_prepared());
    }

    #[test]
    fn test_promote() {
        let mut state = PrepareState::PreparePending {
            reusable_handle: None,
        };
        state.promote(42, 3, 1);
        assert_eq!(state.handle(), Some(42));
    }

    #[test]
    fn test_invalidate_preserves_handle_when_counters_match() {
        let mut state = PrepareState::Prepared {
            handle: 42,
            close_count: 3,
            reconnect_count: 1,
        };
        state.invalidate(3, 1);
        assert_eq!(
            state,
            PrepareState::PreparePending {
                reusable_handle: Some(42)
            }
        );
    }

    #[test]
    fn test_invalidate_drops_handle_when_close_count_advanced() {
        let mut state = PrepareState::Prepared {
            handle: 42,
            close_count: 3,
            reconnect_count: 1,
        };
        state.invalidate(4, 1);
        assert_eq!(
            state,
            PrepareState::PreparePending {
                reusable_handle: None
            }
        );
    }

    #[test]
    fn test_invalidate_drops_handle_when_reconnect_count_advanced() {
        let mut state = PrepareState::Prepared {
            handle: 42,
            close_count: 3,
            reconnect_count: 1,
        };
        state.invalidate(3, 2);
        assert_eq!(
            state,
            PrepareState::PreparePending {
                reusable_handle: None
            }
        );
    }

    #[test]
    fn test_reusable_handle_from_prepared() {
        let state = PrepareState::Prepared {
            handle: 9,
            close_count: 0,
            reconnect_count: 0,
        };
        assert_eq!(state.reusable_handle(0, 0), Some(9));
        assert_eq!(state.reusable_handle(1, 0), None);
    }

    #[test]
    fn test_unprepare_from_unprepared_goes_pending() {
        let mut state = PrepareState::Unprepared;
        state.unprepare(0, 0);
        assert_eq!(
            state,
            PrepareState::PreparePending {
                reusable_handle: None
            }
        );
    }

    #[test]
    fn test_reset_forgets_everything() {
        let mut state = PrepareState::Prepared {
            handle: 1,
            close_count: 0,
            reconnect_count: 0,
        };
        state.reset();
        assert_eq!(state, PrepareState::Unprepared);
    }
}

//! The installed reader over one execution's response stream.
//!
//! `execute_reader` (and `end_execute_reader`) hand the session lease to a
//! [`CommandReader`], which pumps rows on demand. The borrow on the
//! command keeps every other mutation out until the reader is gone; output
//! parameters and the rows-affected count settle when the stream drains on
//! [`CommandReader::close`], which also issues the reset batch when a
//! schema-only/key-info preamble was sent.

use tds_rpc::{MetaColumn, WireValue};

use crate::command::Command;
use crate::driver::{with_deadline, AttemptContext, PumpState};
use crate::error::Result;
use crate::session::{AsyncCountGuard, SessionLease};

/// A streaming reader over the result sets of one execution.
pub struct CommandReader<'a> {
    command: &'a mut Command,
    lease: Option<SessionLease>,
    ctx: AttemptContext,
    state: PumpState,
    /// Balances the connection async counter for begin/end executions.
    guard: Option<AsyncCountGuard>,
    stream_ended: bool,
}

impl<'a> CommandReader<'a> {
    pub(crate) fn install(
        command: &'a mut Command,
        lease: SessionLease,
        ctx: AttemptContext,
    ) -> Self {
        Self::install_with_guard(command, lease, ctx, None)
    }

    pub(crate) fn install_with_guard(
        command: &'a mut Command,
        mut lease: SessionLease,
        ctx: AttemptContext,
        guard: Option<AsyncCountGuard>,
    ) -> Self {
        // Cancels arriving while the reader pumps forward to the session.
        command.cancel.bind_reader(lease.session().attention());
        let state = PumpState::new(ctx.shape);
        Self {
            command,
            lease: Some(lease),
            ctx,
            state,
            guard,
            stream_ended: false,
        }
    }

    /// Column metadata of the current result set; empty until the first
    /// metadata token arrives.
    #[must_use]
    pub fn columns(&self) -> &[MetaColumn] {
        &self.state.columns
    }

    /// The command's cancellation state, cloneable into other tasks.
    #[must_use]
    pub fn cancel_source(&self) -> std::sync::Arc<crate::cancel::CancelState> {
        std::sync::Arc::clone(&self.command.cancel)
    }

    /// Index of the current result set, 1-based; `0` before the first.
    #[must_use]
    pub fn result_index(&self) -> usize {
        self.state.result_index
    }

    /// Pump until the next row, across result sets.
    ///
    /// Returns `None` once the response stream is exhausted.
    pub async fn next_row(&mut self) -> Result<Option<Vec<WireValue>>> {
        if self.stream_ended {
            return Ok(None);
        }
        let Some(lease) = self.lease.as_mut() else {
            return Ok(None);
        };
        loop {
            let event =
                with_deadline(self.ctx.deadline, lease.session().next_event()).await??;
            let Some(event) = event else {
                self.stream_ended = true;
                return Ok(None);
            };
            if let Some(row) = self
                .command
                .absorb_event(&mut self.state, &self.ctx, event)?
            {
                return Ok(Some(row));
            }
        }
    }

    /// Drain the stream, settle output parameters and diagnostics, issue
    /// the pending reset batch, and return the session.
    ///
    /// Returns the cumulative rows-affected count.
    pub async fn close(mut self) -> Result<u64> {
        let drain = self.drain().await;
        self.command.cancel.unbind_reader();
        self.command.cancel.unbind_session();

        let lease = self.lease.take();
        let guard = self.guard.take();
        let result = match drain {
            Ok(()) => {
                let mut lease = lease;
                if let (Some(lease), Some(reset)) =
                    (lease.as_mut(), self.ctx.reset_batch.clone())
                {
                    with_deadline(self.ctx.deadline, lease.session().write_batch(&reset, None))
                        .await??;
                }
                drop(lease);
                let state = std::mem::replace(&mut self.state, PumpState::new(self.ctx.shape));
                self.command
                    .conclude(state, Vec::new())
                    .map(|pump| pump.rows_affected)
            }
            Err(e) => {
                if let Some(lease) = lease {
                    if !e.is_catchable() {
                        lease.doom();
                    }
                }
                Err(e)
            }
        };
        drop(guard);
        result
    }

    async fn drain(&mut self) -> Result<()> {
        while !self.stream_ended {
            if self.next_row().await?.is_none() {
                break;
            }
        }
        Ok(())
    }
}

impl Drop for CommandReader<'_> {
    fn drop(&mut self) {
        // An abandoned reader still unbinds cancellation and returns the
        // session through the lease; the stream is simply not drained.
        self.command.cancel.unbind_reader();
        self.command.cancel.unbind_session();
    }
}

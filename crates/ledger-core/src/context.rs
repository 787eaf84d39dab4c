//! Cancellation and deadline signal passed to every store call.

use std::panic::{RefUnwindSafe, UnwindSafe};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::errors::LedgerError;

/// Cancellation token plus an optional deadline.
///
/// Cloning shares the token: cancelling any clone cancels all of them.
/// Use [`Context::child`] for a context that can be cancelled on its own.
#[derive(Clone, Debug, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

// Polled from SQLite's progress handler, which requires unwind safety.
// The token and the deadline hold no state a panic could leave half-updated.
impl UnwindSafe for Context {}
impl RefUnwindSafe for Context {}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Wrap an existing token, e.g. one cancelled by a signal handler.
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Derive a context whose deadline is `timeout` from now (or the
    /// current deadline, if that is earlier).
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with the given deadline, keeping an earlier one.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    /// A context cancelled when this one is, but cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` means no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.is_expired()
    }

    /// The error an operation named `op` should fail with, if any.
    /// Cancellation wins over an expired deadline.
    pub fn err(&self, op: &'static str) -> Option<LedgerError> {
        if self.is_cancelled() {
            Some(LedgerError::Cancelled { op })
        } else if self.is_expired() {
            Some(LedgerError::DeadlineExceeded { op })
        } else {
            None
        }
    }

    pub fn check(&self, op: &'static str) -> Result<(), LedgerError> {
        match self.err(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Cap `limit` by the time left before the deadline.
    pub fn bound(&self, limit: Duration) -> Duration {
        match self.remaining() {
            Some(left) => left.min(limit),
            None => limit,
        }
    }
}

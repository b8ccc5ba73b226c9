//! Cancellation context threaded through storage and evaluation calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Why a context stopped accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// [`Context::cancel`] was called on this context or a clone.
    #[error("context cancelled")]
    Cancelled,

    /// The deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Ambient call context carrying a cancel flag and an optional deadline.
///
/// Clones share the cancel flag, so cancelling any clone cancels all of them.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context that expires after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with the earlier of the existing and given deadline.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and every clone of it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Deadline, if one was set.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `Some` once the context is cancelled or past its deadline.
    #[must_use]
    pub fn err(&self) -> Option<ContextError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }
}

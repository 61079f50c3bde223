use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a [`Context`] stopped admitting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation and deadline carried through every database and broker call.
///
/// Cloning a context shares its cancellation token, so cancelling any clone
/// cancels them all.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline of its own.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Wrap an existing token, e.g. a request-scoped one.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails once the context has been cancelled or its deadline has passed.
    pub fn check(&self) -> Result<(), ContextError> {
        if self.token.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ContextError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_context_admits_work() {
        assert_eq!(Context::background().check(), Ok(()));
        assert!(Context::background().remaining().is_none());
    }

    #[test]
    fn cancelled_clone_cancels_original() {
        let ctx = Context::background();
        let clone = ctx.clone();
        clone.cancel();
        assert_eq!(ctx.check(), Err(ContextError::Cancelled));
    }

    #[test]
    fn expired_deadline_is_distinct_from_cancellation() {
        let ctx = Context::with_timeout(Duration::ZERO);
        assert_eq!(ctx.check(), Err(ContextError::DeadlineExceeded));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn cancellation_wins_over_deadline() {
        let ctx = Context::with_timeout(Duration::ZERO);
        ctx.cancel();
        assert_eq!(ctx.check(), Err(ContextError::Cancelled));
    }

    #[test]
    fn wrapped_token_is_shared() {
        let token = CancellationToken::new();
        let ctx = Context::with_cancellation(token.clone());
        token.cancel();
        assert_eq!(ctx.check(), Err(ContextError::Cancelled));
    }
}

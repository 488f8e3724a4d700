//! Hook context
//!
//! Every start and stop action receives a [`HookContext`]: a cancellation token
//! paired with an optional deadline. Well-behaved hooks select on
//! [`HookContext::done`] so they return promptly when the app is stopping or a
//! timeout expires.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context is no longer usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The context (or one of its parents) was cancelled
    #[error("context canceled")]
    Canceled,

    /// The context deadline has passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation and deadline handed to lifecycle actions
///
/// Contexts form a tree: [`child`](Self::child), [`with_timeout`](Self::with_timeout)
/// and [`with_deadline`](Self::with_deadline) derive a context that is cancelled
/// together with its parent and never outlives the parent's deadline.
///
/// # Example
///
/// ```rust,ignore
/// use crab::lifecycle::{Hook, HookContext};
///
/// let hook = Hook::on_start(|ctx: HookContext| async move {
///     tokio::select! {
///         _ = warm_cache() => Ok(()),
///         reason = ctx.done() => Err(reason.into()),
///     }
/// });
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl HookContext {
    /// A fresh root context: never cancelled by anyone else and without deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing cancellation token
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a context cancelled together with this one
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a context that additionally expires after `timeout`
    ///
    /// A timeout too large to be represented leaves the deadline unchanged.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.child(),
        }
    }

    /// Derive a context that expires at `deadline` (or earlier, if the parent does)
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if there is one
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// The underlying token, for handing to tasks spawned by a hook
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// `Some` once the context is cancelled or past its deadline
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => ContextError::Canceled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_is_live() {
        let ctx = HookContext::new();
        assert_eq!(ctx.err(), None);
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn test_cancel_propagates_to_children_only() {
        let parent = HookContext::new();
        let child = parent.child();
        let grandchild = child.with_timeout(Duration::from_secs(60));

        child.cancel();

        assert_eq!(parent.err(), None);
        assert_eq!(child.err(), Some(ContextError::Canceled));
        assert_eq!(grandchild.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_child_deadline_never_exceeds_parent() {
        let parent = HookContext::new().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_done_reports_deadline() {
        let ctx = HookContext::new().with_timeout(Duration::from_millis(20));
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_done_reports_cancellation() {
        let ctx = HookContext::new().with_timeout(Duration::from_secs(60));
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move { waiter.done().await });
        ctx.cancel();
        assert_eq!(handle.await.unwrap(), ContextError::Canceled);
    }
}

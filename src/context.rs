//! Cancellation and deadline plumbing.
//!
//! [`OpContext`] is the caller-facing context: a cancellation token plus an
//! optional overall deadline. [`TryScope`] is the much shorter-lived budget of
//! a single request attempt, derived from an `OpContext` by the retry policy.

use futures_util::future::BoxFuture;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};

/// A cancellable operation context with an optional deadline.
///
/// Cloning shares the same token; [`OpContext::child`] derives a context that
/// is cancelled together with its parent but can also be cancelled alone.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a child that is cancelled when this context is.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derives a child whose deadline is the earlier of the parent's and `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Derives a child that expires `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// True once the context was cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Returns a guard that cancels this context when dropped.
    pub fn drop_guard(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Time budget of one request attempt.
///
/// The scope expires when its deadline passes or the parent context is
/// cancelled; nothing else ends it. Dropping the scope releases it without
/// expiring it. A successful attempt hands its scope to the response body so
/// a streamed body stays bounded by the same per-try timeout until the body
/// is closed.
#[derive(Debug)]
pub struct TryScope {
    /// Cancelled only through the parent context.
    expiry: CancellationToken,
    /// Cancelled when the scope is dropped.
    release: CancellationToken,
    deadline: Instant,
}

impl TryScope {
    pub(crate) fn start(parent: &OpContext, timeout: Duration) -> Self {
        Self {
            expiry: parent.token().child_token(),
            release: CancellationToken::new(),
            deadline: Instant::now() + timeout,
        }
    }

    /// A scope with no parent, used for bodies that were not produced by a retried request.
    pub fn detached(timeout: Duration) -> Self {
        Self::start(&OpContext::new(), timeout)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.expiry.is_cancelled() || Instant::now() >= self.deadline
    }

    pub fn is_released(&self) -> bool {
        self.release.is_cancelled()
    }

    /// Future resolving when the scope expires.
    ///
    /// Releasing the scope does not resolve it; callers racing an attempt
    /// against this future only ever see the deadline or a cancelled parent.
    pub fn expired(&self) -> BoxFuture<'static, ()> {
        let token = self.expiry.clone();
        let deadline = self.deadline;
        Box::pin(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep_until(deadline) => {}
            }
        })
    }

    /// Future resolving once the scope has been dropped.
    pub fn released(&self) -> BoxFuture<'static, ()> {
        let token = self.release.clone();
        Box::pin(async move { token.cancelled().await })
    }
}

impl Drop for TryScope {
    fn drop(&mut self) {
        self.release.cancel();
    }
}

/// Handed to every attempt executed by the retry policy.
#[derive(Debug)]
pub struct TryContext {
    /// 1-based attempt number.
    pub try_number: u32,
    /// Time budget granted to this attempt.
    pub timeout: Duration,
    scope: TryScope,
}

impl TryContext {
    pub(crate) fn new(try_number: u32, timeout: Duration, scope: TryScope) -> Self {
        Self {
            try_number,
            timeout,
            scope,
        }
    }

    pub fn scope(&self) -> &TryScope {
        &self.scope
    }

    /// Takes the scope so it can be attached to a streamed response body.
    pub fn into_scope(self) -> TryScope {
        self.scope
    }
}

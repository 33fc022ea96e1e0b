/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Cooperative cancellation for long-running replication operations.
//!
//! This crate exists for the same reason `interrupt-support` exists upstream: a run
//! spans many tables, each of which spans many batches, each of which spans many
//! network round trips. Nothing here can reach into a SQL Server client mid-statement
//! and stop it; code that wants to be cancellable must poll `err_if_cancelled()`
//! between logical steps (batches, tables), which is why it's checked there and not
//! finer-grained than that.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The error returned by `err_if_cancelled`.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("the operation was canceled")]
pub struct Canceled;

/// Something that can report whether it has been canceled.
///
/// Decoupled from the thing that *triggers* cancellation (`CancellationScope`) so
/// that code which only needs to check for cancellation doesn't need to know how
/// cancellation is requested.
pub trait Cancellable {
    fn is_cancelled(&self) -> bool;

    fn err_if_cancelled(&self) -> Result<(), Canceled> {
        if self.is_cancelled() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }
}

/// A cloneable handle shared by every component participating in one replication run.
///
/// Call [`CancellationScope::cancel`] from whatever external signal the caller wires up
/// (a Ctrl-C handler, a UI "stop" button, a deadline); every clone held by in-flight
/// table workers observes it on their next `err_if_cancelled()` check.
#[derive(Clone, Debug)]
pub struct CancellationScope {
    token: Arc<CancellationToken>,
}

impl CancellationScope {
    pub fn new() -> Self {
        Self {
            token: Arc::new(CancellationToken::new()),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A future that resolves once this scope is canceled; useful for `tokio::select!`
    /// against an in-flight network call that has no cooperative checkpoint of its own.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Default for CancellationScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellable for CancellationScope {
    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A convenience implementation that never reports cancellation; for tests and for
/// callers that don't want to wire up cancellation at all.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverCancelled;

impl Cancellable for NeverCancelled {
    #[inline]
    fn is_cancelled(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_scope_is_not_cancelled() {
        let scope = CancellationScope::new();
        assert!(scope.err_if_cancelled().is_ok());
    }

    #[test]
    fn cancel_is_observed_by_clones() {
        let scope = CancellationScope::new();
        let clone = scope.clone();
        scope.cancel();
        assert!(clone.err_if_cancelled().is_err());
    }

    #[test]
    fn cancel_is_idempotent() {
        let scope = CancellationScope::new();
        scope.cancel();
        scope.cancel();
        assert!(scope.is_cancelled());
    }

    #[test]
    fn never_cancelled_is_always_ok() {
        assert!(NeverCancelled.err_if_cancelled().is_ok());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_after_cancel() {
        let scope = CancellationScope::new();
        let waiter = scope.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        scope.cancel();
        handle.await.unwrap();
    }
}

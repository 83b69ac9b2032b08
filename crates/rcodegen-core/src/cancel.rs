//! A single process-wide cancellation signal tied to a run.
//!
//! Cheap to clone and share across the orchestrator, lock acquisition,
//! and every executor; `cancel()` is idempotent.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel()` has been called (immediately, if it
    /// already was).
    ///
    /// Waits on a private clone of the watch receiver rather than a
    /// `Notify`: a `watch` channel retains its last-sent value for any
    /// receiver, so a `cancel()` landing between the initial flag check
    /// and the wait can never be missed the way a `Notify::notified()`
    /// call can (`notify_waiters()` wakes only already-registered
    /// waiters and leaves no permit for a later one).
    pub async fn cancelled(&self) {
        let mut rx = self.receiver.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn waiter_wakes_even_if_cancel_races_the_wait() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        // Give the spawned task a chance to register interest before
        // cancelling, without relying on a fixed sleep to land in any
        // particular window relative to the cancel.
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("waiter should observe cancellation promptly")
            .unwrap();
    }
}

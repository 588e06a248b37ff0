//! Cooperative cancellation of a settlement in progress.
//!
//! Cancelling only stops submissions that have not started yet. Transfers already handed to
//! the transfer collaborator are irrevocable and keep being watched to a terminal state.

use tokio::sync::watch;

/// Requests cancellation of every [CancelSignal] cloned from the same pair.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

/// Observed by the engine before each submission.
#[derive(Clone, Debug)]
pub struct CancelSignal(watch::Receiver<bool>);

/// Create a linked cancellation handle and signal.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal(self.0.subscribe())
    }
}

impl CancelSignal {
    /// A signal that is never cancelled.
    pub fn never() -> Self {
        let (_, signal) = cancellation();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves for [CancelSignal::never].
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_reaches_every_signal() {
        let (handle, signal) = cancellation();
        let other = handle.signal();
        assert!(!signal.is_cancelled());
        handle.cancel();
        assert!(signal.is_cancelled());
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn never_signal_stays_uncancelled() {
        let mut signal = CancelSignal::never();
        assert!(!signal.is_cancelled());
        let waited = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(waited.is_err());
    }
}

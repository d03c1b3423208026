//! Cancellation signal helpers.
//!
//! Cancellation is a `watch::Receiver<bool>` that flips to `true` once.

use tokio::sync::watch;

/// Resolves once the signal is `true`. Never resolves if the sender is
/// dropped without signalling.
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Returns true if cancellation has been signalled.
pub fn is_cancelled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// A receiver that is never signalled.
pub fn never() -> watch::Receiver<bool> {
    watch::channel(false).1
}

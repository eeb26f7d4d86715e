//! Cancellation signal for blocking calls.
//!
//! Blocking operations across the control plane accept a
//! `watch::Receiver<bool>` whose value flips to `true` when the caller
//! gives up. Callers select [`cancelled`] against the in-flight call;
//! the losing branch is dropped, which abandons the underlying RPC.

use tokio::sync::watch;

/// Resolves once the signal trips. A signal whose sender is dropped
/// without tripping never resolves, so a plain
/// `watch::channel(false).1` acts as "never cancelled".
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if *cancel.borrow() {
        return;
    }
    while cancel.changed().await.is_ok() {
        if *cancel.borrow() {
            return;
        }
    }
    std::future::pending::<()>().await
}

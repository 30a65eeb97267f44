// ABOUTME: Cooperative cancellation for blocking operations.
// ABOUTME: Races a future against a CancellationToken so blocked calls unblock promptly.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run `fut` until it completes or `cancel` fires. Returns `None` on cancellation.
///
/// The token is checked first, so an already-cancelled token never starts the work.
pub(crate) async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Sleep for `duration` unless cancelled first. Returns `false` on cancellation.
pub(crate) async fn sleep(cancel: &CancellationToken, duration: Duration) -> bool {
    cancellable(cancel, tokio::time::sleep(duration)).await.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_when_not_cancelled() {
        let cancel = CancellationToken::new();
        assert_eq!(cancellable(&cancel, async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_precancelled_token_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(cancellable(&cancel, async { 7 }).await, None);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pending_future() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = cancellable(&cancel, std::future::pending::<()>()).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_sleep_reports_cancellation() {
        let cancel = CancellationToken::new();
        assert!(sleep(&cancel, Duration::from_millis(1)).await);
        cancel.cancel();
        assert!(!sleep(&cancel, Duration::from_secs(60)).await);
    }
}

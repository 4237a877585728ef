// ABOUTME: Cooperative cancellation helpers shared by adapters, trackers and sinks
// ABOUTME: Races blocking I/O against the caller's CancellationToken

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{ReconcileError, Result};

/// Fail fast if the token has already fired.
pub fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ReconcileError::Cancelled);
    }
    Ok(())
}

/// Run `fut` unless `cancel` fires first, in which case `Cancelled` is returned
/// and `fut` is dropped.
pub async fn run<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReconcileError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_result_when_not_cancelled() {
        let cancel = CancellationToken::new();
        let value = run(&cancel, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_stops_pending_future() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let result: Result<()> = run(&cancel, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_check() {
        let cancel = CancellationToken::new();
        assert!(check(&cancel).is_ok());
        cancel.cancel();
        assert!(check(&cancel).unwrap_err().is_cancelled());
    }
}

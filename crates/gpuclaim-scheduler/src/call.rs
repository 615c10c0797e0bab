//! Bounded remote calls

use gpuclaim_core::{SchedError, SchedResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run a store call, giving up on cancellation or after `timeout`.
///
/// Cancellation maps to `Cancelled`; a timeout is a `TransientStore` failure.
pub(crate) async fn bounded<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    what: &str,
    fut: F,
) -> SchedResult<T>
where
    F: Future<Output = SchedResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SchedError::Cancelled(what.to_string())),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(SchedError::TransientStore(format!(
                "{} timed out after {:?}",
                what, timeout
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let cancel = CancellationToken::new();
        let value = bounded(&cancel, Duration::from_secs(1), "get", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_bounded_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: SchedResult<()> = bounded(&cancel, Duration::from_secs(1), "get", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(SchedError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_bounded_timeout_is_transient() {
        let cancel = CancellationToken::new();
        let res: SchedResult<()> = bounded(&cancel, Duration::from_millis(10), "get", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(SchedError::TransientStore(_))));
    }
}

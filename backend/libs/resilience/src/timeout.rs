/// Timeout wrapper for a single attempt
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    #[error("operation timed out after {0:?}")]
    Elapsed(Duration),
    #[error("operation failed: {0}")]
    Failed(String),
}

/// Bound an infallible future
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError::Elapsed(duration))
}

/// Bound a fallible future, folding its error into [`TimeoutError::Failed`]
pub async fn with_timeout_result<F, T, E>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match timeout(duration, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TimeoutError::Failed(e.to_string())),
        Err(_) => Err(TimeoutError::Elapsed(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_in_time() {
        let value = with_timeout(Duration::from_secs(1), async { 42 }).await;
        assert_eq!(value.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_elapsed() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;
        assert!(matches!(result, Err(TimeoutError::Elapsed(_))));
    }

    #[tokio::test]
    async fn test_inner_error_is_reported() {
        let result =
            with_timeout_result(Duration::from_secs(1), async { Err::<(), _>("no space left") })
                .await;
        match result {
            Err(TimeoutError::Failed(msg)) => assert_eq!(msg, "no space left"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}

/// Resilience helpers for storage and IO calls
///
/// - **Retry**: exponential backoff with jitter, retrying only errors the caller
///   classifies as transient
/// - **Timeout**: bounded wait for a single attempt
///
/// # Example: journal write with retry and per-attempt timeout
///
/// ```rust,no_run
/// use resilience::{with_retry, with_timeout_result, Attempt, RetryConfig};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let result = with_retry(
///         RetryConfig::default(),
///         |_e: &resilience::TimeoutError| Attempt::Transient,
///         || with_timeout_result(Duration::from_secs(1), async { Ok::<_, String>(()) }),
///     )
///     .await;
///     assert!(result.is_ok());
/// }
/// ```

pub mod retry;
pub mod timeout;

pub use retry::{with_retry, Attempt, RetryConfig, RetryError};
pub use timeout::{with_timeout, with_timeout_result, TimeoutError};

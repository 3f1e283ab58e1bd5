//! Retry utility for async operations that fail transiently
//!
//! Attempts run on a fixed interval until one succeeds or fails with an error
//! the caller classifies as permanent. The supplied cancellation token is
//! observed both while an attempt is running and while waiting for the next
//! one.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fixed-interval retry policy
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }
}

/// Why a retry loop stopped without producing a value
#[derive(Debug, PartialEq)]
pub enum RetryStop<E> {
    Cancelled,
    /// The last error was not worth retrying
    Fatal(E),
}

/// Execute an async operation, retrying on error until it succeeds
///
/// `should_retry` decides whether a failed attempt is followed by another.
///
/// # Examples
/// ```rust
/// use plugwatch::core::retry::{retry_async, RetryPolicy};
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() {
/// let cancel = CancellationToken::new();
/// let policy = RetryPolicy::fixed(Duration::from_millis(100));
/// let result = retry_async("handshake", policy, &cancel, |_: &String| true, || async {
///     Ok::<&str, String>("hello")
/// })
/// .await;
/// assert!(result.is_ok());
/// # }
/// ```
pub async fn retry_async<F, T, E, Fut, R>(
    operation_name: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    should_retry: R,
    mut operation: F,
) -> Result<T, RetryStop<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryStop::Cancelled),
            outcome = operation() => outcome,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !should_retry(&error) {
            log::debug!(
                "Operation '{}' stopped on attempt {}: {}",
                operation_name,
                attempt,
                error
            );
            return Err(RetryStop::Fatal(error));
        }

        log::debug!(
            "Operation '{}' failed on attempt {}, retrying in {:?}: {}",
            operation_name,
            attempt,
            policy.delay,
            error
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryStop::Cancelled),
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }
}

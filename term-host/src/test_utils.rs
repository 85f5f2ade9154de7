//! Polling helpers for async tests
//!
//! Used by unit tests to wait on daemon, watcher and
//! detector state without arbitrary sleeps.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Default poll interval for the helpers below
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Retry `f` until it yields `Ok`, panicking with the last error on timeout.
///
/// ```rust,ignore
/// let info = wait_for_value("session to appear", Duration::from_secs(3), || async {
///     client.list_sessions().await?
///         .into_iter()
///         .find(|s| s.session_id == "s1")
///         .ok_or("not listed yet")
/// })
/// .await;
/// ```
pub async fn wait_for_value<F, Fut, T, E>(desc: &str, timeout: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let start = std::time::Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let last_error = match f().await {
            Ok(value) => return value,
            Err(e) => e.to_string(),
        };

        if start.elapsed() >= timeout {
            panic!(
                "Timeout waiting for {}\n\
                 Duration: {:?}\n\
                 Attempts: {}\n\
                 Last error: {}",
                desc,
                start.elapsed(),
                attempts,
                last_error
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Retry a boolean condition until it holds
pub async fn wait_for<F, Fut>(desc: &str, timeout: Duration, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    wait_for_value(desc, timeout, || {
        let fut = f();
        async move {
            if fut.await {
                Ok(())
            } else {
                Err("condition not met")
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_for_value_retries_until_ok() {
        let calls = Arc::new(AtomicUsize::new(0));
        let value = wait_for_value("third attempt", Duration::from_secs(1), || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 3 {
                    Ok(n)
                } else {
                    Err(format!("attempt {}", n))
                }
            }
        })
        .await;
        assert_eq!(value, 3);
    }

    #[tokio::test]
    #[should_panic(expected = "Timeout waiting for never")]
    async fn test_wait_for_times_out() {
        wait_for("never", Duration::from_millis(60), || async { false }).await;
    }
}

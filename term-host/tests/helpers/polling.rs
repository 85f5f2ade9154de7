// Async polling for integration tests

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Retry `f` until it yields `Ok`, panicking with the last error on timeout
pub async fn wait_for_value<F, Fut, T, E>(desc: &str, timeout: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let last_error = match f().await {
            Ok(value) => return value,
            Err(e) => e.to_string(),
        };

        if start.elapsed() >= timeout {
            panic!(
                "Timed out after {} attempts over {:?} waiting for {}. Last error: {}",
                attempts,
                start.elapsed(),
                desc,
                last_error
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

pub async fn wait_for<F, Fut>(desc: &str, timeout: Duration, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    wait_for_value(desc, timeout, || {
        let fut = f();
        async move { if fut.await { Ok(()) } else { Err("condition not met") } }
    })
    .await
}

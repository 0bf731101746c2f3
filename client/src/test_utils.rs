//! Test utilities for async tests
//!
//! Helpers for waiting on conditions that settle asynchronously, such as
//! the connection manager reaching a state after a scripted socket event.
//! Deadlines use tokio's clock, so these work under `start_paused = true`.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Assert that an async condition eventually becomes true within a timeout.
///
/// Retries `f` every `interval` until it returns `Ok`, panicking with the
/// last error once `timeout` has passed.
///
/// # Example
///
/// ```rust,ignore
/// # use std::time::Duration;
/// # async fn example() {
/// use pushdesk_lib::test_utils::assert_eventually;
///
/// assert_eventually(
///     "manager to go offline",
///     Duration::from_secs(3),
///     Duration::from_millis(10),
///     || async {
///         match handle.status().state {
///             ConnectionState::Offline => Ok(()),
///             other => Err(format!("still {}", other)),
///         }
///     }
/// ).await;
/// # }
/// ```
pub async fn assert_eventually<F, Fut, T, E>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let start = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return value,
            Err(e) => {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    panic!(
                        "Timeout waiting for {}\n\
                         Duration: {:?}\n\
                         Attempts: {}\n\
                         Last error: {}",
                        desc, elapsed, attempt, e
                    );
                }

                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Variant of `assert_eventually` that takes a simple boolean condition.
pub async fn assert_eventually_bool<F, Fut>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        if f().await {
            return;
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            panic!(
                "Timeout waiting for {}\n\
                 Duration: {:?}\n\
                 Attempts: {}\n\
                 Condition never became true",
                desc, elapsed, attempt
            );
        }

        tokio::time::sleep(interval).await;
    }
}

//! Polling utilities for state that settles asynchronously.

use std::time::Duration;

/// Poll until `predicate` holds, sleeping `delay` between attempts.
///
/// Panics after `max_attempts` so a hung dispatcher fails the test instead
/// of stalling it.
pub async fn wait_until<F>(what: &str, mut predicate: F)
where
    F: FnMut() -> bool,
{
    const MAX_ATTEMPTS: usize = 400;
    const DELAY: Duration = Duration::from_millis(5);

    for _ in 0..MAX_ATTEMPTS {
        if predicate() {
            return;
        }
        tokio::time::sleep(DELAY).await;
    }
    panic!("timed out waiting for {}", what);
}

//! Bounded retry policies.
//
// Output writers retry failed appends with the configured attempt count and
// a fixed delay between attempts.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(300),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` attempts separated by `backoff_delay`.
    pub fn new(max_attempts: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_delay,
        }
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// Returns the last error together with the number of attempts made. A
    /// policy with zero attempts still runs the operation once.
    ///
    /// ```
    /// use gpib_daq::error_recovery::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// # tokio_test::block_on(async {
    /// let policy = RetryPolicy::new(3, Duration::from_millis(1));
    /// let result: Result<u32, (&str, u32)> = policy
    ///     .run(|attempt| async move { if attempt < 3 { Err("busy") } else { Ok(attempt) } })
    ///     .await;
    /// assert_eq!(result, Ok(3));
    /// # });
    /// ```
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, (E, u32)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err((e, attempt)),
                Err(_) => {
                    debug!("Attempt {}/{} failed, retrying", attempt, attempts);
                    sleep(self.backoff_delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

use std::time::Duration;

use fdeploy::{Config, Error};
use futures::Future;
use tokio_util::sync::CancellationToken;

/// Bounded retries with a fixed delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    attempts: u32,
    delay: Duration,
}

impl Policy {
    /// `attempts` is the total number of tries, at least one is made.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.retry_count, config.retry_delay())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Runs `op` until it succeeds, fails with an error that is not
    /// retryable, or the attempts are exhausted.
    ///
    /// `op` receives the 1-based attempt number. `on_retry` is called with
    /// the failed attempt number and its error before each new attempt.
    /// Cancellation is observed before every attempt and during the delay.
    pub async fn run<T, F, Fut, R>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        mut on_retry: R,
    ) -> fdeploy::Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = fdeploy::Result<T>>,
        R: FnMut(u32, &Error),
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let err = match op(attempt).await {
                Ok(res) => return Ok(res),
                Err(err) => err,
            };
            if !err.is_retryable() || attempt >= self.attempts {
                return Err(err);
            }
            log::trace!("attempt {attempt}/{} failed: {err}", self.attempts);
            on_retry(attempt, &err);

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.delay) => (),
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(attempts: u32) -> Policy {
        Policy::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn always_failing_op_is_tried_exactly_attempts_times() {
        let calls = &AtomicU32::new(0);
        let mut retries = Vec::new();
        let res: fdeploy::Result<()> = policy(4)
            .run(
                &CancellationToken::new(),
                move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Io("boom".into()))
                },
                |attempt, _| retries.push(attempt),
            )
            .await;
        assert!(matches!(res, Err(Error::Io(..))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(retries, [1, 2, 3]);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let res = policy(5)
            .run(
                &CancellationToken::new(),
                |attempt| async move {
                    if attempt < 3 {
                        Err(Error::Timeout("slow".into()))
                    } else {
                        Ok(attempt)
                    }
                },
                |_, _| (),
            )
            .await;
        assert_eq!(res.unwrap(), 3);
    }

    #[tokio::test]
    async fn local_errors_escalate_immediately() {
        let calls = &AtomicU32::new(0);
        let res: fdeploy::Result<()> = policy(10)
            .run(
                &CancellationToken::new(),
                move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Local("missing source".into()))
                },
                |_, _| panic!("no retry expected"),
            )
            .await;
        assert!(matches!(res, Err(Error::Local(..))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_delay() {
        let cancel = CancellationToken::new();
        let policy = Policy::new(3, Duration::from_secs(3600));
        let res: fdeploy::Result<()> = policy
            .run(
                &cancel,
                |_| async { Err(Error::Io("boom".into())) },
                |_, _| cancel.cancel(),
            )
            .await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(Policy::new(0, Duration::ZERO).attempts(), 1);
    }
}

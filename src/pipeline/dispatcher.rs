//! Retrying dispatch of single messages to a sink

use crate::pipeline::backoff::RetryPolicy;
use crate::sink::LogSink;
use crate::types::LogMessage;
use crate::{Result, ShimError};
use tracing::debug;

/// Wraps a sink with bounded retries and exponential backoff
pub struct Dispatcher<S> {
    sink: S,
    policy: RetryPolicy,
}

impl<S: LogSink> Dispatcher<S> {
    /// Create a dispatcher for `sink` using `policy` for retries
    pub fn new(sink: S, policy: RetryPolicy) -> Self {
        Self { sink, policy }
    }

    /// Send `message`, retrying transient failures.
    ///
    /// Returns [`ShimError::Dispatch`] once every attempt has failed.
    pub async fn send(&self, message: &LogMessage) -> Result<()> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.backoff();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let err = match self.sink.send(message).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if attempts >= max_attempts {
                return Err(ShimError::Dispatch {
                    attempts,
                    last_error: err.to_string(),
                });
            }

            let delay = backoff.next_delay();
            debug!(
                "Send attempt {}/{} failed: {}; retrying in {:?}",
                attempts, max_attempts, err, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Source;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails until `succeed_on` attempts have been made (0 = never succeeds)
    struct FlakySink {
        calls: AtomicU32,
        succeed_on: u32,
    }

    impl FlakySink {
        fn new(succeed_on: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                succeed_on,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LogSink for FlakySink {
        async fn send(&self, _message: &LogMessage) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.succeed_on != 0 && call >= self.succeed_on {
                Ok(())
            } else {
                Err(ShimError::Sink(format!("attempt {} refused", call)))
            }
        }
    }

    fn message() -> LogMessage {
        LogMessage::new(&b"test log message"[..], Source::Stdout)
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let sink = FlakySink::new(1);
        let dispatcher = Dispatcher::new(sink.clone(), RetryPolicy::immediate(3));

        dispatcher.send(&message()).await.unwrap();
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test]
    async fn test_success_on_kth_attempt() {
        for k in 1..=3 {
            let sink = FlakySink::new(k);
            let dispatcher = Dispatcher::new(sink.clone(), RetryPolicy::immediate(3));

            assert!(dispatcher.send(&message()).await.is_ok());
            assert_eq!(sink.calls(), k);
        }
    }

    #[tokio::test]
    async fn test_always_failing_sink_exhausts_attempts() {
        let sink = FlakySink::new(0);
        let dispatcher = Dispatcher::new(sink.clone(), RetryPolicy::immediate(3));

        match dispatcher.send(&message()).await {
            Err(ShimError::Dispatch { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("attempt 3 refused"));
            }
            other => panic!("Expected Dispatch error, got {:?}", other),
        }
        assert_eq!(sink.calls(), 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_sends_once() {
        let sink = FlakySink::new(0);
        let dispatcher = Dispatcher::new(sink.clone(), RetryPolicy::immediate(0));

        assert!(dispatcher.send(&message()).await.is_err());
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test]
    async fn test_backoff_is_slept_between_attempts() {
        let sink = FlakySink::new(3);
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 20,
            max_delay_ms: 40,
            jitter: 0.0,
            multiplier: 2.0,
        };
        let dispatcher = Dispatcher::new(sink.clone(), policy);

        let started = std::time::Instant::now();
        dispatcher.send(&message()).await.unwrap();

        // 20ms + 40ms between the three attempts
        assert!(started.elapsed() >= std::time::Duration::from_millis(60));
        assert_eq!(sink.calls(), 3);
    }
}

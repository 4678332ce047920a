//! Retry policy and the retrying execution wrapper.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use metrics::counter;
use tracing::{debug, warn};

use super::dedupe::ExecutionEvent;
use crate::error::{BoxError, QueryError};
use crate::gate::{NetworkGate, NetworkMode};

const METRIC_RETRY_TOTAL: &str = "querycache_retry_total";

/// Outcome of consulting a retry predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up and surface the error.
    Stop,
    /// Retry after the configured delay.
    Retry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

impl From<bool> for RetryDecision {
    fn from(retry: bool) -> Self {
        if retry { Self::Retry } else { Self::Stop }
    }
}

/// Callback deciding from the failure count and the latest error.
pub type RetryPredicate = Arc<dyn Fn(u32, &QueryError) -> RetryDecision + Send + Sync>;

/// When a failed attempt is retried.
#[derive(Clone, Default)]
pub enum RetryPolicy {
    /// Fail on the first error.
    #[default]
    Never,
    /// Retry forever.
    Always,
    /// Retry while the failure count stays within the limit.
    Count(u32),
    /// Ask a callback.
    Predicate(RetryPredicate),
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::Count(count) => f.debug_tuple("Count").field(count).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<bool> for RetryPolicy {
    fn from(retry: bool) -> Self {
        if retry { Self::Always } else { Self::Never }
    }
}

impl From<u32> for RetryPolicy {
    fn from(count: u32) -> Self {
        Self::Count(count)
    }
}

impl RetryPolicy {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(u32, &QueryError) -> RetryDecision + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Decide what to do after the `failure_count`-th failure.
    ///
    /// Returns the delay before the next attempt, or `None` to stop.
    /// Cancellation is never retried.
    pub fn decide(&self, failure_count: u32, error: &QueryError, delay: Duration) -> Option<Duration> {
        if error.is_cancelled() {
            return None;
        }
        let decision = match self {
            Self::Never => RetryDecision::Stop,
            Self::Always => RetryDecision::Retry,
            Self::Count(limit) => (failure_count <= *limit).into(),
            Self::Predicate(predicate) => predicate(failure_count, error),
        };
        match decision {
            RetryDecision::Stop => None,
            RetryDecision::Retry => Some(delay),
            RetryDecision::RetryAfter(custom) => Some(custom),
        }
    }
}

/// Factory producing one attempt's source stream.
pub(crate) type Attempt<T> = Box<dyn Fn() -> BoxStream<'static, Result<T, BoxError>> + Send>;

/// Runs attempts until one completes, the policy gives up, or the consumer
/// goes away.
pub(crate) struct Retryer {
    pub policy: RetryPolicy,
    pub delay: Duration,
    pub network_mode: NetworkMode,
    pub gate: NetworkGate,
    pub label: String,
}

impl Retryer {
    /// Wrap `attempt` into an event stream.
    ///
    /// Before each attempt the stream pauses while the gate requires it. A
    /// failure observed while offline pauses and re-attempts on reconnect
    /// without consulting the policy. Panics raised by the source surface as
    /// [`QueryError::Panicked`].
    pub fn run<T: Send + Sync + 'static>(self, attempt: Attempt<T>) -> BoxStream<'static, ExecutionEvent<T>> {
        Box::pin(stream! {
            let mut failure_count = 0_u32;
            loop {
                if self.gate.must_wait(self.network_mode) {
                    debug!(execution = %self.label, "Execution paused while offline");
                    yield ExecutionEvent::Paused;
                    self.gate.wait_for_online().await;
                    yield ExecutionEvent::Resumed;
                }

                let mut failure = None;
                match open(&attempt) {
                    Ok(mut source) => loop {
                        match AssertUnwindSafe(source.next()).catch_unwind().await {
                            Ok(Some(Ok(value))) => yield ExecutionEvent::Value(Arc::new(value)),
                            Ok(Some(Err(error))) => {
                                failure = Some(QueryError::failed(error));
                                break;
                            }
                            Ok(None) => break,
                            Err(payload) => {
                                failure = Some(QueryError::panicked(payload));
                                break;
                            }
                        }
                    },
                    Err(error) => failure = Some(error),
                }

                let Some(error) = failure else {
                    return;
                };
                failure_count += 1;

                if self.gate.must_wait(self.network_mode) {
                    yield ExecutionEvent::Retry { failure_count, error };
                    continue;
                }

                match self.policy.decide(failure_count, &error, self.delay) {
                    Some(delay) => {
                        counter!(METRIC_RETRY_TOTAL).increment(1);
                        debug!(
                            execution = %self.label,
                            failure_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Attempt failed, retrying"
                        );
                        yield ExecutionEvent::Retry { failure_count, error };
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    None => {
                        warn!(execution = %self.label, failure_count, error = %error, "Execution failed");
                        yield ExecutionEvent::Failed(error);
                        return;
                    }
                }
            }
        })
    }
}

fn open<T>(attempt: &Attempt<T>) -> Result<BoxStream<'static, Result<T, BoxError>>, QueryError> {
    std::panic::catch_unwind(AssertUnwindSafe(|| attempt())).map_err(QueryError::panicked)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::task::Poll;

    use futures::stream;

    use super::*;

    fn retryer(policy: RetryPolicy, gate: NetworkGate) -> Retryer {
        Retryer {
            policy,
            delay: Duration::ZERO,
            network_mode: NetworkMode::Online,
            gate,
            label: "test".to_string(),
        }
    }

    fn flaky(failures: u32, calls: &Arc<AtomicU32>) -> Attempt<&'static str> {
        let calls = Arc::clone(calls);
        Box::new(move || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            let item = if call < failures {
                Err::<&'static str, BoxError>("boom".into())
            } else {
                Ok("done")
            };
            stream::iter([item]).boxed()
        })
    }

    #[test]
    fn count_policy_allows_limit_retries() {
        let policy = RetryPolicy::Count(2);
        let error = QueryError::failed("x");
        assert_eq!(policy.decide(1, &error, Duration::ZERO), Some(Duration::ZERO));
        assert_eq!(policy.decide(2, &error, Duration::ZERO), Some(Duration::ZERO));
        assert_eq!(policy.decide(3, &error, Duration::ZERO), None);
    }

    #[test]
    fn cancellation_is_never_retried() {
        assert_eq!(
            RetryPolicy::Always.decide(1, &QueryError::Cancelled, Duration::ZERO),
            None
        );
    }

    #[test]
    fn predicate_may_choose_its_own_delay() {
        let policy = RetryPolicy::predicate(|count, _| {
            if count < 3 {
                RetryDecision::RetryAfter(Duration::from_millis(u64::from(count) * 10))
            } else {
                RetryDecision::Stop
            }
        });
        let error = QueryError::failed("x");
        assert_eq!(
            policy.decide(2, &error, Duration::ZERO),
            Some(Duration::from_millis(20))
        );
        assert_eq!(policy.decide(3, &error, Duration::ZERO), None);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let events: Vec<_> = retryer(RetryPolicy::Count(3), NetworkGate::default())
            .run(flaky(2, &calls))
            .collect()
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(events[0], ExecutionEvent::Retry { failure_count: 1, .. }));
        assert!(matches!(events[1], ExecutionEvent::Retry { failure_count: 2, .. }));
        assert!(matches!(&events[2], ExecutionEvent::Value(v) if **v == "done"));
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn gives_up_when_policy_stops() {
        let calls = Arc::new(AtomicU32::new(0));
        let events: Vec<_> = retryer(RetryPolicy::Count(1), NetworkGate::default())
            .run(flaky(5, &calls))
            .collect()
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(events.last(), Some(ExecutionEvent::Failed(_))));
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let attempt: Attempt<u32> = Box::new(|| {
            stream::poll_fn(|_| -> Poll<Option<Result<u32, BoxError>>> { panic!("source exploded") })
                .boxed()
        });
        let events: Vec<_> = retryer(RetryPolicy::Never, NetworkGate::default())
            .run(attempt)
            .collect()
            .await;

        match events.as_slice() {
            [ExecutionEvent::Failed(QueryError::Panicked(message))] => {
                assert!(message.contains("source exploded"));
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn factory_panics_become_errors() {
        let attempt: Attempt<u32> =
            Box::new(|| -> BoxStream<'static, Result<u32, BoxError>> { panic!("factory exploded") });
        let events: Vec<_> = retryer(RetryPolicy::Never, NetworkGate::default())
            .run(attempt)
            .collect()
            .await;

        assert!(matches!(events.as_slice(), [ExecutionEvent::Failed(QueryError::Panicked(_))]));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_failure_pauses_until_reconnect() {
        let gate = NetworkGate::default();
        let calls = Arc::new(AtomicU32::new(0));
        let attempt: Attempt<u32> = {
            let calls = Arc::clone(&calls);
            let gate = gate.clone();
            Box::new(move || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call == 0 {
                    gate.set_online(false);
                    stream::iter([Err::<u32, BoxError>("network down".into())]).boxed()
                } else {
                    stream::iter([Ok(42)]).boxed()
                }
            })
        };

        let mut events = retryer(RetryPolicy::Never, gate.clone()).run(attempt);
        assert!(matches!(events.next().await, Some(ExecutionEvent::Retry { failure_count: 1, .. })));
        assert!(matches!(events.next().await, Some(ExecutionEvent::Paused)));

        let resume = tokio::spawn({
            let gate = gate.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                gate.set_online(true);
            }
        });

        assert!(matches!(events.next().await, Some(ExecutionEvent::Resumed)));
        assert!(matches!(events.next().await, Some(ExecutionEvent::Value(v)) if *v == 42));
        assert!(events.next().await.is_none());
        resume.await.expect("resume task");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

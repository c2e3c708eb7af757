//! Bounded-attempt exponential backoff around a single remote operation.
//!
//! A call moves `Attempting -> Succeeded`, or `Attempting -> Waiting ->
//! Attempting` on a retryable failure, and ends in `Exhausted` when attempts
//! run out or the failure is not retryable.

use crate::config::{env_u64, env_u64_ms};
use rand::Rng;
use std::{fmt, future::Future, time::Duration};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// The service asked us to slow down, optionally saying for how long.
    RateLimited(Option<Duration>),
    Transient,
    Fatal,
}

pub trait Retryable {
    fn classify(&self) -> RetryClass;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap: Duration,
    pub jitter: Duration,
    pub rate_limit_margin: Duration,
    /// Ceiling on a server-supplied wait, margin included.
    pub max_hint: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
            rate_limit_margin: Duration::from_secs(1),
            max_hint: Duration::from_secs(120),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_u64("CONTENT_MAX_ATTEMPTS")
                .filter(|v| *v >= 1)
                .map(|v| v.min(u32::MAX as u64) as u32)
                .unwrap_or(defaults.max_attempts),
            base_delay: env_u64_ms("CONTENT_BASE_DELAY_MS").unwrap_or(defaults.base_delay),
            cap: env_u64_ms("CONTENT_MAX_DELAY_MS").unwrap_or(defaults.cap),
            jitter: env_u64_ms("CONTENT_JITTER_MS").unwrap_or(defaults.jitter),
            rate_limit_margin: env_u64_ms("CONTENT_RATE_LIMIT_MARGIN_MS")
                .unwrap_or(defaults.rate_limit_margin),
            max_hint: env_u64("CONTENT_MAX_RATE_LIMIT_WAIT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_hint),
            attempt_timeout: env_u64("CONTENT_ATTEMPT_TIMEOUT_SECS")
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.attempt_timeout),
        }
    }

    /// Exponential delay before the attempt after `attempt` (1-based), with a
    /// caller-supplied jitter so the shape stays testable.
    pub fn exponential_delay(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self.base_delay.saturating_mul(1u32 << exponent);
        base.saturating_add(jitter).min(self.cap)
    }

    pub fn delay_for(&self, attempt: u32, class: RetryClass) -> Duration {
        match class {
            RetryClass::RateLimited(Some(after)) => after
                .saturating_add(self.rate_limit_margin)
                .min(self.max_hint),
            _ => self.exponential_delay(attempt, self.sample_jitter()),
        }
    }

    fn sample_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Attempting { attempt: u32 },
    Waiting { attempt: u32, delay: Duration },
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum AttemptFailure<E> {
    #[error("{0}")]
    Failed(E),
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: AttemptFailure<E>,
    },
    #[error("non-retryable failure on attempt {attempts}: {error}")]
    Aborted { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Aborted { attempts, .. } => {
                *attempts
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryableCall {
    label: &'static str,
    policy: RetryPolicy,
}

impl RetryableCall {
    pub fn new(label: &'static str, policy: RetryPolicy) -> Self {
        Self { label, policy }
    }

    /// Runs `op` until it succeeds or the policy gives up. Each attempt first
    /// obtains a permit from `admit` and holds it for that attempt only;
    /// waiting for admission does not count against the attempt timeout.
    pub async fn run_gated<T, E, P, A, AFut, F, Fut>(
        &self,
        admit: A,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable + fmt::Display,
        A: FnMut() -> AFut,
        AFut: Future<Output = Result<P, E>>,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let label = self.label;
        self.run_gated_traced(admit, op, |state| {
            debug!(target = "supply.retry", call = label, state = ?state, "retry_transition");
        })
        .await
    }

    /// Same as [`RetryableCall::run_gated`], reporting every state transition.
    pub async fn run_gated_traced<T, E, P, A, AFut, F, Fut, S>(
        &self,
        mut admit: A,
        mut op: F,
        mut on_state: S,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable + fmt::Display,
        A: FnMut() -> AFut,
        AFut: Future<Output = Result<P, E>>,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        S: FnMut(CallState),
    {
        let max_attempts = self.policy.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            on_state(CallState::Attempting { attempt });

            let result = match admit().await {
                Ok(permit) => {
                    let result = timeout(self.policy.attempt_timeout, op(attempt)).await;
                    drop(permit);
                    result
                }
                Err(error) => Ok(Err(error)),
            };
            let (failure, class) = match result {
                Ok(Ok(value)) => {
                    on_state(CallState::Succeeded { attempts: attempt });
                    return Ok(value);
                }
                Ok(Err(error)) => match error.classify() {
                    RetryClass::Fatal => {
                        on_state(CallState::Exhausted { attempts: attempt });
                        return Err(RetryError::Aborted {
                            attempts: attempt,
                            error,
                        });
                    }
                    class => (AttemptFailure::Failed(error), class),
                },
                Err(_) => (
                    AttemptFailure::TimedOut(self.policy.attempt_timeout),
                    RetryClass::Transient,
                ),
            };

            if attempt >= max_attempts {
                on_state(CallState::Exhausted { attempts: attempt });
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: failure,
                });
            }

            let delay = self.policy.delay_for(attempt, class);
            debug!(
                target = "supply.retry",
                call = self.label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying"
            );
            crate::metrics::retry_wait(self.label, delay.as_millis());
            on_state(CallState::Waiting { attempt, delay });
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };
    use tokio::sync::Semaphore;

    #[derive(Debug)]
    enum FakeError {
        Limited(Option<Duration>),
        Flaky,
        Broken,
    }

    impl fmt::Display for FakeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for FakeError {
        fn classify(&self) -> RetryClass {
            match self {
                FakeError::Limited(after) => RetryClass::RateLimited(*after),
                FakeError::Flaky => RetryClass::Transient,
                FakeError::Broken => RetryClass::Fatal,
            }
        }
    }

    fn ungated() -> future::Ready<Result<(), FakeError>> {
        future::ready(Ok(()))
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            cap: Duration::from_millis(500),
            jitter: Duration::ZERO,
            rate_limit_margin: Duration::from_millis(1000),
            max_hint: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.exponential_delay(1, Duration::ZERO), Duration::from_millis(100));
        assert_eq!(policy.exponential_delay(2, Duration::ZERO), Duration::from_millis(200));
        assert_eq!(
            policy.exponential_delay(3, Duration::from_millis(30)),
            Duration::from_millis(430)
        );
        assert_eq!(policy.exponential_delay(4, Duration::ZERO), Duration::from_millis(500));
        assert_eq!(policy.exponential_delay(60, Duration::ZERO), Duration::from_millis(500));
    }

    #[test]
    fn rate_limit_hint_wins_over_backoff() {
        let policy = policy();
        assert_eq!(
            policy.delay_for(1, RetryClass::RateLimited(Some(Duration::from_secs(3)))),
            Duration::from_secs(4)
        );
        assert_eq!(
            policy.delay_for(2, RetryClass::RateLimited(None)),
            Duration::from_millis(200)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_then_success_walks_the_state_machine() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut states = Vec::new();
        let call = RetryableCall::new("test", policy());
        let result = call
            .run_gated_traced(
                ungated,
                |attempt| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        if attempt == 1 {
                            Err(FakeError::Limited(Some(Duration::from_secs(2))))
                        } else {
                            Ok("card")
                        }
                    }
                },
                |state| states.push(state),
            )
            .await
            .expect("second attempt succeeds");

        assert_eq!(result, "card");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            states,
            vec![
                CallState::Attempting { attempt: 1 },
                CallState::Waiting {
                    attempt: 1,
                    delay: Duration::from_secs(3)
                },
                CallState::Attempting { attempt: 2 },
                CallState::Succeeded { attempts: 2 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let call = RetryableCall::new("test", policy());
        let err = call
            .run_gated(ungated, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FakeError::Flaky)
                }
            })
            .await
            .expect_err("never succeeds");

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(
            err,
            RetryError::Exhausted {
                attempts: 4,
                last: AttemptFailure::Failed(FakeError::Flaky)
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let call = RetryableCall::new("test", policy());
        let err = call
            .run_gated(ungated, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FakeError::Broken)
                }
            })
            .await
            .expect_err("fatal");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), 1);
        assert!(matches!(err, RetryError::Aborted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_times_out_and_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut policy = policy();
        policy.attempt_timeout = Duration::from_secs(1);
        let call = RetryableCall::new("test", policy);
        let value = call
            .run_gated(ungated, |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt == 1 {
                        sleep(Duration::from_secs(60)).await;
                    }
                    Ok::<_, FakeError>(attempt)
                }
            })
            .await
            .expect("second attempt");

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn server_hint_is_capped() {
        let policy = policy();
        assert_eq!(
            policy.delay_for(1, RetryClass::RateLimited(Some(Duration::from_secs(86_400)))),
            Duration::from_secs(60)
        );
        assert_eq!(
            policy.delay_for(1, RetryClass::RateLimited(Some(Duration::MAX))),
            Duration::from_secs(60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn admission_wait_does_not_use_the_attempt_timeout() {
        let gate = Arc::new(Semaphore::new(1));
        let held = gate.clone().acquire_owned().await.unwrap();
        tokio::spawn(async move {
            sleep(Duration::from_secs(10)).await;
            drop(held);
        });

        let calls = Arc::new(AtomicU32::new(0));
        let mut policy = policy();
        policy.max_attempts = 1;
        policy.attempt_timeout = Duration::from_secs(1);
        let call = RetryableCall::new("test", policy);
        let value = call
            .run_gated(
                || {
                    let gate = gate.clone();
                    async move { gate.acquire_owned().await.map_err(|_| FakeError::Broken) }
                },
                |attempt| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(500)).await;
                        Ok::<_, FakeError>(attempt)
                    }
                },
            )
            .await
            .expect("admitted once the holder releases");

        assert_eq!(value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate.available_permits(), 1);
    }
}

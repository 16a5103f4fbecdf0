use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use basket_core::config::ManagedConfig;

/// How a failed remote call should be treated.
#[derive(Debug)]
pub enum RequestError {
    /// Network error, 429 or 5xx.
    Retryable(String),
    /// Any other 4xx, or a response that could not be decoded.
    Fatal(String),
}

impl RequestError {
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let msg = format!("HTTP {status}: {body}");
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::Retryable(msg)
        } else {
            Self::Fatal(msg)
        }
    }

    pub fn from_transport(e: &reqwest::Error) -> Self {
        if e.is_decode() { Self::Fatal(e.to_string()) } else { Self::Retryable(e.to_string()) }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(m) | Self::Fatal(m) => m,
        }
    }
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Exponential backoff with jitter, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ManagedConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped, plus up to 25% jitter (still capped).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay);
        let jitter_ms = jitter(capped.as_millis() / 4);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    pub async fn execute<F, Fut, T>(&self, what: &str, mut operation: F) -> Result<T, RequestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(v) => return Ok(v),
                Err(e @ RequestError::Fatal(_)) => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    tracing::warn!(what, attempts = attempt, error = %e, "giving up after retries");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    tracing::debug!(what, attempt, delay_ms, error = %e, "retrying");
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

// kept out of async fns so the thread-local rng never crosses an await
fn jitter(max_ms: u128) -> u64 {
    let max = u64::try_from(max_ms).unwrap_or(u64::MAX);
    if max == 0 { 0 } else { rand::thread_rng().gen_range(0..=max) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(100), max_delay: Duration::from_millis(300) }
    }

    #[test]
    fn delays_grow_and_stay_capped() {
        let p = policy();
        let first = p.delay_for(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        assert!(p.delay_for(2) >= Duration::from_millis(200));
        for attempt in 1..40 {
            assert!(p.delay_for(attempt) <= Duration::from_millis(300));
        }
    }

    #[test]
    fn status_classification() {
        use reqwest::StatusCode;
        assert!(matches!(RequestError::from_status(StatusCode::TOO_MANY_REQUESTS, ""), RequestError::Retryable(_)));
        assert!(matches!(RequestError::from_status(StatusCode::BAD_GATEWAY, ""), RequestError::Retryable(_)));
        assert!(matches!(RequestError::from_status(StatusCode::UNAUTHORIZED, ""), RequestError::Fatal(_)));
    }

    #[tokio::test]
    async fn fatal_errors_stop_immediately() {
        let p = RetryPolicy { base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2), ..policy() };
        let mut calls = 0;
        let out: Result<(), _> = p
            .execute("test", || {
                calls += 1;
                async { Err(RequestError::Fatal("nope".into())) }
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retryable_errors_use_every_attempt() {
        let p = RetryPolicy { base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2), ..policy() };
        let mut calls = 0;
        let out: Result<(), _> = p
            .execute("test", || {
                calls += 1;
                async { Err(RequestError::Retryable("busy".into())) }
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls, 3);
    }
}

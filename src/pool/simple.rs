//! Round-robin endpoint pool used by the EVM and Bitcoin adapters (§4.2).
//!
//! Each call starts at the rotating index and tries up to `2 * len(endpoints)`
//! times total. Network failures sleep an exponential backoff that grows per
//! full rotation through the list; other failures sleep a short fixed delay
//! and move to the next endpoint.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backon::ExponentialBuilder;
use tracing::warn;

use crate::errors::{FailureClass, PoolError, TransportError};

const OTHER_FAILURE_SLEEP: Duration = Duration::from_millis(300);

pub struct SimplePool {
    chain: String,
    endpoints: Vec<String>,
    index: AtomicUsize,
    backoff_schedule: Vec<Duration>,
}

impl SimplePool {
    pub fn new(chain: impl Into<String>, endpoints: Vec<String>) -> Self {
        // Exponential backoff base 200ms doubling per full rotation, capped
        // at 5s; precompute enough steps to cover any plausible rotation count.
        let backoff_schedule: Vec<Duration> = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(5))
            .with_factor(2.0_f32)
            .without_max_times()
            .build()
            .take(16)
            .collect();

        Self {
            chain: chain.into(),
            endpoints,
            index: AtomicUsize::new(0),
            backoff_schedule,
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn backoff_for_rotation(&self, rotation: usize) -> Duration {
        self.backoff_schedule
            .get(rotation)
            .copied()
            .unwrap_or(Duration::from_secs(5))
    }

    /// Try the call against each endpoint starting at the rotating index,
    /// for up to `2 * len(endpoints)` total attempts.
    pub async fn call_with_retry<F, Fut, T>(&self, f: F) -> Result<T, PoolError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        if self.endpoints.is_empty() {
            return Err(PoolError::AllEndpointsFailed {
                chain: self.chain.clone(),
                last_error: "no endpoints configured".to_string(),
            });
        }

        let n = self.endpoints.len();
        let total_attempts = 2 * n;
        let start = self.index.load(Ordering::Relaxed);
        let mut last_error: Option<TransportError> = None;

        for attempt in 0..total_attempts {
            let idx = (start + attempt) % n;
            let url = self.endpoints[idx].clone();

            match f(url.clone()).await {
                Ok(result) => {
                    self.index.store(idx, Ordering::Relaxed);
                    return Ok(result);
                }
                Err(err) => {
                    let class = err.classify();
                    warn!(chain = %self.chain, url = %url, attempt, error = %err, "endpoint call failed");
                    match class {
                        FailureClass::Network => {
                            let rotation = attempt / n;
                            let delay = self.backoff_for_rotation(rotation);
                            tokio::time::sleep(delay).await;
                        }
                        _ => {
                            tokio::time::sleep(OTHER_FAILURE_SLEEP).await;
                        }
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(PoolError::AllEndpointsFailed {
            chain: self.chain.clone(),
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_first_healthy_endpoint() {
        let pool = SimplePool::new("ethereum", vec!["http://a".into(), "http://b".into()]);
        let result = pool
            .call_with_retry(|url| async move {
                if url == "http://a" {
                    Ok(42)
                } else {
                    Err(TransportError::EmptyBody { url })
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn rotates_past_failing_endpoint() {
        let pool = SimplePool::new("ethereum", vec!["http://bad".into(), "http://good".into()]);
        let result = pool
            .call_with_retry(|url| async move {
                if url == "http://good" {
                    Ok("ok")
                } else {
                    Err(TransportError::Status {
                        url,
                        status: 500,
                        body_prefix: String::new(),
                    })
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
    }

    #[tokio::test]
    async fn exhausts_after_2n_attempts() {
        let pool = SimplePool::new("ethereum", vec!["http://a".into(), "http://b".into()]);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), PoolError> = pool
            .call_with_retry(move |url| {
                calls_clone.fetch_add(1, Ordering::Relaxed);
                async move {
                    Err(TransportError::Status {
                        url,
                        status: 500,
                        body_prefix: String::new(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 4); // 2 * len(endpoints)
    }

    #[tokio::test]
    async fn empty_endpoint_list_fails_fast() {
        let pool: SimplePool = SimplePool::new("ethereum", vec![]);
        let result = pool
            .call_with_retry(|_url| async move { Ok::<(), TransportError>(()) })
            .await;
        assert!(matches!(result, Err(PoolError::AllEndpointsFailed { .. })));
    }
}

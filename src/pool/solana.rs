//! Solana endpoint pool (§4.2): ban/cooldown/degrade state machine on top of
//! round-robin rotation, with per-endpoint minimum call spacing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::errors::{FailureClass, PoolError, TransportError};
use crate::model::EndpointHealth;

const BAN_DURATION: Duration = Duration::from_secs(30 * 60);
const DEGRADE_HEADSTART: Duration = Duration::from_secs(1);
const DEGRADE_MIN_GAP: Duration = Duration::from_secs(6);
/// The pool never waits longer than this for `lastCallAt + minInterval`,
/// to prevent pathological pile-up (§4.2).
const MAX_PACING_WAIT: Duration = Duration::from_secs(5);

pub struct SolanaPoolConfig {
    pub rps: f64,
    pub cooldown_base: Duration,
    pub cooldown_max: Duration,
}

impl Default for SolanaPoolConfig {
    fn default() -> Self {
        Self {
            rps: 8.0,
            cooldown_base: Duration::from_secs(8),
            cooldown_max: Duration::from_secs(60),
        }
    }
}

pub struct SolanaPool {
    endpoints: Vec<String>,
    index: AtomicUsize,
    health: RwLock<HashMap<String, EndpointHealth>>,
    config: SolanaPoolConfig,
    min_interval: Duration,
}

/// Categorized endpoint lists for observability (§4.2's `health()` accessor).
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    pub healthy: Vec<String>,
    pub cooling: Vec<(String, Instant)>,
    pub banned: Vec<(String, Instant)>,
}

struct Selection {
    url: String,
    degraded: bool,
}

impl SolanaPool {
    pub fn new(endpoints: Vec<String>, config: SolanaPoolConfig) -> Self {
        let min_interval = Duration::from_secs_f64(1.0 / config.rps.max(0.001));
        let mut health = HashMap::new();
        for ep in &endpoints {
            health.insert(ep.clone(), EndpointHealth::default());
        }
        Self {
            endpoints,
            index: AtomicUsize::new(0),
            health: RwLock::new(health),
            config,
            min_interval,
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub async fn health(&self) -> HealthSnapshot {
        let now = Instant::now();
        let health = self.health.read().await;
        let mut snapshot = HealthSnapshot::default();
        for (url, h) in health.iter() {
            if let Some(until) = h.banned_until.filter(|_| h.is_banned(now)) {
                snapshot.banned.push((url.clone(), until));
            } else if let Some(until) = h.cooldown_until.filter(|_| h.is_cooling(now)) {
                snapshot.cooling.push((url.clone(), until));
            } else {
                snapshot.healthy.push(url.clone());
            }
        }
        snapshot
    }

    async fn select(&self) -> Result<Selection, PoolError> {
        if self.endpoints.is_empty() {
            return Err(PoolError::NoEndpoint);
        }
        let now = Instant::now();
        let health = self.health.read().await;
        let n = self.endpoints.len();
        let start = self.index.load(Ordering::Relaxed);

        for i in 0..n {
            let idx = (start + i) % n;
            let url = &self.endpoints[idx];
            let healthy = health.get(url).map(|h| h.is_healthy(now)).unwrap_or(true);
            if healthy {
                return Ok(Selection {
                    url: url.clone(),
                    degraded: false,
                });
            }
        }

        // No healthy candidate: consider a degraded attempt on whichever
        // cooling endpoint ends soonest.
        let mut best: Option<(&String, Instant)> = None;
        for url in &self.endpoints {
            if let Some(h) = health.get(url) {
                if h.is_banned(now) {
                    continue;
                }
                if let Some(until) = h.cooldown_until {
                    let better = match best {
                        None => true,
                        Some((_, cur_until)) => until < cur_until,
                    };
                    if better {
                        best = Some((url, until));
                    }
                }
            }
        }

        if let Some((url, until)) = best {
            let remaining = until.saturating_duration_since(now);
            if remaining <= DEGRADE_HEADSTART {
                let h = health.get(url).expect("endpoint present in health map");
                let gap_ok = h
                    .last_degrade_attempt_at
                    .map(|t| now.saturating_duration_since(t) >= DEGRADE_MIN_GAP)
                    .unwrap_or(true);
                if gap_ok {
                    return Ok(Selection {
                        url: url.clone(),
                        degraded: true,
                    });
                }
            }
        }

        Err(PoolError::NoEndpoint)
    }

    async fn wait_for_pacing(&self, url: &str) {
        let now = Instant::now();
        let last_call = {
            let health = self.health.read().await;
            health.get(url).and_then(|h| h.last_call_at)
        };
        if let Some(last) = last_call {
            let earliest = last + self.min_interval;
            if earliest > now {
                let wait = earliest.saturating_duration_since(now);
                if wait <= MAX_PACING_WAIT {
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Perform one call against a selected endpoint. Unlike the EVM/Bitcoin
    /// pool, this tries exactly one endpoint per invocation: the upper layer
    /// (scan loop) retries on the next poll tick (§4.2).
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let selection = self.select().await?;
        self.wait_for_pacing(&selection.url).await;

        if selection.degraded {
            // Entry-time update, per the Open Question decision in §9.
            let mut health = self.health.write().await;
            if let Some(h) = health.get_mut(&selection.url) {
                h.last_degrade_attempt_at = Some(Instant::now());
            }
        }

        let idx = self.endpoints.iter().position(|e| e == &selection.url);
        let result = f(selection.url.clone()).await;
        let now = Instant::now();

        match result {
            Ok(value) => {
                if let Some(idx) = idx {
                    self.index.store(idx, Ordering::Relaxed);
                }
                let mut health = self.health.write().await;
                if let Some(h) = health.get_mut(&selection.url) {
                    h.mark_success(now);
                }
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&selection.url, &err, now).await;
                warn!(url = %selection.url, degraded = selection.degraded, error = %err, "solana rpc call failed");
                Err(PoolError::Transport(err))
            }
        }
    }

    async fn record_failure(&self, url: &str, err: &TransportError, now: Instant) {
        let class = err.classify();
        let mut health = self.health.write().await;
        let h = health.entry(url.to_string()).or_default();
        h.last_call_at = Some(now);
        match class {
            FailureClass::Permission => {
                h.banned_until = Some(now + BAN_DURATION);
                warn!(url, "endpoint banned for 30 minutes");
            }
            FailureClass::RateLimit => {
                let next = match h.current_backoff {
                    Some(prev) => (prev * 2).min(self.config.cooldown_max),
                    None => self.config.cooldown_base,
                };
                let next = next.max(self.config.cooldown_base);
                h.current_backoff = Some(next);
                h.cooldown_until = Some(now + next);
                info!(url, cooldown_secs = next.as_secs(), "endpoint cooling down after 429");
            }
            FailureClass::Network | FailureClass::Other => {
                // Logged above; no health-state change beyond last_call_at.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(endpoints: Vec<&str>) -> SolanaPool {
        SolanaPool::new(
            endpoints.into_iter().map(String::from).collect(),
            SolanaPoolConfig::default(),
        )
    }

    #[tokio::test]
    async fn selects_healthy_endpoint_on_first_try() {
        let p = pool(vec!["http://a", "http://b"]);
        let result = p.call(|url| async move { Ok::<_, TransportError>(url) }).await;
        assert_eq!(result.unwrap(), "http://a");
    }

    #[tokio::test]
    async fn rate_limit_sets_cooldown_and_doubles_on_repeat() {
        let p = pool(vec!["http://a"]);
        for _ in 0..1 {
            let _ = p
                .call(|url| async move {
                    Err::<(), _>(TransportError::Status {
                        url,
                        status: 429,
                        body_prefix: "too many requests".into(),
                    })
                })
                .await;
        }
        let snapshot = p.health().await;
        assert_eq!(snapshot.cooling.len(), 1);

        let health = p.health.read().await;
        let h = health.get("http://a").unwrap();
        assert_eq!(h.current_backoff, Some(Duration::from_secs(8)));
    }

    #[tokio::test]
    async fn permission_error_bans_endpoint() {
        let p = pool(vec!["http://a", "http://b"]);
        let _ = p
            .call(|url| async move {
                Err::<(), _>(TransportError::Status {
                    url,
                    status: 403,
                    body_prefix: "forbidden".into(),
                })
            })
            .await;
        let snapshot = p.health().await;
        assert_eq!(snapshot.banned.len(), 1);
        assert_eq!(snapshot.banned[0].0, "http://a");
    }

    #[tokio::test]
    async fn no_healthy_endpoint_and_not_degradable_returns_no_endpoint() {
        let p = pool(vec!["http://a"]);
        {
            let mut health = p.health.write().await;
            let h = health.get_mut("http://a").unwrap();
            h.cooldown_until = Some(Instant::now() + Duration::from_secs(30));
        }
        let result = p.call(|url| async move { Ok::<_, TransportError>(url) }).await;
        assert!(matches!(result, Err(PoolError::NoEndpoint)));
    }

    #[tokio::test]
    async fn success_clears_cooldown_and_backoff() {
        let p = pool(vec!["http://a"]);
        {
            let mut health = p.health.write().await;
            let h = health.get_mut("http://a").unwrap();
            h.cooldown_until = Some(Instant::now().checked_sub(Duration::from_millis(1)).unwrap_or_else(Instant::now));
            h.current_backoff = Some(Duration::from_secs(16));
        }
        let result = p.call(|url| async move { Ok::<_, TransportError>(url) }).await;
        assert!(result.is_ok());
        let health = p.health.read().await;
        let h = health.get("http://a").unwrap();
        assert!(h.cooldown_until.is_none());
        assert!(h.current_backoff.is_none());
    }
}

//! Per-credential outbound rate limiting.
//!
//! The supplies API limits requests per account, and several users may
//! share one API key, so buckets are keyed by [`CredentialKey`].

use crate::SourceError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use slotwatch_core::CredentialKey;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Rate limit applied to each credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum requests per window
    pub max_requests: u32,
    /// Time window in milliseconds
    pub window_ms: u64,
    /// Minimum delay between requests in milliseconds
    pub min_delay_ms: u64,
    /// Longest a caller will wait for a token before giving up
    pub max_wait_ms: u64,
}

impl RateLimitConfig {
    pub const fn new(max_requests: u32, window_ms: u64, min_delay_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
            min_delay_ms,
            max_wait_ms: 15_000,
        }
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl Default for RateLimitConfig {
    /// The acceptance coefficients endpoint allows 6 requests a minute per account.
    fn default() -> Self {
        Self::new(6, 60_000, 1_000)
    }
}

/// Token bucket for a single credential.
#[derive(Debug)]
pub struct TokenBucket {
    config: RateLimitConfig,
    tokens: f64,
    last_update: Instant,
    last_send: Option<Instant>,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            tokens: config.max_requests as f64,
            last_update: Instant::now(),
            last_send: None,
            config,
        }
    }

    fn replenish(&mut self) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_update).as_millis() as f64;
        let window_ms = self.config.window_ms.max(1) as f64;
        let tokens_to_add = (elapsed_ms / window_ms) * self.config.max_requests as f64;

        self.tokens = (self.tokens + tokens_to_add).min(self.config.max_requests as f64);
        self.last_update = now;
    }

    /// Returns `true` if a token was acquired, `false` if rate limited.
    pub fn try_acquire(&mut self) -> bool {
        self.replenish();

        if let Some(last) = self.last_send {
            if last.elapsed() < self.config.min_delay() {
                return false;
            }
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.last_send = Some(Instant::now());
            true
        } else {
            false
        }
    }

    /// Returns `Duration::ZERO` if a token is available now.
    pub fn time_until_available(&mut self) -> Duration {
        self.replenish();

        if let Some(last) = self.last_send {
            let since_last = last.elapsed();
            let min_delay = self.config.min_delay();
            if since_last < min_delay {
                return min_delay - since_last;
            }
        }

        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            let tokens_needed = 1.0 - self.tokens;
            let time_per_token =
                self.config.window_ms as f64 / self.config.max_requests.max(1) as f64;
            Duration::from_millis((tokens_needed * time_per_token).ceil() as u64)
        }
    }

    /// Full and unused for a whole window: indistinguishable from a new bucket.
    pub fn is_idle(&mut self) -> bool {
        self.replenish();

        let quiet_for = Duration::from_millis(self.config.window_ms).max(self.config.min_delay());
        self.tokens >= self.config.max_requests as f64
            && self.last_send.map_or(true, |last| last.elapsed() >= quiet_for)
    }
}

/// Outcome of asking the limiter for a request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed now; a token has been consumed.
    Permit,
    /// No token yet; one frees up after this long.
    Wait(Duration),
}

/// Token buckets keyed by credential fingerprint.
#[derive(Debug)]
pub struct CredentialRateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<CredentialKey, TokenBucket>,
}

impl CredentialRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take a token for `key` if one is available.
    pub fn acquire(&self, key: &CredentialKey) -> Admission {
        let mut bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| TokenBucket::new(self.config));

        if bucket.try_acquire() {
            Admission::Permit
        } else {
            Admission::Wait(bucket.time_until_available())
        }
    }

    /// Wait for a token for at most `max_wait`.
    ///
    /// Fails with [`SourceError::RateLimited`] when the next token is further
    /// away than the remaining budget.
    pub async fn acquire_within(
        &self,
        key: &CredentialKey,
        max_wait: Duration,
    ) -> Result<(), SourceError> {
        let deadline = Instant::now() + max_wait;

        loop {
            match self.acquire(key) {
                Admission::Permit => return Ok(()),
                Admission::Wait(wait) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if wait > remaining {
                        debug!(credential = %key, wait_ms = wait.as_millis() as u64, "Rate limit budget exhausted");
                        return Err(SourceError::RateLimited { retry_after: wait });
                    }
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Drop buckets that have been idle for a full window.
    ///
    /// Keys rotate and users leave, so without this the map keeps one bucket
    /// per credential ever seen. An evicted key that comes back starts from a
    /// full bucket, which is what it would have had anyway.
    pub fn evict_idle(&self) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_idle());
        before.saturating_sub(self.buckets.len())
    }

    pub fn tracked_credentials(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotwatch_core::Credential;

    fn key(name: &str) -> CredentialKey {
        Credential::new(name).key()
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_denies_beyond_capacity() {
        let limiter = CredentialRateLimiter::new(RateLimitConfig::new(2, 60_000, 0));
        let k = key("a");

        assert_eq!(limiter.acquire(&k), Admission::Permit);
        assert_eq!(limiter.acquire(&k), Admission::Permit);
        match limiter.acquire(&k) {
            Admission::Wait(wait) => {
                assert!(wait > Duration::ZERO);
                assert!(wait <= Duration::from_secs(30));
            }
            Admission::Permit => panic!("third request should be limited"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_are_per_credential() {
        let limiter = CredentialRateLimiter::new(RateLimitConfig::new(1, 60_000, 0));

        assert_eq!(limiter.acquire(&key("a")), Admission::Permit);
        assert_eq!(limiter.acquire(&key("b")), Admission::Permit);
        assert!(matches!(limiter.acquire(&key("a")), Admission::Wait(_)));
        assert_eq!(limiter.tracked_credentials(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_keeps_recently_used_buckets() {
        let limiter = CredentialRateLimiter::new(RateLimitConfig::new(2, 10_000, 0));

        assert_eq!(limiter.acquire(&key("old")), Admission::Permit);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(limiter.acquire(&key("fresh")), Admission::Permit);

        assert_eq!(limiter.evict_idle(), 0);
        assert_eq!(limiter.tracked_credentials(), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(limiter.evict_idle(), 1);
        assert_eq!(limiter.tracked_credentials(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.evict_idle(), 1);
        assert_eq!(limiter.tracked_credentials(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_credential_starts_with_full_budget() {
        let limiter = CredentialRateLimiter::new(RateLimitConfig::new(1, 10_000, 0));
        let k = key("a");

        assert_eq!(limiter.acquire(&k), Admission::Permit);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.evict_idle(), 1);

        assert_eq!(limiter.acquire(&k), Admission::Permit);
        assert!(matches!(limiter.acquire(&k), Admission::Wait(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_delay_is_enforced() {
        let limiter = CredentialRateLimiter::new(RateLimitConfig::new(10, 1_000, 500));
        let k = key("a");

        assert_eq!(limiter.acquire(&k), Admission::Permit);
        assert!(matches!(limiter.acquire(&k), Admission::Wait(_)));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(limiter.acquire(&k), Admission::Permit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_within_waits_for_refill() {
        let limiter = CredentialRateLimiter::new(RateLimitConfig::new(1, 1_000, 0));
        let k = key("a");

        limiter.acquire_within(&k, Duration::from_secs(5)).await.unwrap();
        let started = Instant::now();
        limiter.acquire_within(&k, Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_within_gives_up_past_budget() {
        let limiter = CredentialRateLimiter::new(RateLimitConfig::new(1, 60_000, 0));
        let k = key("a");

        limiter.acquire_within(&k, Duration::from_secs(1)).await.unwrap();
        let err = limiter
            .acquire_within(&k, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::RateLimited { .. }));
    }
}

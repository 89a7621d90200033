use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client};
use service_core::error::AppError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{RateLimitConfig, RedisConfig};
use crate::uid::Id;

/// Fixed-window counters shared by every replica.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key`, starting a window of `window` on the first hit.
    /// Returns the count and the seconds left in the window.
    async fn increment(&self, key: &str, window: Duration) -> Result<(u64, u64), AppError>;
    /// The current count and seconds left, or zeros when no window is open.
    async fn get(&self, key: &str) -> Result<(u64, u64), AppError>;
    async fn reset(&self, key: &str) -> Result<(), AppError>;
    async fn health_check(&self) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct RedisCounters {
    manager: ConnectionManager,
}

impl RedisCounters {
    pub async fn new(config: &RedisConfig) -> Result<Self, AppError> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            AppError::RedisError(e)
        })?;

        tracing::info!("Successfully connected to Redis");
        Ok(Self { manager })
    }

    async fn ttl(&self, key: &str) -> Result<u64, AppError> {
        let mut conn = self.manager.clone();
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl.max(0) as u64)
    }
}

#[async_trait]
impl CounterStore for RedisCounters {
    async fn increment(&self, key: &str, window: Duration) -> Result<(u64, u64), AppError> {
        let mut conn = self.manager.clone();
        let secs = window.as_secs().max(1);
        // EXPIRE NX only starts the window; later hits leave the TTL alone.
        let (count, ttl): (u64, i64) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(secs)
            .arg("NX")
            .ignore()
            .cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok((count, ttl.max(0) as u64))
    }

    async fn get(&self, key: &str) -> Result<(u64, u64), AppError> {
        let mut conn = self.manager.clone();
        let count: Option<u64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        match count {
            Some(count) => Ok((count, self.ttl(key).await?)),
            None => Ok((0, 0)),
        }
    }

    async fn reset(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(AppError::RedisError)
    }
}

/// Expired windows are swept after this many increments.
const PRUNE_EVERY: u64 = 1024;

/// In-process counters; limits are per replica.
#[derive(Default)]
pub struct MemoryCounters {
    windows: DashMap<String, (Instant, Duration, u64)>,
    increments: AtomicU64,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn remaining(started: Instant, window: Duration, now: Instant) -> Option<u64> {
        let end = started + window;
        if end <= now {
            return None;
        }
        let left = end - now;
        Some(left.as_secs() + u64::from(left.subsec_nanos() > 0))
    }

    fn prune(&self, now: Instant) {
        self.windows
            .retain(|_, (started, window, _)| Self::remaining(*started, *window, now).is_some());
    }
}

#[async_trait]
impl CounterStore for MemoryCounters {
    async fn increment(&self, key: &str, window: Duration) -> Result<(u64, u64), AppError> {
        let now = Instant::now();
        if self.increments.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune(now);
        }
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert((now, window, 0));
        if Self::remaining(entry.0, entry.1, now).is_none() {
            *entry = (now, window, 0);
        }
        entry.2 += 1;
        let left = Self::remaining(entry.0, entry.1, now).unwrap_or(0);
        Ok((entry.2, left))
    }

    async fn get(&self, key: &str) -> Result<(u64, u64), AppError> {
        let now = Instant::now();
        Ok(match self.windows.get(key) {
            Some(entry) => match Self::remaining(entry.0, entry.1, now) {
                Some(left) => (entry.2, left),
                None => (0, 0),
            },
            None => (0, 0),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), AppError> {
        self.windows.remove(key);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

const MINUTE: Duration = Duration::from_secs(60);

/// Request ceilings per organization plus login throttling and lockout.
#[derive(Clone)]
pub struct Limiter {
    counters: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl Limiter {
    pub fn new(counters: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { counters, config }
    }

    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self::new(Arc::new(MemoryCounters::new()), config)
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.counters.health_check().await
    }

    pub async fn check_organization(&self, org_id: Id) -> Result<(), AppError> {
        let limit = self.config.org_requests_per_minute;
        if limit == 0 {
            return Ok(());
        }
        let key = format!("ratelimit:org:{}", org_id);
        let (count, left) = self.counters.increment(&key, MINUTE).await?;
        if count > u64::from(limit) {
            tracing::debug!(org_id = %org_id, count, "Organization rate limit exceeded");
            return Err(AppError::TooManyRequests(
                "rate limit exceeded".to_string(),
                Some(left.max(1)),
            ));
        }
        Ok(())
    }

    /// Counts one login attempt for `name` in `org_id`, successful or not.
    pub async fn check_login_attempt(&self, name: &str, org_id: Id) -> Result<(), AppError> {
        let limit = self.config.login_attempts_per_minute;
        if limit == 0 {
            return Ok(());
        }
        let key = format!("ratelimit:login:{}:{}", org_id, name);
        let (count, left) = self.counters.increment(&key, MINUTE).await?;
        if count > u64::from(limit) {
            return Err(AppError::TooManyRequests(
                "too many login attempts, try again later".to_string(),
                Some(left.max(1)),
            ));
        }
        Ok(())
    }

    fn lockout_key(name: &str, org_id: Id) -> String {
        format!("lockout:{}:{}", name, org_id)
    }

    pub async fn check_lockout(&self, name: &str, org_id: Id) -> Result<(), AppError> {
        let threshold = self.config.lockout_threshold;
        if threshold == 0 {
            return Ok(());
        }
        let (failures, left) = self.counters.get(&Self::lockout_key(name, org_id)).await?;
        if failures >= u64::from(threshold) {
            return Err(AppError::TooManyRequests(
                "too many failed login attempts, try again later".to_string(),
                Some(left.max(1)),
            ));
        }
        Ok(())
    }

    pub async fn login_failed(&self, name: &str, org_id: Id) -> Result<(), AppError> {
        let (failures, _) = self
            .counters
            .increment(&Self::lockout_key(name, org_id), self.config.lockout_duration)
            .await?;
        if failures == u64::from(self.config.lockout_threshold) {
            tracing::info!(name = %name, org_id = %org_id, "Account locked after failed logins");
        }
        Ok(())
    }

    pub async fn login_succeeded(&self, name: &str, org_id: Id) -> Result<(), AppError> {
        self.counters.reset(&Self::lockout_key(name, org_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            org_requests_per_minute: 2,
            login_attempts_per_minute: 3,
            lockout_threshold: 2,
            lockout_duration: Duration::from_secs(60),
            signup_per_ip_per_hour: 10,
        }
    }

    #[tokio::test]
    async fn memory_window_expires() {
        let counters = MemoryCounters::new();
        let (count, left) = counters
            .increment("k", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(left >= 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counters.get("k").await.unwrap(), (0, 0));
        assert_eq!(counters.increment("k", MINUTE).await.unwrap().0, 1);
    }

    #[tokio::test]
    async fn organizations_are_limited_independently() {
        let limiter = Limiter::in_memory(config());
        let a = Id(1);
        let b = Id(2);
        assert!(limiter.check_organization(a).await.is_ok());
        assert!(limiter.check_organization(a).await.is_ok());
        let err = limiter.check_organization(a).await.unwrap_err();
        assert!(matches!(err, AppError::TooManyRequests(_, Some(_))));
        assert!(limiter.check_organization(b).await.is_ok());
    }

    #[tokio::test]
    async fn zero_disables_the_organization_limit() {
        let mut cfg = config();
        cfg.org_requests_per_minute = 0;
        let limiter = Limiter::in_memory(cfg);
        for _ in 0..50 {
            assert!(limiter.check_organization(Id(1)).await.is_ok());
        }
    }

    #[tokio::test]
    async fn lockout_after_threshold_and_reset_on_success() {
        let limiter = Limiter::in_memory(config());
        let org = Id(7);
        limiter.login_failed("hubert", org).await.unwrap();
        assert!(limiter.check_lockout("hubert", org).await.is_ok());
        limiter.login_failed("hubert", org).await.unwrap();
        assert!(limiter.check_lockout("hubert", org).await.is_err());
        // same name in another organization is unaffected
        assert!(limiter.check_lockout("hubert", Id(8)).await.is_ok());

        limiter.login_succeeded("hubert", org).await.unwrap();
        assert!(limiter.check_lockout("hubert", org).await.is_ok());
    }

    #[tokio::test]
    async fn login_attempts_are_throttled() {
        let limiter = Limiter::in_memory(config());
        let org = Id(1);
        for _ in 0..3 {
            assert!(limiter.check_login_attempt("a@example.com", org).await.is_ok());
        }
        assert!(limiter.check_login_attempt("a@example.com", org).await.is_err());
        // the same name signing in to another organization has its own budget
        assert!(limiter.check_login_attempt("a@example.com", Id(2)).await.is_ok());
    }

    #[tokio::test]
    async fn expired_windows_are_swept() {
        let counters = MemoryCounters::new();
        for i in 0..PRUNE_EVERY - 1 {
            counters
                .increment(&format!("short-{}", i), Duration::from_millis(10))
                .await
                .unwrap();
        }
        assert_eq!(counters.windows.len() as u64, PRUNE_EVERY - 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        counters.increment("long", MINUTE).await.unwrap();
        assert_eq!(counters.windows.len(), 1);
        assert_eq!(counters.get("long").await.unwrap().0, 1);
    }
}

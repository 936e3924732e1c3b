//! Fixed-window, per-client rate limiting.
//!
//! Each traffic class (global, auth, per-service API) owns an independent
//! [`FixedWindowLimiter`] whose counters live in an `scc::HashMap` keyed by
//! client identity. The read used for the admission decision and the
//! increment happen under the same entry lock, so concurrent requests from one
//! client can never be admitted past the limit.
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::{task::JoinHandle, time::Instant};

use crate::{
    config::{GatewayConfig, WindowLimitConfig},
    error::GatewayError,
};

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Which limiter instance a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LimiterClass {
    Global,
    Auth,
    /// Per-service API limiter
    Api(String),
}

impl fmt::Display for LimiterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterClass::Global => write!(f, "global"),
            LimiterClass::Auth => write!(f, "auth"),
            LimiterClass::Api(service) => write!(f, "api:{service}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateWindowCounter {
    pub window_started_at: Instant,
    pub count: u32,
}

impl RateWindowCounter {
    fn new(now: Instant) -> Self {
        Self {
            window_started_at: now,
            count: 0,
        }
    }
}

/// Outcome of one admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_after: Duration,
    },
    Denied {
        limit: u32,
        retry_after_secs: u64,
    },
}

/// Quota left after an admitted request, rendered as `RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitQuota {
    pub limit: u32,
    pub remaining: u32,
    pub reset_secs: u64,
}

impl RateLimitQuota {
    /// Write the quota headers. With `overwrite == false` existing values win,
    /// so the innermost limiter's quota is the one reported.
    pub fn apply(&self, headers: &mut HeaderMap, overwrite: bool) {
        if !overwrite && headers.contains_key(&RATELIMIT_LIMIT) {
            return;
        }
        headers.insert(RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(RATELIMIT_RESET, HeaderValue::from(self.reset_secs));
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

pub struct FixedWindowLimiter {
    class: LimiterClass,
    window: Duration,
    max_requests: u32,
    message: String,
    counters: scc::HashMap<String, RateWindowCounter>,
}

impl FixedWindowLimiter {
    pub fn new(class: LimiterClass, window: Duration, max_requests: u32, message: &str) -> Self {
        Self {
            class,
            window,
            max_requests,
            message: message.to_string(),
            counters: scc::HashMap::new(),
        }
    }

    /// Build a limiter from its configuration block.
    pub fn from_config(class: LimiterClass, config: &WindowLimitConfig) -> Result<Self, String> {
        let window = config.window_duration()?;
        if window.is_zero() {
            return Err(format!("Rate limit window for {class} must be longer than zero"));
        }
        if config.max_requests == 0 {
            return Err(format!("Rate limit max_requests for {class} must be greater than 0"));
        }

        tracing::info!(
            "Creating rate limiter: class={}, window={}, max_requests={}",
            class,
            config.window,
            config.max_requests
        );

        Ok(Self::new(class, window, config.max_requests, &config.message))
    }

    pub fn class(&self) -> &LimiterClass {
        &self.class
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Count one request for `client_key` and decide whether it may proceed.
    pub async fn admit(&self, client_key: &str) -> Admission {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry_async(client_key.to_string())
            .await
            .or_insert_with(|| RateWindowCounter::new(now));
        let counter = entry.get_mut();

        if now.duration_since(counter.window_started_at) >= self.window {
            *counter = RateWindowCounter::new(now);
        }

        counter.count = counter.count.saturating_add(1);
        let reset_after = self
            .window
            .saturating_sub(now.duration_since(counter.window_started_at));

        if counter.count > self.max_requests {
            Admission::Denied {
                limit: self.max_requests,
                retry_after_secs: ceil_secs(reset_after),
            }
        } else {
            Admission::Allowed {
                limit: self.max_requests,
                remaining: self.max_requests - counter.count,
                reset_after,
            }
        }
    }

    /// [`admit`](Self::admit) mapped onto the gateway error taxonomy.
    pub async fn check(&self, client_key: &str) -> Result<RateLimitQuota, GatewayError> {
        match self.admit(client_key).await {
            Admission::Allowed {
                limit,
                remaining,
                reset_after,
            } => Ok(RateLimitQuota {
                limit,
                remaining,
                reset_secs: ceil_secs(reset_after),
            }),
            Admission::Denied {
                retry_after_secs, ..
            } => {
                tracing::warn!(
                    "Rate limit exceeded: class={}, client={}, retry_after={}s",
                    self.class,
                    client_key,
                    retry_after_secs
                );
                Err(GatewayError::RateLimitExceeded {
                    message: self.message.clone(),
                    retry_after_secs,
                })
            }
        }
    }

    /// Drop counters whose window has fully elapsed. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let before = self.counters.len();
        self.counters
            .retain_async(|_, counter| now.duration_since(counter.window_started_at) < window)
            .await;
        before.saturating_sub(self.counters.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.counters.len()
    }
}

/// The full set of limiter instances used by the pipeline.
pub struct RateLimiters {
    global: FixedWindowLimiter,
    auth: FixedWindowLimiter,
    api: HashMap<String, FixedWindowLimiter>,
}

impl RateLimiters {
    /// One global limiter, one auth limiter and one API limiter per service.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, String> {
        let limits = &config.rate_limits;
        let mut api = HashMap::with_capacity(config.services.len());
        for service in config.services.keys() {
            api.insert(
                service.clone(),
                FixedWindowLimiter::from_config(LimiterClass::Api(service.clone()), &limits.api)?,
            );
        }

        Ok(Self {
            global: FixedWindowLimiter::from_config(LimiterClass::Global, &limits.global)?,
            auth: FixedWindowLimiter::from_config(LimiterClass::Auth, &limits.auth)?,
            api,
        })
    }

    pub fn get(&self, class: &LimiterClass) -> Option<&FixedWindowLimiter> {
        match class {
            LimiterClass::Global => Some(&self.global),
            LimiterClass::Auth => Some(&self.auth),
            LimiterClass::Api(service) => self.api.get(service),
        }
    }

    pub async fn check(
        &self,
        class: &LimiterClass,
        client_key: &str,
    ) -> Result<RateLimitQuota, GatewayError> {
        match self.get(class) {
            Some(limiter) => limiter.check(client_key).await,
            None => Err(GatewayError::Internal(format!(
                "No rate limiter registered for {class}"
            ))),
        }
    }

    pub async fn purge_expired(&self) -> usize {
        let mut removed = self.global.purge_expired().await + self.auth.purge_expired().await;
        for limiter in self.api.values() {
            removed += limiter.purge_expired().await;
        }
        removed
    }

    /// Periodically drop stale windows so idle clients do not accumulate.
    pub fn spawn_purge_task(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let removed = self.purge_expired().await;
                if removed > 0 {
                    tracing::debug!("Purged {} expired rate-limit windows", removed);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(window_secs: u64, max: u32) -> FixedWindowLimiter {
        FixedWindowLimiter::new(
            LimiterClass::Global,
            Duration::from_secs(window_secs),
            max,
            "Too many requests from this IP",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_denies_request_past_the_limit() {
        let limiter = limiter(900, 100);
        for i in 0..100 {
            match limiter.admit("10.0.0.1").await {
                Admission::Allowed { remaining, .. } => assert_eq!(remaining, 99 - i),
                other => panic!("request {i} denied: {other:?}"),
            }
        }

        match limiter.admit("10.0.0.1").await {
            Admission::Denied {
                retry_after_secs, ..
            } => assert!(retry_after_secs <= 900 && retry_after_secs > 0),
            other => panic!("expected denial, got {other:?}"),
        }

        // Other clients are tracked independently
        assert!(matches!(
            limiter.admit("10.0.0.2").await,
            Admission::Allowed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_hint_counts_down() {
        let limiter = limiter(60, 1);
        limiter.admit("c").await;
        tokio::time::advance(Duration::from_millis(20_500)).await;
        assert_eq!(
            limiter.admit("c").await,
            Admission::Denied {
                limit: 1,
                retry_after_secs: 40
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_exactly_at_boundary() {
        let limiter = limiter(60, 2);
        limiter.admit("c").await;
        limiter.admit("c").await;
        assert!(matches!(limiter.admit("c").await, Admission::Denied { .. }));

        tokio::time::advance(Duration::from_millis(59_999)).await;
        assert!(matches!(limiter.admit("c").await, Admission::Denied { .. }));

        tokio::time::advance(Duration::from_millis(1)).await;
        match limiter.admit("c").await {
            Admission::Allowed { remaining, .. } => assert_eq!(remaining, 1),
            other => panic!("expected fresh window, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_admissions_never_exceed_limit() {
        let limiter = Arc::new(limiter(60, 10));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.admit("burst").await }));
        }

        let mut allowed = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Admission::Allowed { .. }) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_maps_to_gateway_error() {
        let limiter = limiter(900, 1);
        let quota = limiter.check("c").await.unwrap();
        assert_eq!(quota.limit, 1);
        assert_eq!(quota.remaining, 0);
        assert_eq!(quota.reset_secs, 900);

        let err = limiter.check("c").await.unwrap_err();
        assert_eq!(err.error_code(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(err.user_message(), "Too many requests from this IP");
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_drops_only_expired_windows() {
        let limiter = limiter(60, 5);
        limiter.admit("old").await;
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.admit("new").await;
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(limiter.purge_expired().await, 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test]
    async fn test_limiter_set_from_default_config() {
        let limiters = RateLimiters::from_config(&GatewayConfig::default()).unwrap();
        assert_eq!(limiters.get(&LimiterClass::Global).unwrap().max_requests(), 100);
        assert_eq!(limiters.get(&LimiterClass::Auth).unwrap().max_requests(), 10);
        let api = limiters
            .get(&LimiterClass::Api("productos".to_string()))
            .unwrap();
        assert_eq!(api.window(), Duration::from_secs(60));
        assert!(limiters.get(&LimiterClass::Api("pedidos".to_string())).is_none());

        let err = limiters
            .check(&LimiterClass::Api("pedidos".to_string()), "c")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INTERNAL_SERVER_ERROR");
    }

    #[test]
    fn test_quota_headers_innermost_wins() {
        let mut headers = HeaderMap::new();
        RateLimitQuota {
            limit: 50,
            remaining: 49,
            reset_secs: 60,
        }
        .apply(&mut headers, true);
        RateLimitQuota {
            limit: 100,
            remaining: 10,
            reset_secs: 900,
        }
        .apply(&mut headers, false);
        assert_eq!(headers[RATELIMIT_LIMIT], "50");
        assert_eq!(headers[RATELIMIT_REMAINING], "49");
        assert_eq!(headers[RATELIMIT_RESET], "60");
    }
}

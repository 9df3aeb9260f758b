//! Per-key token-bucket rate limiting
//!
//! Each key (normally a client IP, see [`client_key`]) gets its own bucket,
//! created on first use. Buckets refill continuously at `requests_per_second`
//! up to `burst` tokens and are evaluated lazily at request time. Buckets that
//! stay idle longer than `idle_ttl` are evicted by [`KeyedRateLimiter::sweep_idle`].

use crate::config::RateLimitConfig;
use crate::errors::{ConfigError, RateLimited};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Limit metadata for client-facing headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Bucket capacity
    pub limit: u32,
    /// Whole tokens left after this request
    pub remaining: u32,
    /// Approximate time the caller may expect a fresh token
    pub reset_at: SystemTime,
}

impl Quota {
    pub fn reset_epoch_secs(&self) -> u64 {
        self.reset_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// `X-RateLimit-*` header names and values
    pub fn header_pairs(&self) -> [(&'static str, String); 3] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_epoch_secs().to_string()),
        ]
    }
}

/// Successful admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Limiting is disabled; nothing was tracked
    Unlimited,
    Granted(Quota),
}

impl Admission {
    pub fn quota(&self) -> Option<&Quota> {
        match self {
            Admission::Unlimited => None,
            Admission::Granted(quota) => Some(quota),
        }
    }
}

/// Outcome of asking a bucket for one token
enum Take {
    Now { remaining: u32 },
    /// Token reserved; the caller must wait before using it
    After(Duration),
    Denied { retry_after: Duration },
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
    /// Set by the sweeper once the bucket is no longer in the map
    evicted: bool,
}

impl Bucket {
    fn full(burst: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(burst),
            last_refill: now,
            last_seen: now,
            evicted: false,
        }
    }

    fn refill(&mut self, now: Instant, rate: f64, burst: u32) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(f64::from(burst));
        self.last_refill = now;
    }

    /// Take one token now, or report how long until one is available
    fn try_take(&mut self, now: Instant, rate: f64, burst: u32) -> Result<u32, Duration> {
        self.refill(now, rate, burst);
        self.last_seen = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(self.tokens.floor() as u32)
        } else {
            Err(wait_for(1.0 - self.tokens, rate))
        }
    }

    /// Borrow a token against future refill; later callers queue behind us
    fn reserve(&mut self) {
        self.tokens -= 1.0;
    }

    /// Idle past `idle_ttl` and refilled to capacity, so a fresh bucket is equivalent
    fn is_idle(&self, now: Instant, idle_ttl: Duration, rate: f64, burst: u32) -> bool {
        let refilled = now.saturating_duration_since(self.last_refill).as_secs_f64() * rate;
        now.saturating_duration_since(self.last_seen) >= idle_ttl
            && self.tokens + refilled >= f64::from(burst)
    }
}

fn wait_for(deficit: f64, rate: f64) -> Duration {
    Duration::try_from_secs_f64(deficit / rate).unwrap_or(Duration::MAX)
}

#[derive(Debug)]
pub struct KeyedRateLimiter {
    config: RateLimitConfig,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl KeyedRateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Number of keys currently holding a bucket
    pub fn tracked_keys(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Admit or reject one request for `key` without waiting
    pub fn check(&self, key: &str) -> Result<Admission, RateLimited> {
        if !self.config.enabled {
            return Ok(Admission::Unlimited);
        }
        let (rate, burst) = (self.config.requests_per_second, self.config.burst);
        self.with_bucket(key, |bucket, now| bucket.try_take(now, rate, burst))
            .map(|remaining| Admission::Granted(self.quota(remaining)))
            .map_err(|retry_after| self.rejected(key, retry_after))
    }

    /// Admit one request for `key`, waiting up to `max_wait` for a token
    pub async fn acquire(&self, key: &str) -> Result<Admission, RateLimited> {
        if !self.config.enabled {
            return Ok(Admission::Unlimited);
        }
        let (rate, burst) = (self.config.requests_per_second, self.config.burst);
        let max_wait = self.config.max_wait();
        let take = self.with_bucket(key, |bucket, now| match bucket.try_take(now, rate, burst) {
            Ok(remaining) => Take::Now { remaining },
            Err(wait) if !max_wait.is_zero() && wait <= max_wait => {
                bucket.reserve();
                Take::After(wait)
            }
            Err(retry_after) => Take::Denied { retry_after },
        });

        match take {
            Take::Now { remaining } => Ok(Admission::Granted(self.quota(remaining))),
            Take::After(wait) => {
                tracing::debug!(key, wait_ms = wait.as_millis() as u64, "waiting for token");
                tokio::time::sleep(wait).await;
                Ok(Admission::Granted(self.quota(0)))
            }
            Take::Denied { retry_after } => Err(self.rejected(key, retry_after)),
        }
    }

    /// Evict buckets not touched for `idle_ttl` that have refilled to
    /// capacity; returns how many were removed
    pub fn sweep_idle(&self) -> usize {
        let idle_ttl = self.config.idle_ttl();
        let (rate, burst) = (self.config.requests_per_second, self.config.burst);
        let now = Instant::now();
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();

        buckets.retain(|_, bucket| {
            let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            if bucket.is_idle(now, idle_ttl, rate, burst) {
                bucket.evicted = true;
                false
            } else {
                true
            }
        });

        let evicted = before - buckets.len();
        if evicted > 0 {
            tracing::info!(evicted, remaining = buckets.len(), "evicted idle rate limit buckets");
        }
        evicted
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `sweep_interval` on the
    /// current tokio runtime. The task ends once the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        let every = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match limiter.upgrade() {
                    Some(limiter) => {
                        limiter.sweep_idle();
                    }
                    None => break,
                }
            }
        })
    }

    /// Run `f` on the live bucket for `key`, looking it up again if the
    /// sweeper evicted it between lookup and lock
    fn with_bucket<R>(&self, key: &str, mut f: impl FnMut(&mut Bucket, Instant) -> R) -> R {
        loop {
            let bucket = self.bucket(key);
            let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            if !bucket.evicted {
                return f(&mut bucket, Instant::now());
            }
        }
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return bucket.clone();
        }

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                tracing::debug!(key, "tracking new rate limit key");
                Arc::new(Mutex::new(Bucket::full(self.config.burst, Instant::now())))
            })
            .clone()
    }

    fn quota(&self, remaining: u32) -> Quota {
        Quota {
            limit: self.config.burst,
            remaining,
            reset_at: SystemTime::now() + Duration::from_secs(1),
        }
    }

    fn rejected(&self, key: &str, retry_after: Duration) -> RateLimited {
        tracing::debug!(key, retry_after_ms = retry_after.as_millis() as u64, "rate limit exceeded");
        RateLimited {
            key: key.to_string(),
            quota: self.quota(0),
            retry_after,
        }
    }
}

/// Derive the limiter key for a request.
///
/// Precedence: first entry of `X-Forwarded-For`, then `X-Real-IP`, then the
/// peer address. Ports are stripped, including from bracketed IPv6 addresses.
pub fn client_key(forwarded_for: Option<&str>, real_ip: Option<&str>, peer: &str) -> String {
    let forwarded = forwarded_for
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let real_ip = real_ip.map(str::trim).filter(|value| !value.is_empty());

    strip_port(forwarded.or(real_ip).unwrap_or(peer.trim()))
}

fn strip_port(addr: &str) -> String {
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return socket.ip().to_string();
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return ip.to_string();
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host.to_string(),
        _ => addr.to_string(),
    }
}

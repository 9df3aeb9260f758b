//! Serde-backed configuration for the whole resilience layer
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! Durations are plain integers whose unit is part of the field name.
//!
//! ```toml
//! [circuit_breaker]
//! max_requests = 3
//! success_threshold = 2
//! timeout_secs = 30
//!
//! [circuit_breaker.trip]
//! kind = "failure_rate"
//! ratio = 0.5
//! minimum_requests = 10
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 200
//!
//! [rate_limit]
//! requests_per_second = 10.0
//! burst = 20
//!
//! [idempotency]
//! ttl_secs = 86400
//! ```

use crate::builder::{self, CircuitBuilder};
use crate::circuit::Settings;
use crate::counts::TripPolicy;
use crate::errors::ConfigError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub circuit_breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub idempotency: IdempotencyConfig,
}

impl ResilienceConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!(path = %path.display(), "loaded resilience configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        self.retry.policy().validate()?;
        self.rate_limit.validate()?;
        self.idempotency.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub max_requests: u32,
    pub success_threshold: u32,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub jitter_factor: f64,
    pub trip: TripPolicy,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            max_requests: settings.max_requests,
            success_threshold: settings.success_threshold,
            interval_secs: settings.interval.as_secs(),
            timeout_secs: settings.timeout.as_secs(),
            jitter_factor: settings.jitter_factor,
            trip: TripPolicy::default(),
        }
    }
}

impl BreakerConfig {
    pub fn settings(&self) -> Settings {
        Settings {
            max_requests: self.max_requests,
            success_threshold: self.success_threshold,
            interval: Duration::from_secs(self.interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
            jitter_factor: self.jitter_factor,
        }
    }

    /// Builder preloaded with these settings; callbacks and a classifier can
    /// still be attached before `build()`
    pub fn builder(&self, name: impl Into<String>) -> CircuitBuilder {
        CircuitBuilder::new(name)
            .max_requests(self.max_requests)
            .success_threshold(self.success_threshold)
            .interval(Duration::from_secs(self.interval_secs))
            .timeout(Duration::from_secs(self.timeout_secs))
            .jitter_factor(self.jitter_factor)
            .trip_policy(self.trip)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        builder::validate(&self.settings())?;
        if let TripPolicy::FailureRate { ratio, .. } = self.trip
            && !(0.0..=1.0).contains(&ratio)
        {
            return Err(ConfigError::invalid("trip.ratio", "must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter_factor: policy.jitter_factor,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter_factor: self.jitter_factor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// When false every request is admitted and nothing is tracked
    pub enabled: bool,
    pub requests_per_second: f64,
    /// Bucket capacity, also the initial token count for a new key
    pub burst: u32,
    /// Longest `acquire` will wait for a token; zero never waits
    pub max_wait_ms: u64,
    /// Buckets untouched for this long are evicted by the sweeper
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 10.0,
            burst: 20,
            max_wait_ms: 0,
            idle_ttl_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return Err(ConfigError::invalid(
                "requests_per_second",
                "must be a positive number",
            ));
        }
        if self.burst == 0 {
            return Err(ConfigError::invalid("burst", "must be at least 1"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid("sweep_interval_secs", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub ttl_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { ttl_secs: 24 * 60 * 60 }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_secs == 0 {
            return Err(ConfigError::invalid("ttl_secs", "must be at least 1"));
        }
        Ok(())
    }
}

//! Builder API for ergonomic circuit breaker configuration

use crate::{
    callbacks::Callbacks,
    circuit::{CircuitBreaker, CircuitContext, CircuitState, MAX_WINDOW, Settings},
    classifier::FailureClassifier,
    counts::{Counts, Tally, TripPolicy},
    errors::ConfigError,
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder {
    name: String,
    settings: Settings,
    ready_to_trip: Option<Arc<dyn Fn(&Counts) -> bool + Send + Sync>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: Settings::default(),
            ready_to_trip: None,
            failure_classifier: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Number of trial calls admitted while half-open
    pub fn max_requests(mut self, max_requests: u32) -> Self {
        self.settings.max_requests = max_requests;
        self
    }

    /// Successful trial calls required to close from half-open (default 1)
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.settings.success_threshold = threshold;
        self
    }

    /// Closed-state window after which counts are cleared; zero disables roll-over
    pub fn interval(mut self, interval: Duration) -> Self {
        self.settings.interval = interval;
        self
    }

    /// How long the circuit stays open before allowing a probe
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout = timeout;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.settings.jitter_factor = factor;
        self
    }

    /// Decide when a closed circuit opens, from the current generation's counts
    pub fn trip_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.ready_to_trip = Some(Arc::new(predicate));
        self
    }

    /// Use one of the ready-made trip policies
    pub fn trip_policy(self, policy: TripPolicy) -> Self {
        self.trip_when(move |counts| policy.should_trip(counts))
    }

    /// Set a classifier deciding which errors count as failures
    ///
    /// Errors the classifier rejects are counted as successes. Use this to
    /// keep "expected" errors like validation failures or client errors (4xx)
    /// from opening the circuit.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use resilience_machines::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let breaker = CircuitBreaker::builder("api")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         ctx.elapsed > Duration::from_secs(1)
    ///     })))
    ///     .build()
    ///     .unwrap();
    /// # assert!(breaker.is_closed());
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Observe every state transition
    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.callbacks.on_state_change = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Validate the settings and build the circuit breaker
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        validate(&self.settings)?;

        let ready_to_trip = self.ready_to_trip.unwrap_or_else(|| {
            let policy = TripPolicy::default();
            Arc::new(move |counts: &Counts| policy.should_trip(counts))
        });

        let context = CircuitContext {
            name: self.name,
            settings: self.settings,
            ready_to_trip,
            tally: Arc::new(Tally::default()),
        };

        Ok(CircuitBreaker::with_parts(
            context,
            self.failure_classifier,
            self.callbacks,
        ))
    }
}

pub(crate) fn validate(settings: &Settings) -> Result<(), ConfigError> {
    if settings.max_requests == 0 {
        return Err(ConfigError::invalid("max_requests", "must be at least 1"));
    }
    if settings.success_threshold == 0 || settings.success_threshold > settings.max_requests {
        return Err(ConfigError::invalid(
            "success_threshold",
            format!("must be between 1 and max_requests ({})", settings.max_requests),
        ));
    }
    if !(0.0..=1.0).contains(&settings.jitter_factor) {
        return Err(ConfigError::invalid("jitter_factor", "must be within 0.0..=1.0"));
    }
    for (field, span) in [("timeout", settings.timeout), ("interval", settings.interval)] {
        if span > MAX_WINDOW {
            return Err(ConfigError::invalid(
                field,
                format!("must not exceed {} seconds", MAX_WINDOW.as_secs()),
            ));
        }
    }
    Ok(())
}

//! Circuit breaker implementation using state machines
//!
//! The breaker owns a dynamic `Circuit` state machine plus the bookkeeping
//! that lives beside it: the generation token, the Closed-window expiry and
//! the shared tally of the current generation. All of it sits behind one
//! mutex. State transitions are evaluated lazily whenever the breaker is
//! inspected; there is no background timer.

use crate::{
    backoff,
    callbacks::Callbacks,
    classifier::{FailureClassifier, FailureContext},
    counts::{Counts, Tally},
    errors::{CircuitError, Rejected},
};
use state_machines::state_machine;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Trip predicate evaluated against the current generation's counts
pub type ReadyToTrip = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;

/// Upper bound accepted for `timeout` and `interval`
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Circuit breaker timing and admission settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Trial calls admitted while HalfOpen
    pub max_requests: u32,
    /// Successful trial calls needed to close from HalfOpen
    pub success_threshold: u32,
    /// Closed-state counting window; zero keeps one generation until a trip
    pub interval: Duration,
    /// How long the circuit stays Open before probing
    pub timeout: Duration,
    /// Jitter factor for `timeout` (0.0 = none, 1.0 = full)
    pub jitter_factor: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_requests: 1,
            success_threshold: 1,
            interval: Duration::ZERO,
            timeout: Duration::from_secs(60),
            jitter_factor: 0.0,
        }
    }
}

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub settings: Settings,
    pub ready_to_trip: ReadyToTrip,
    pub(crate) tally: Arc<Tally>,
}

impl Default for CircuitContext {
    fn default() -> Self {
        let policy = crate::counts::TripPolicy::default();
        Self {
            name: String::new(),
            settings: Settings::default(),
            ready_to_trip: Arc::new(move |counts: &Counts| policy.should_trip(counts)),
            tally: Arc::new(Tally::default()),
        }
    }
}

impl fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("ready_to_trip", &"<closure>")
            .field("counts", &self.tally.snapshot())
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: Option<Instant>,
    /// When the next inspection may move the circuit to HalfOpen
    pub expiry: Option<Instant>,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub successes: u32,
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [timeout_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

impl Circuit<Closed> {
    /// Ask the trip predicate about the current generation
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        (ctx.ready_to_trip)(&ctx.tally.snapshot())
    }
}

impl Circuit<HalfOpen> {
    /// Any failure while probing reopens the circuit
    fn should_open(&self, _ctx: &CircuitContext) -> bool {
        true
    }

    fn should_close(&self, ctx: &CircuitContext) -> bool {
        self.state_data_half_open()
            .is_some_and(|data| data.successes >= ctx.settings.success_threshold)
    }
}

impl Circuit<Open> {
    fn timeout_elapsed(&self, _ctx: &CircuitContext) -> bool {
        self.state_data_open()
            .and_then(|data| data.expiry)
            .is_some_and(|expiry| Instant::now() >= expiry)
    }
}

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_machine(name: &str) -> Self {
        match name {
            "Closed" => CircuitState::Closed,
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            unknown => {
                tracing::error!(state = unknown, "unmapped circuit machine state");
                CircuitState::Closed
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Transition = (CircuitState, CircuitState);

struct Inner {
    machine: DynamicCircuit,
    generation: u64,
    /// End of the current Closed counting window
    window_expiry: Option<Instant>,
}

/// Circuit breaker public API
///
/// Safe to share across threads (`Arc<CircuitBreaker>`); every method takes `&self`.
pub struct CircuitBreaker {
    context: CircuitContext,
    classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker with default settings and trip policy (use builder() for more options)
    pub fn new(name: impl Into<String>) -> Self {
        let context = CircuitContext {
            name: name.into(),
            ..CircuitContext::default()
        };
        Self::with_parts(context, None, Callbacks::new())
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    pub(crate) fn with_parts(
        context: CircuitContext,
        classifier: Option<Arc<dyn FailureClassifier>>,
        callbacks: Callbacks,
    ) -> Self {
        let machine = DynamicCircuit::new(context.clone());
        let window_expiry = window_end(&context.settings, Instant::now());

        Self {
            context,
            classifier,
            callbacks,
            inner: Mutex::new(Inner {
                machine,
                generation: 0,
                window_expiry,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn settings(&self) -> &Settings {
        &self.context.settings
    }

    /// Execute a fallible operation with circuit breaker protection
    ///
    /// Rejected calls never invoke `f`. Errors returned by `f` come back as
    /// [`CircuitError::Execution`] unchanged; the failure classifier only
    /// decides how they are counted.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: 'static,
    {
        let permit = self.allow()?;
        let started = Instant::now();

        match f() {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(error) => {
                if self.is_failure(&error, started.elapsed()) {
                    permit.failure();
                } else {
                    permit.success();
                }
                Err(CircuitError::Execution(error))
            }
        }
    }

    /// Ask for permission to make a call; report the outcome on the returned permit.
    ///
    /// Dropping the permit without reporting counts as a failure.
    pub fn allow(&self) -> Result<Permit<'_>, Rejected> {
        let mut transitions = Vec::new();
        let admitted = {
            let mut inner = self.lock();
            self.before_request(&mut inner, &mut transitions)
        };
        self.notify(&transitions);

        let generation = admitted.inspect_err(|rejection| {
            tracing::debug!(circuit = %self.context.name, %rejection, "call rejected");
        })?;

        Ok(Permit {
            breaker: self,
            generation,
            settled: false,
        })
    }

    /// Current state, applying any transition that is due
    pub fn state(&self) -> CircuitState {
        self.inspect(|inner| CircuitState::from_machine(inner.machine.current_state()))
    }

    /// Counts of the current generation, applying any transition that is due
    pub fn counts(&self) -> Counts {
        self.inspect(|_| self.context.tally.snapshot())
    }

    /// Opaque token of the current generation
    pub fn generation(&self) -> u64 {
        self.inspect(|inner| inner.generation)
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Force the circuit Closed and start a fresh generation
    pub fn reset(&self) {
        let from = {
            let mut inner = self.lock();
            let from = CircuitState::from_machine(inner.machine.current_state());
            inner.machine = DynamicCircuit::new(self.context.clone());
            self.new_generation(&mut inner, Instant::now());
            from
        };

        if from != CircuitState::Closed {
            self.notify(&[(from, CircuitState::Closed)]);
        }
    }

    fn inspect<R>(&self, read: impl FnOnce(&Inner) -> R) -> R {
        let mut transitions = Vec::new();
        let value = {
            let mut inner = self.lock();
            self.refresh(&mut inner, Instant::now(), &mut transitions);
            read(&inner)
        };
        self.notify(&transitions);
        value
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // callbacks and wrapped calls never run under the lock, so a poisoned
        // mutex still holds consistent state
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_failure<E: 'static>(&self, error: &E, elapsed: Duration) -> bool {
        match &self.classifier {
            Some(classifier) => classifier.is_failure(&FailureContext {
                circuit_name: &self.context.name,
                error: error as &dyn std::any::Any,
                elapsed,
            }),
            None => true,
        }
    }

    fn before_request(
        &self,
        inner: &mut Inner,
        transitions: &mut Vec<Transition>,
    ) -> Result<u64, Rejected> {
        let state = self.refresh(inner, Instant::now(), transitions);

        match state {
            CircuitState::Open => {
                return Err(Rejected::Open {
                    circuit: self.context.name.clone(),
                });
            }
            CircuitState::HalfOpen
                if self.context.tally.snapshot().requests >= self.context.settings.max_requests =>
            {
                return Err(Rejected::TooManyRequests {
                    circuit: self.context.name.clone(),
                    limit: self.context.settings.max_requests,
                });
            }
            _ => {}
        }

        self.context.tally.on_request();
        Ok(inner.generation)
    }

    fn after_request(&self, before: u64, success: bool) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.lock();
            let now = Instant::now();
            let state = self.refresh(&mut inner, now, &mut transitions);

            if inner.generation != before {
                tracing::debug!(
                    circuit = %self.context.name,
                    generation = before,
                    current = inner.generation,
                    "dropping result from previous generation"
                );
            } else if success {
                self.on_success(&mut inner, state, now, &mut transitions);
            } else {
                self.on_failure(&mut inner, state, now, &mut transitions);
            }
        }
        self.notify(&transitions);
    }

    fn on_success(
        &self,
        inner: &mut Inner,
        state: CircuitState,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        self.context.tally.on_success();

        if state == CircuitState::HalfOpen {
            if let Some(data) = inner.machine.half_open_data_mut() {
                data.successes += 1;
            }
            if inner.machine.handle(CircuitEvent::Close).is_ok() {
                self.entered(inner, state, now, transitions);
            }
        }
    }

    fn on_failure(
        &self,
        inner: &mut Inner,
        state: CircuitState,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        self.context.tally.on_failure();

        if state != CircuitState::Open && inner.machine.handle(CircuitEvent::Trip).is_ok() {
            self.entered(inner, state, now, transitions);
        }
    }

    /// Apply time-based transitions and return the resulting state
    fn refresh(
        &self,
        inner: &mut Inner,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) -> CircuitState {
        match CircuitState::from_machine(inner.machine.current_state()) {
            CircuitState::Closed => {
                if inner.window_expiry.is_some_and(|expiry| expiry <= now) {
                    self.new_generation(inner, now);
                }
            }
            CircuitState::Open => {
                if inner.machine.handle(CircuitEvent::AttemptReset).is_ok() {
                    self.entered(inner, CircuitState::Open, now, transitions);
                }
            }
            CircuitState::HalfOpen => {}
        }

        CircuitState::from_machine(inner.machine.current_state())
    }

    /// Bookkeeping after the machine moved out of `from`
    fn entered(
        &self,
        inner: &mut Inner,
        from: CircuitState,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        let to = CircuitState::from_machine(inner.machine.current_state());
        self.new_generation(inner, now);

        if to == CircuitState::Open {
            let settings = &self.context.settings;
            let timeout = backoff::jittered(settings.timeout, settings.jitter_factor);
            if let Some(data) = inner.machine.open_data_mut() {
                data.opened_at = Some(now);
                data.expiry = Some(deadline(now, timeout));
            }
        }

        tracing::info!(circuit = %self.context.name, %from, %to, "circuit state changed");
        transitions.push((from, to));
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        self.context.tally.clear();
        inner.window_expiry = match CircuitState::from_machine(inner.machine.current_state()) {
            CircuitState::Closed => window_end(&self.context.settings, now),
            CircuitState::Open | CircuitState::HalfOpen => None,
        };
    }

    fn notify(&self, transitions: &[Transition]) {
        for &(from, to) in transitions {
            self.callbacks.trigger(&self.context.name, from, to);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("context", &self.context)
            .field("classifier", &self.classifier)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

fn window_end(settings: &Settings, now: Instant) -> Option<Instant> {
    (!settings.interval.is_zero()).then(|| deadline(now, settings.interval))
}

/// `now + span`, capped at [`MAX_WINDOW`] and never overflowing the clock
fn deadline(now: Instant, span: Duration) -> Instant {
    now.checked_add(span.min(MAX_WINDOW)).unwrap_or(now)
}

/// Admission ticket returned by [`CircuitBreaker::allow`]
///
/// The outcome is applied only if the breaker is still in the generation the
/// permit was issued in.
#[must_use = "report the call outcome with success() or failure()"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Permit<'_> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn success(mut self) {
        self.settle(true);
    }

    pub fn failure(mut self) {
        self.settle(false);
    }

    fn settle(&mut self, success: bool) {
        self.settled = true;
        self.breaker.after_request(self.generation, success);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.settle(false);
        }
    }
}

impl fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("circuit", &self.breaker.name())
            .field("generation", &self.generation)
            .finish()
    }
}

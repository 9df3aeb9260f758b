//! Observer hooks for circuit breaker state transitions
//!
//! Hooks are for alerting and logging only. They run on the thread that
//! caused the transition, after the breaker's lock has been released.

use crate::circuit::CircuitState;
use std::sync::Arc;

pub type StateChangeFn = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;
pub type StateHookFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks for circuit breaker events
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_state_change: Option<StateChangeFn>,
    pub on_open: Option<StateHookFn>,
    pub on_close: Option<StateHookFn>,
    pub on_half_open: Option<StateHookFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the generic observer, then the hook for the state entered
    pub fn trigger(&self, circuit: &str, from: CircuitState, to: CircuitState) {
        if let Some(ref callback) = self.on_state_change {
            callback(circuit, from, to);
        }

        let hook = match to {
            CircuitState::Open => &self.on_open,
            CircuitState::Closed => &self.on_close,
            CircuitState::HalfOpen => &self.on_half_open,
        };
        if let Some(callback) = hook {
            callback(circuit);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_trigger_fires_generic_then_specific() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let generic = log.clone();
        let opened = log.clone();

        let callbacks = Callbacks {
            on_state_change: Some(Arc::new(move |name, from, to| {
                generic.lock().unwrap().push(format!("{name}: {from} -> {to}"));
            })),
            on_open: Some(Arc::new(move |name| {
                opened.lock().unwrap().push(format!("{name} opened"));
            })),
            ..Callbacks::new()
        };

        callbacks.trigger("pagerduty", CircuitState::Closed, CircuitState::Open);
        callbacks.trigger("pagerduty", CircuitState::Open, CircuitState::HalfOpen);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "pagerduty: closed -> open".to_string(),
                "pagerduty opened".to_string(),
                "pagerduty: open -> half-open".to_string(),
            ]
        );
    }
}

//! Error types shared by the breaker, its configuration and its adapters.

use std::time::Duration;

use crate::resilience::CircuitState;

/// Errors raised while building or manually driving a circuit breaker
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerError {
    /// Missing or non-positive threshold / timeout
    #[error("invalid circuit breaker configuration: {0}")]
    InvalidConfiguration(String),
    /// A forced state change that the transition table does not allow
    #[error("invalid circuit breaker transition from {from} to {to}")]
    InvalidTransition { from: CircuitState, to: CircuitState },
}

/// Default fallback outcome: the call was rejected without running the operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker `{name}` is open, retry in {retry_in:?}")]
pub struct CircuitOpenError {
    /// Name of the breaker that rejected the call
    pub name: String,
    /// Time left before the breaker lets a probe through
    pub retry_in: Duration,
}

/// Outcome of a guarded call that did not produce a value
///
/// `Open` means the breaker rejected the call and the operation never ran.
/// `Inner` carries the operation's own failure, unchanged.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting requests
    #[error(transparent)]
    Open(#[from] CircuitOpenError),
    /// The underlying operation failed
    #[error("Operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the breaker rejected the call
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open(_))
    }

    /// The operation's own failure, if the operation ran and failed
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Inner(err) => Some(err),
            CircuitBreakerError::Open(_) => None,
        }
    }
}

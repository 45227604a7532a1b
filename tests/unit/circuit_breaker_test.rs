//! Behavioural tests for the circuit breaker public API
//!
//! Time never passes on its own here: every breaker runs on a `ManualClock`.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lighter_breaker::config::CircuitBreakerConfig;
use lighter_breaker::resilience::{CircuitBreaker, CircuitState, Clock, ManualClock, TripPolicy};
use lighter_breaker::{BreakerError, CircuitBreakerError};

#[derive(Debug, PartialEq)]
struct UpstreamDown;

impl fmt::Display for UpstreamDown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upstream down")
    }
}

impl std::error::Error for UpstreamDown {}

fn breaker_with(
    threshold: u32,
    timeout: Duration,
    policy: TripPolicy,
) -> (CircuitBreaker<i32>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let cb = CircuitBreaker::builder("inventory")
        .threshold(threshold)
        .timeout(timeout)
        .trip_policy(policy)
        .clock(clock.clone())
        .build()
        .unwrap();
    (cb, clock)
}

fn failing(cb: &CircuitBreaker<i32>) -> Result<i32, CircuitBreakerError<UpstreamDown>> {
    cb.attempt(|| Err(UpstreamDown))
}

// =============================================================================
// Threshold boundaries
// =============================================================================

#[test]
fn test_trips_after_threshold_plus_one_failures() {
    for threshold in 1..=6 {
        let (cb, _) = breaker_with(threshold, Duration::from_secs(5), TripPolicy::ExceedsThreshold);

        for _ in 0..threshold {
            let _ = failing(&cb);
        }
        assert_eq!(cb.state(), CircuitState::Closed, "threshold {}", threshold);
        assert_eq!(cb.failure_count(), threshold);

        let _ = failing(&cb);
        assert_eq!(cb.state(), CircuitState::Open, "threshold {}", threshold);
    }
}

#[test]
fn test_reaches_policy_trips_at_threshold() {
    for threshold in 1..=6 {
        let (cb, _) = breaker_with(threshold, Duration::from_secs(5), TripPolicy::ReachesThreshold);

        for _ in 0..threshold - 1 {
            let _ = failing(&cb);
        }
        assert_eq!(cb.state(), CircuitState::Closed, "threshold {}", threshold);

        let _ = failing(&cb);
        assert_eq!(cb.state(), CircuitState::Open, "threshold {}", threshold);
    }
}

#[test]
fn test_open_breaker_does_not_count_rejections() {
    let (cb, _) = breaker_with(3, Duration::from_secs(5), TripPolicy::ExceedsThreshold);
    for _ in 0..4 {
        let _ = failing(&cb);
    }
    assert_eq!(cb.failure_count(), 4);

    for _ in 0..5 {
        assert!(failing(&cb).unwrap_err().is_open());
    }
    assert_eq!(cb.failure_count(), 4);
}

// =============================================================================
// End-to-end scenario: threshold=3, timeout=5s
// =============================================================================

#[test]
fn test_end_to_end_trip_reject_and_recover() {
    let (cb, clock) = breaker_with(3, Duration::from_secs(5), TripPolicy::ExceedsThreshold);

    for _ in 0..3 {
        assert!(matches!(
            failing(&cb),
            Err(CircuitBreakerError::Inner(UpstreamDown))
        ));
    }
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.failure_count(), 3);

    let _ = failing(&cb);
    assert_eq!(cb.state(), CircuitState::Open);

    let calls = Cell::new(0);
    let operation = || {
        calls.set(calls.get() + 1);
        Ok::<_, UpstreamDown>(200)
    };

    clock.advance(Duration::from_secs(1));
    assert!(cb.attempt(operation).unwrap_err().is_open());
    assert_eq!(calls.get(), 0);

    clock.advance(Duration::from_secs(5));
    assert_eq!(cb.attempt(operation).unwrap(), 200);
    assert_eq!(calls.get(), 1);
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.failure_count(), 0);
    assert!(cb.opened_at().is_none());
}

#[test]
fn test_probe_runs_once_after_many_rejections() {
    let (cb, clock) = breaker_with(1, Duration::from_secs(5), TripPolicy::ExceedsThreshold);
    for _ in 0..2 {
        let _ = failing(&cb);
    }

    let calls = Cell::new(0);
    for _ in 0..20 {
        clock.advance(Duration::from_millis(200));
        let _ = cb.attempt(|| {
            calls.set(calls.get() + 1);
            Err::<i32, _>(UpstreamDown)
        });
    }
    // 20 * 200ms = 4s, still inside the window
    assert_eq!(calls.get(), 0);

    clock.advance(Duration::from_secs(1));
    let result = cb.attempt(|| {
        calls.set(calls.get() + 1);
        Err::<i32, _>(UpstreamDown)
    });
    assert!(matches!(result, Err(CircuitBreakerError::Inner(UpstreamDown))));
    assert_eq!(calls.get(), 1);
    assert_eq!(cb.state(), CircuitState::Open);
    assert_eq!(cb.opened_at(), Some(clock.now()));
}

// =============================================================================
// Fallback
// =============================================================================

#[test]
fn test_default_fallback_then_custom_fallback() {
    let (cb, _) = breaker_with(3, Duration::from_secs(5), TripPolicy::ExceedsThreshold);
    cb.force_open().unwrap();

    match failing(&cb) {
        Err(CircuitBreakerError::Open(err)) => assert_eq!(err.name, "inventory"),
        other => panic!("expected CircuitOpenError, got {:?}", other),
    }

    cb.set_fallback(|_| Ok(42));
    assert_eq!(failing(&cb).unwrap(), 42);
}

#[test]
fn test_fallback_installed_at_build_time() {
    let cb = CircuitBreaker::<String>::builder("quotes")
        .threshold(1)
        .timeout(Duration::from_secs(30))
        .fallback(|snapshot| Ok(format!("{} unavailable", snapshot.name)))
        .build()
        .unwrap();
    cb.force_open().unwrap();

    let result = cb.attempt(|| Ok::<_, UpstreamDown>("fresh".to_string()));
    assert_eq!(result.unwrap(), "quotes unavailable");
}

#[test]
fn test_clones_share_state_and_fallback() {
    let (cb, _) = breaker_with(1, Duration::from_secs(5), TripPolicy::ExceedsThreshold);
    let other = cb.clone();

    for _ in 0..2 {
        let _ = failing(&cb);
    }
    assert_eq!(other.state(), CircuitState::Open);

    cb.set_fallback(|_| Ok(-1));
    assert_eq!(failing(&other).unwrap(), -1);
}

// =============================================================================
// Manual controls
// =============================================================================

#[test]
fn test_invalid_forced_transitions_leave_state_unchanged() {
    let (cb, _) = breaker_with(3, Duration::from_secs(5), TripPolicy::ExceedsThreshold);
    let _ = failing(&cb);

    assert_eq!(
        cb.force_half_open(),
        Err(BreakerError::InvalidTransition {
            from: CircuitState::Closed,
            to: CircuitState::HalfOpen,
        })
    );
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.failure_count(), 1);

    cb.force_open().unwrap();
    let opened_at = cb.opened_at();
    assert_eq!(
        cb.force_open(),
        Err(BreakerError::InvalidTransition {
            from: CircuitState::Open,
            to: CircuitState::Open,
        })
    );
    assert_eq!(
        cb.force_close(),
        Err(BreakerError::InvalidTransition {
            from: CircuitState::Open,
            to: CircuitState::Closed,
        })
    );
    assert_eq!(cb.state(), CircuitState::Open);
    assert_eq!(cb.opened_at(), opened_at);
}

#[test]
fn test_half_open_forced_transitions() {
    let (cb, _) = breaker_with(3, Duration::from_secs(5), TripPolicy::ExceedsThreshold);
    cb.force_open().unwrap();
    cb.force_half_open().unwrap();
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    assert!(matches!(
        cb.force_half_open(),
        Err(BreakerError::InvalidTransition { .. })
    ));
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    cb.force_open().unwrap();
    assert_eq!(cb.state(), CircuitState::Open);

    cb.force_half_open().unwrap();
    cb.force_close().unwrap();
    assert_eq!(cb.state(), CircuitState::Closed);
    cb.force_close().unwrap();
    assert_eq!(cb.state(), CircuitState::Closed);
}

// =============================================================================
// Construction
// =============================================================================

#[test]
fn test_construction_from_config() {
    let config = CircuitBreakerConfig {
        threshold: 2,
        timeout: 10,
        trip_policy: TripPolicy::ReachesThreshold,
        ..CircuitBreakerConfig::default()
    };
    let cb = CircuitBreaker::<()>::with_config("ledger", &config).unwrap();

    assert_eq!(cb.name(), "ledger");
    assert_eq!(cb.threshold(), 2);
    assert_eq!(cb.timeout(), Duration::from_secs(10));
    assert_eq!(cb.trip_policy(), TripPolicy::ReachesThreshold);
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[test]
fn test_construction_rejects_invalid_config() {
    let config = CircuitBreakerConfig {
        timeout: 0,
        ..CircuitBreakerConfig::default()
    };
    assert!(matches!(
        CircuitBreaker::<()>::with_config("ledger", &config),
        Err(BreakerError::InvalidConfiguration(_))
    ));
}

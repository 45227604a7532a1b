//! Circuit Breaker Pattern Implementation
//!
//! The circuit breaker guards calls to a downstream dependency. It counts
//! consecutive failures and, once too many pile up, rejects calls for a while
//! so the dependency gets time to recover.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐
//! │ Closed  │ ◄──────────────────┐
//! │ (Normal)│                    │
//! └────┬────┘                    │
//!      │ failure_count           │ probe
//!      │ trips threshold         │ succeeds
//!      ▼                         │
//! ┌─────────┐  timeout + call ┌───┴───────┐
//! │  Open   │────────────────►│ HalfOpen  │
//! │(Failing)│                 │ (Probing) │
//! └─────────┘◄────────────────└───────────┘
//!                probe fails
//! ```
//!
//! There is no timer. Open only turns into HalfOpen when a call arrives after
//! the timeout has elapsed, and that call becomes the probe.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use lighter_breaker::resilience::{CircuitBreaker, CircuitState};
//!
//! let cb = CircuitBreaker::<u32>::builder("inventory")
//!     .threshold(3)
//!     .timeout(Duration::from_secs(5))
//!     .build()
//!     .unwrap();
//!
//! let result = cb.attempt(|| Ok::<_, std::io::Error>(7));
//! assert_eq!(result.unwrap(), 7);
//! assert_eq!(cb.state(), CircuitState::Closed);
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};

use super::clock::{Clock, SystemClock};
use crate::config::CircuitBreakerConfig;
use crate::error::{BreakerError, CircuitBreakerError, CircuitOpenError};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, allowing all requests through
    Closed,
    /// Failing state, rejecting all requests until timeout expires
    Open,
    /// Testing state, a single probe decides whether to close again
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a failure in Closed state trips the breaker
///
/// Both behaviours exist in the wild, so the choice is explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TripPolicy {
    /// Trip once `failure_count > threshold`, i.e. on failure `threshold + 1`
    #[default]
    #[serde(rename = "exceeds")]
    ExceedsThreshold,
    /// Trip once `failure_count >= threshold`, i.e. on failure `threshold`
    #[serde(rename = "reaches")]
    ReachesThreshold,
}

impl TripPolicy {
    pub fn trips(&self, failure_count: u32, threshold: u32) -> bool {
        match self {
            TripPolicy::ExceedsThreshold => failure_count > threshold,
            TripPolicy::ReachesThreshold => failure_count >= threshold,
        }
    }
}

/// Point-in-time copy of the breaker's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<Instant>,
    pub threshold: u32,
    pub timeout: Duration,
    /// Clock reading the snapshot was taken at
    pub taken_at: Instant,
}

impl BreakerSnapshot {
    /// Time left before an Open breaker admits a probe, zero otherwise
    pub fn retry_in(&self) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at)) => self
                .timeout
                .saturating_sub(self.taken_at.saturating_duration_since(opened_at)),
            _ => Duration::ZERO,
        }
    }
}

/// Action run in place of the operation when a call is rejected
///
/// A fallback either substitutes a value or refuses with a
/// [`CircuitOpenError`]; its error type is always `CircuitOpenError`, which
/// reaches the caller as [`CircuitBreakerError::Open`]. Callers that need a
/// richer error map it from there.
pub type Fallback<T> =
    Arc<dyn Fn(&BreakerSnapshot) -> Result<T, CircuitOpenError> + Send + Sync>;

fn circuit_open_fallback<T>() -> Fallback<T> {
    Arc::new(|snapshot: &BreakerSnapshot| {
        Err(CircuitOpenError {
            name: snapshot.name.clone(),
            retry_in: snapshot.retry_in(),
        })
    })
}

/// Mutable bookkeeping, only touched under the core's lock
#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    /// Set while the single HalfOpen probe is running
    probe_in_flight: bool,
    /// Bumped on every state change; stale outcomes are dropped
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Closed,
    Probe,
}

/// The state machine without the fallback, so it does not depend on `T`
struct Core {
    name: String,
    threshold: u32,
    timeout: Duration,
    trip_policy: TripPolicy,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

/// Admission ticket for one execution of the guarded operation
///
/// Dropping it unsettled (the operation panicked or the future was cancelled)
/// gives a claimed probe slot back.
struct Permit<'a> {
    core: &'a Core,
    kind: PermitKind,
    epoch: u64,
    settled: bool,
}

impl Permit<'_> {
    fn succeed(mut self) {
        self.settled = true;
        self.core.record_success(self.kind, self.epoch);
    }

    fn fail(mut self) {
        self.settled = true;
        self.core.record_failure(self.kind, self.epoch);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.kind == PermitKind::Probe {
            self.core.release_probe(self.epoch);
        }
    }
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot_locked(&self, inner: &Inner, now: Instant) -> BreakerSnapshot {
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            opened_at: inner.opened_at,
            threshold: self.threshold,
            timeout: self.timeout,
            taken_at: now,
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.epoch = inner.epoch.wrapping_add(1);
        inner.probe_in_flight = false;

        match to {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => inner.opened_at = Some(now),
            CircuitState::HalfOpen => {}
        }

        counter!(
            "circuit_breaker_transitions_total",
            "breaker" => self.name.clone(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        gauge!("circuit_breaker_state", "breaker" => self.name.clone()).set(to.gauge_value());
    }

    fn admit(&self) -> Result<Permit<'_>, BreakerSnapshot> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let kind = match inner.state {
            CircuitState::Closed => PermitKind::Closed,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(self.timeout, |opened_at| now.saturating_duration_since(opened_at));
                if elapsed < self.timeout {
                    return Err(self.snapshot_locked(&inner, now));
                }

                self.transition(&mut inner, CircuitState::HalfOpen, now);
                tracing::info!(
                    circuit_breaker = %self.name,
                    state = "Open -> HalfOpen",
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Circuit breaker transitioning to HalfOpen"
                );
                inner.probe_in_flight = true;
                PermitKind::Probe
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.snapshot_locked(&inner, now));
                }
                inner.probe_in_flight = true;
                PermitKind::Probe
            }
        };

        Ok(Permit {
            core: self,
            kind,
            epoch: inner.epoch,
            settled: false,
        })
    }

    fn record_success(&self, kind: PermitKind, epoch: u64) {
        counter!("circuit_breaker_calls_total", "breaker" => self.name.clone(), "outcome" => "success")
            .increment(1);

        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }

        match kind {
            PermitKind::Closed => inner.failure_count = 0,
            PermitKind::Probe => {
                self.transition(&mut inner, CircuitState::Closed, now);
                tracing::info!(
                    circuit_breaker = %self.name,
                    state = "HalfOpen -> Closed",
                    "Circuit breaker closed after successful probe"
                );
            }
        }
    }

    fn record_failure(&self, kind: PermitKind, epoch: u64) {
        counter!("circuit_breaker_calls_total", "breaker" => self.name.clone(), "outcome" => "failure")
            .increment(1);

        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }

        inner.failure_count = inner.failure_count.saturating_add(1);

        match kind {
            PermitKind::Closed => {
                if self.trip_policy.trips(inner.failure_count, self.threshold) {
                    self.transition(&mut inner, CircuitState::Open, now);
                    tracing::warn!(
                        circuit_breaker = %self.name,
                        state = "Closed -> Open",
                        failure_count = inner.failure_count,
                        threshold = self.threshold,
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            PermitKind::Probe => {
                self.transition(&mut inner, CircuitState::Open, now);
                tracing::warn!(
                    circuit_breaker = %self.name,
                    state = "HalfOpen -> Open",
                    failure_count = inner.failure_count,
                    "Circuit breaker re-opened after failed probe"
                );
            }
        }
    }

    fn release_probe(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.epoch == epoch && inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            tracing::warn!(
                circuit_breaker = %self.name,
                "Probe abandoned before completing, slot released"
            );
        }
    }

    fn force(&self, to: CircuitState) -> Result<(), BreakerError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let from = inner.state;

        let allowed = matches!(
            (from, to),
            (CircuitState::Closed, CircuitState::Open)
                | (CircuitState::Closed, CircuitState::Closed)
                | (CircuitState::HalfOpen, CircuitState::Open)
                | (CircuitState::HalfOpen, CircuitState::Closed)
                | (CircuitState::Open, CircuitState::HalfOpen)
        );
        if !allowed {
            tracing::debug!(
                circuit_breaker = %self.name,
                from = %from,
                to = %to,
                "Rejected forced transition"
            );
            return Err(BreakerError::InvalidTransition { from, to });
        }

        if from == to {
            inner.failure_count = 0;
        } else {
            self.transition(&mut inner, to, now);
        }

        let transition = format!("{} -> {}", from, to);
        tracing::info!(
            circuit_breaker = %self.name,
            state = %transition,
            "Circuit breaker state forced"
        );
        Ok(())
    }
}

/// Production-ready circuit breaker implementation
///
/// `T` is the value produced by the guarded operation, and by the fallback
/// when a call is rejected.
///
/// # Thread Safety
///
/// All bookkeeping (read state, decide, mutate) happens inside one mutex
/// critical section. The guarded operation and the fallback run outside of
/// it. Clones share the same state, so one breaker can be handed to many
/// threads or tasks.
pub struct CircuitBreaker<T> {
    core: Arc<Core>,
    fallback: Arc<Mutex<Fallback<T>>>,
}

impl<T> Clone for CircuitBreaker<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            fallback: Arc::clone(&self.fallback),
        }
    }
}

/// Builder for [`CircuitBreaker`]
pub struct CircuitBreakerBuilder<T> {
    name: String,
    threshold: Option<u32>,
    timeout: Option<Duration>,
    trip_policy: TripPolicy,
    clock: Option<Arc<dyn Clock>>,
    fallback: Option<Fallback<T>>,
}

impl<T: 'static> CircuitBreakerBuilder<T> {
    /// Maximum tolerated consecutive failures
    pub fn threshold(mut self, threshold: u32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Minimum time spent Open before a probe is allowed
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn trip_policy(mut self, trip_policy: TripPolicy) -> Self {
        self.trip_policy = trip_policy;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Action run when a call is rejected, instead of the default error
    pub fn fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&BreakerSnapshot) -> Result<T, CircuitOpenError> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn build(self) -> Result<CircuitBreaker<T>, BreakerError> {
        let threshold = match self.threshold {
            Some(0) => {
                return Err(BreakerError::InvalidConfiguration(
                    "threshold must be > 0".to_string(),
                ));
            }
            Some(threshold) => threshold,
            None => {
                return Err(BreakerError::InvalidConfiguration(
                    "threshold is required".to_string(),
                ));
            }
        };
        let timeout = match self.timeout {
            Some(timeout) if timeout.is_zero() => {
                return Err(BreakerError::InvalidConfiguration(
                    "timeout must be > 0".to_string(),
                ));
            }
            Some(timeout) => timeout,
            None => {
                return Err(BreakerError::InvalidConfiguration(
                    "timeout is required".to_string(),
                ));
            }
        };

        tracing::debug!(
            circuit_breaker = %self.name,
            threshold,
            timeout_ms = timeout.as_millis() as u64,
            trip_policy = ?self.trip_policy,
            "Circuit breaker created"
        );
        gauge!("circuit_breaker_state", "breaker" => self.name.clone())
            .set(CircuitState::Closed.gauge_value());

        Ok(CircuitBreaker {
            core: Arc::new(Core {
                name: self.name,
                threshold,
                timeout,
                trip_policy: self.trip_policy,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>),
                inner: Mutex::new(Inner {
                    state: CircuitState::Closed,
                    failure_count: 0,
                    opened_at: None,
                    probe_in_flight: false,
                    epoch: 0,
                }),
            }),
            fallback: Arc::new(Mutex::new(
                self.fallback.unwrap_or_else(circuit_open_fallback),
            )),
        })
    }
}

impl<T: 'static> CircuitBreaker<T> {
    /// Start building a breaker for the dependency called `name`
    pub fn builder(name: impl Into<String>) -> CircuitBreakerBuilder<T> {
        CircuitBreakerBuilder {
            name: name.into(),
            threshold: None,
            timeout: None,
            trip_policy: TripPolicy::default(),
            clock: None,
            fallback: None,
        }
    }

    /// Create a breaker from its configuration section
    ///
    /// # Example
    ///
    /// ```rust
    /// use lighter_breaker::config::CircuitBreakerConfig;
    /// use lighter_breaker::resilience::CircuitBreaker;
    ///
    /// let cb = CircuitBreaker::<()>::with_config("api", &CircuitBreakerConfig::default()).unwrap();
    /// assert_eq!(cb.threshold(), 5);
    /// ```
    pub fn with_config(
        name: impl Into<String>,
        config: &CircuitBreakerConfig,
    ) -> Result<Self, BreakerError> {
        Self::builder(name)
            .threshold(config.threshold)
            .timeout(Duration::from_secs(config.timeout))
            .trip_policy(config.trip_policy)
            .build()
    }

    /// Replace the action run when a call is rejected
    pub fn set_fallback<F>(&self, fallback: F)
    where
        F: Fn(&BreakerSnapshot) -> Result<T, CircuitOpenError> + Send + Sync + 'static,
    {
        *self.fallback.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(fallback);
    }
}

impl<T> CircuitBreaker<T> {
    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn threshold(&self) -> u32 {
        self.core.threshold
    }

    pub fn timeout(&self) -> Duration {
        self.core.timeout
    }

    pub fn trip_policy(&self) -> TripPolicy {
        self.core.trip_policy
    }

    pub fn state(&self) -> CircuitState {
        self.core.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.core.lock().failure_count
    }

    /// When the breaker last opened, `None` unless currently Open or HalfOpen
    pub fn opened_at(&self) -> Option<Instant> {
        self.core.lock().opened_at
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.core.clock.now();
        let inner = self.core.lock();
        self.core.snapshot_locked(&inner, now)
    }

    /// Run `operation` through the breaker
    ///
    /// # State Transitions
    ///
    /// - **Closed**: runs; success resets the failure count, failure counts
    ///   and may trip the breaker
    /// - **Open**, timeout pending: the operation does not run, the fallback does
    /// - **Open**, timeout elapsed: becomes HalfOpen and this call is the probe
    /// - **HalfOpen**: the probe closes the breaker on success, re-opens it on failure
    ///
    /// Failures are returned as [`CircuitBreakerError::Inner`], unchanged.
    pub fn attempt<F, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        match self.core.admit() {
            Ok(permit) => settle(permit, operation()),
            Err(snapshot) => self.invoke_fallback(&snapshot),
        }
    }

    /// Async flavour of [`attempt`](Self::attempt); the future is only polled if admitted
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use lighter_breaker::resilience::CircuitBreaker;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let cb = CircuitBreaker::<i32>::builder("external-api")
    ///     .threshold(5)
    ///     .timeout(Duration::from_secs(30))
    ///     .build()?;
    ///
    /// let value = cb.call(async { Ok::<_, std::io::Error>(42) }).await?;
    /// assert_eq!(value, 42);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call<F, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        match self.core.admit() {
            Ok(permit) => settle(permit, operation.await),
            Err(snapshot) => self.invoke_fallback(&snapshot),
        }
    }

    fn invoke_fallback<E>(&self, snapshot: &BreakerSnapshot) -> Result<T, CircuitBreakerError<E>> {
        counter!("circuit_breaker_calls_total", "breaker" => snapshot.name.clone(), "outcome" => "rejected")
            .increment(1);
        tracing::debug!(
            circuit_breaker = %snapshot.name,
            state = %snapshot.state,
            retry_in_ms = snapshot.retry_in().as_millis() as u64,
            "Call rejected, running fallback"
        );

        let fallback = self.fallback.lock().unwrap_or_else(PoisonError::into_inner).clone();
        fallback(snapshot).map_err(CircuitBreakerError::Open)
    }

    /// Force Closed/HalfOpen → Open
    pub fn force_open(&self) -> Result<(), BreakerError> {
        self.core.force(CircuitState::Open)
    }

    /// Force HalfOpen → Closed; on a Closed breaker only the failure count is reset
    pub fn force_close(&self) -> Result<(), BreakerError> {
        self.core.force(CircuitState::Closed)
    }

    /// Force Open → HalfOpen without waiting for the timeout
    pub fn force_half_open(&self) -> Result<(), BreakerError> {
        self.core.force(CircuitState::HalfOpen)
    }

    /// Manually reset the circuit breaker to Closed state, whatever it is now
    ///
    /// Unlike [`force_close`](Self::force_close) this ignores the transition table.
    pub fn reset(&self) {
        let now = self.core.clock.now();
        let mut inner = self.core.lock();
        if inner.state == CircuitState::Closed {
            inner.failure_count = 0;
        } else {
            self.core.transition(&mut inner, CircuitState::Closed, now);
        }
        tracing::info!(
            circuit_breaker = %self.core.name,
            "Circuit breaker manually reset to Closed"
        );
    }
}

fn settle<T, E>(permit: Permit<'_>, outcome: Result<T, E>) -> Result<T, CircuitBreakerError<E>> {
    match outcome {
        Ok(value) => {
            permit.succeed();
            Ok(value)
        }
        Err(err) => {
            permit.fail();
            Err(CircuitBreakerError::Inner(err))
        }
    }
}

impl<T> fmt::Debug for CircuitBreaker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.core.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.core.name)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .field("opened_at", &inner.opened_at)
            .field("threshold", &self.core.threshold)
            .field("timeout", &self.core.timeout)
            .field("trip_policy", &self.core.trip_policy)
            .finish()
    }
}

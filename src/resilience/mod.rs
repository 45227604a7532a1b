//! Resilience patterns for fault-tolerant services
//!
//! - **Circuit Breaker**: Prevents cascading failures by temporarily blocking
//!   calls to a failing dependency, giving it time to recover.
//! - **Clock**: Time source the breaker measures its Open timeout against.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use lighter_breaker::resilience::CircuitBreaker;
//!
//! let cb = CircuitBreaker::<String>::builder("payment-api")
//!     .threshold(5)
//!     .timeout(Duration::from_secs(60))
//!     .fallback(|_| Ok("cached quote".to_string()))
//!     .build()
//!     .unwrap();
//!
//! let quote = cb.attempt(|| Ok::<_, std::io::Error>("live quote".to_string()));
//! assert_eq!(quote.unwrap(), "live quote");
//! ```

mod circuit_breaker;
mod clock;

pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerBuilder, CircuitState, Fallback, TripPolicy,
};
pub use clock::{Clock, ManualClock, SystemClock};

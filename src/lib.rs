pub mod config;
pub mod error;
pub mod middlewares;
pub mod resilience;

// Re-export commonly used types for convenience
pub use error::{BreakerError, CircuitBreakerError, CircuitOpenError};
pub use middlewares::CircuitBreakerMiddleware;
pub use resilience::{BreakerSnapshot, CircuitBreaker, CircuitState, TripPolicy};

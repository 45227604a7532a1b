pub mod circuit_breaker;

pub use circuit_breaker::{
    CircuitBreakerMiddleware, CircuitBreakerMiddlewareService, circuit_open_response,
};

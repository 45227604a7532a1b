use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{ConfigError, Validate, WithDefaults};
use crate::resilience::TripPolicy;

/// Resilience configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResilienceConfig {
    /// Circuit breaker settings used by every dependency without an override
    #[serde(default = "CircuitBreakerConfig::default")]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-dependency overrides, keyed by breaker name
    #[serde(default)]
    pub dependencies: HashMap<String, CircuitBreakerConfig>,
}

impl ResilienceConfig {
    /// Settings for the breaker guarding `name`
    pub fn for_dependency(&self, name: &str) -> &CircuitBreakerConfig {
        self.dependencies.get(name).unwrap_or(&self.circuit_breaker)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    #[serde(default = "default_circuit_breaker_enabled")]
    pub enabled: bool,
    /// Number of consecutive failures tolerated before the circuit opens
    #[serde(default = "default_circuit_breaker_threshold")]
    pub threshold: u32,
    /// Seconds the circuit stays open before a probe is allowed
    #[serde(default = "default_circuit_breaker_timeout")]
    pub timeout: u64,
    /// Whether the threshold-th failure trips ("reaches") or the one after it ("exceeds")
    #[serde(default)]
    pub trip_policy: TripPolicy,
}

// Default functions for CircuitBreakerConfig
fn default_circuit_breaker_enabled() -> bool {
    true
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_timeout() -> u64 {
    60 // 1 minute
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_circuit_breaker_enabled(),
            threshold: default_circuit_breaker_threshold(),
            timeout: default_circuit_breaker_timeout(),
            trip_policy: TripPolicy::default(),
        }
    }
}

impl Validate for ResilienceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        for (name, config) in &self.dependencies {
            config.validate().map_err(|err| match err {
                ConfigError::ValidationError(message) => ConfigError::ValidationError(format!(
                    "resilience.dependencies.{}: {}",
                    name, message
                )),
                other => other,
            })?;
        }
        Ok(())
    }
}

impl Validate for CircuitBreakerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.threshold == 0 {
            return Err(ConfigError::ValidationError("circuit_breaker.threshold must be > 0 when circuit breaker is enabled".to_string()));
        }
        if self.enabled && self.timeout == 0 {
            return Err(ConfigError::ValidationError("circuit_breaker.timeout must be > 0 when circuit breaker is enabled".to_string()));
        }
        Ok(())
    }
}

impl WithDefaults for ResilienceConfig {
    fn with_defaults() -> Self {
        Self::default()
    }
}

impl WithDefaults for CircuitBreakerConfig {
    fn with_defaults() -> Self {
        Self::default()
    }
}

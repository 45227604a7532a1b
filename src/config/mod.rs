pub mod app;
pub mod resilience;

pub use app::{AppConfig, AppMetadata};
pub use resilience::{CircuitBreakerConfig, ResilienceConfig};

/// Configuration loading or validation failure
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Checks a configuration section for values the breaker cannot run with
pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Builds a configuration section with every field at its default
pub trait WithDefaults {
    fn with_defaults() -> Self;
}

/// Load the application configuration from files and environment variables
pub fn load() -> Result<AppConfig, ConfigError> {
    app::load_config()
}

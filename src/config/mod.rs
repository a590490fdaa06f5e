pub mod loader;
pub mod models;
pub mod sample;
pub mod validation;

pub use loader::load_config;
pub use models::*;
pub use sample::SAMPLE_CONFIG;
pub use validation::{GatewayConfigValidator, ValidationError, ValidationResult};

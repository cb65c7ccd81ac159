pub mod config;
pub mod error;
pub mod health;
pub mod prelude;
pub mod token_store;
pub mod validation;

pub use config::{init_tracing, RuntimeConfig};
pub use error::RuntimeError;
pub use health::{AggregateAvailability, HealthRecord, HealthState};
pub use token_store::TokenStore;
pub use validation::{
    validate_endpoint_path, validate_metadata, validate_self_id, validate_service_type,
    validate_version,
};

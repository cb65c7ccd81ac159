//! Single `use pluginhost_core::prelude::*;` for the types every other
//! crate in this workspace needs at its boundary.

pub use crate::config::{init_tracing, RuntimeConfig};
pub use crate::error::RuntimeError;
pub use crate::health::{AggregateAvailability, HealthRecord, HealthState};
pub use crate::token_store::TokenStore;
pub use crate::validation::{
    validate_endpoint_path, validate_metadata, validate_self_id, validate_service_type,
    validate_version,
};

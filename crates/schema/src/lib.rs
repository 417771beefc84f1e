//! Configuration tree access and JSON Schema validation registry.

mod config;
mod error;
mod registry;

pub use config::Config;
pub use error::{ConfigError, SchemaError};
pub use registry::SchemaRegistry;

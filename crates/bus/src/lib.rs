//! MQTT 3.1.1 message bus client with project-scoped topic namespacing.

mod client;
mod error;

pub use client::{BusClient, BusConfig, Credentials, Qos};
pub use error::BusError;

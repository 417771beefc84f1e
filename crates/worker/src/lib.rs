//! Worker trait, strictly-serial module container, and built-in workers for
//! the sensorflow dataflow runtime.

pub mod builtin;
mod container;
mod prototype;

pub use container::Module;
pub use prototype::{dispatch, publish_observation, HandlerTable, Publish, Worker};

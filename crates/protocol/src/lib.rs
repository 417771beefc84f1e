//! Observation record, message envelope, and sensor/request catalog shared
//! by every component of the sensorflow dataflow runtime.

mod envelope;
mod error;
mod observation;
mod sensor;

pub use envelope::{message_type, Envelope, Header};
pub use error::{ProtocolError, Result};
pub use observation::{create_response_set, Observation, RequestSet, ResponseSet, ResponseValue};
pub use sensor::{ObservationTemplate, Sensor, SensorCatalog, SensorType};

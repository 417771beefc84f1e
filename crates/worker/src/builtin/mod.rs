//! Built-in workers shipped with the runtime: processing, health reporting,
//! alerting, and a pipeline-completing sink.

mod heartbeat;
mod notification;
mod processing;
mod sink;
mod status;

pub use heartbeat::Heartbeat;
pub use notification::{AlertMessageFormatter, Templates};
pub use processing::{PreProcessor, ReturnCodeInspector};
pub use sink::NullSink;
pub use status::{ModuleStatus, SensorStatus, StatusPublisher};

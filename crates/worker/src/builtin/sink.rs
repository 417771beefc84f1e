//! A trivial exporter: logs receipt and otherwise does nothing. Stands in
//! for the concrete file/CouchDB/HTTP/notification exporters the original
//! runtime ships, which are out of scope here -- this keeps the pipeline
//! runnable end-to-end without a real storage or transport backend.

use sensorflow_protocol::Observation;

use crate::prototype::{HandlerTable, Worker};

pub struct NullSink {
    name: String,
    running: bool,
    handlers: HandlerTable,
}

impl NullSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: true,
            handlers: HandlerTable::with_defaults(),
        }
    }
}

impl Worker for NullSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn worker_type(&self) -> &str {
        "modules.export.NullSink"
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn process_observation(&mut self, obs: Observation) -> Observation {
        tracing::debug!(worker = %self.name, name = %obs.name, target = %obs.target, "received observation");
        obs
    }
}

//! Periodic retained status publication, grounded in `modules/health.py`'s
//! general shape (a worker that watches the rest of the system) but
//! publishing a roster snapshot rather than per-port dead-man detection --
//! that half of `ObservationTracker` lives in the manager, not here (see
//! `sensorflow_manager::health`).

use std::time::{Duration, Instant};

use sensorflow_protocol::{message_type, Header};
use serde::Serialize;

use crate::prototype::{HandlerTable, Publish, Worker};

#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
    pub name: String,
    pub is_running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorStatus {
    pub name: String,
    pub sensor_type: String,
}

/// Publishes a retained `status` message describing the running node:
/// project/node identifiers, the module roster with running flags, the
/// sensor roster, software version, and process uptime.
pub struct StatusPublisher {
    name: String,
    running: bool,
    handlers: HandlerTable,
    project: String,
    node: String,
    started_at: Instant,
    modules: Vec<ModuleStatus>,
    sensors: Vec<SensorStatus>,
    interval: Duration,
    target: String,
}

impl StatusPublisher {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        project: impl Into<String>,
        node: impl Into<String>,
        modules: Vec<ModuleStatus>,
        sensors: Vec<SensorStatus>,
        interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            running: true,
            handlers: HandlerTable::with_defaults(),
            project: project.into(),
            node: node.into(),
            started_at: Instant::now(),
            modules,
            sensors,
            interval,
            target: target.into(),
        }
    }

    pub fn refresh_modules(&mut self, modules: Vec<ModuleStatus>) {
        self.modules = modules;
    }

    /// Publishes the current snapshot to `target` via `publish`, retained.
    pub fn publish_status(&self, target: &str, publish: &Publish<'_>) {
        let payload = serde_json::json!({
            "state": if self.running { "online" } else { "offline" },
            "detail": format!(
                "project={} node={} version={} uptime_secs={}",
                self.project,
                self.node,
                env!("CARGO_PKG_VERSION"),
                self.started_at.elapsed().as_secs(),
            ),
            "modules": self.modules,
            "sensors": self.sensors,
        });
        publish(target, Header::new(message_type::STATUS, self.name.clone()), payload, true);
    }
}

impl Worker for StatusPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn worker_type(&self) -> &str {
        "modules.health.StatusPublisher"
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

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    fn on_tick(&mut self, publish: &Publish<'_>) {
        let target = self.target.clone();
        self.publish_status(&target, publish);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_status_retains_and_reports_online() {
        let publisher = StatusPublisher::new(
            "status1",
            "demo/node1/status",
            "demo",
            "node1",
            vec![ModuleStatus { name: "heartbeat".into(), is_running: true }],
            vec![SensorStatus { name: "sensor1".into(), sensor_type: "virtual".into() }],
            Duration::from_secs(60),
        );
        let seen = std::cell::RefCell::new(Vec::new());
        let publish: &Publish<'_> = &|target, _h, payload, retain| {
            seen.borrow_mut().push((target.to_string(), payload, retain));
        };
        publisher.publish_status("demo/node1/status", publish);
        let recorded = seen.borrow();
        assert_eq!(recorded.len(), 1);
        let (target, payload, retain) = &recorded[0];
        assert_eq!(target, "demo/node1/status");
        assert!(*retain, "status messages must be published retained");
        assert_eq!(payload["state"], "online");
    }

    #[test]
    fn on_tick_publishes_to_stored_target() {
        let mut publisher = StatusPublisher::new(
            "status1",
            "demo/node1/status",
            "demo",
            "node1",
            Vec::new(),
            Vec::new(),
            Duration::from_millis(100),
        );
        let seen = std::cell::RefCell::new(Vec::new());
        let publish: &Publish<'_> = &|target, _h, _p, retain| {
            seen.borrow_mut().push((target.to_string(), retain));
        };
        publisher.on_tick(publish);
        assert_eq!(*seen.borrow(), vec![("demo/node1/status".to_string(), true)]);
    }
}

//! Dead-port detection. Watches observations passing through and flags
//! ports that have not reported within `maximum_age`, grounded in
//! `modules/health.py::ObservationTracker`. The companion roster-publishing
//! half lives in `sensorflow_worker::builtin::status::StatusPublisher`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sensorflow_protocol::Observation;
use sensorflow_worker::{HandlerTable, Publish, Worker};
use tracing::error;

pub struct ObservationTracker {
    name: String,
    running: bool,
    handlers: HandlerTable,
    enabled: bool,
    maximum_age: Duration,
    ports: HashMap<String, Instant>,
}

impl ObservationTracker {
    pub fn new(name: impl Into<String>, enabled: bool, maximum_age: Duration) -> Self {
        Self {
            name: name.into(),
            running: true,
            handlers: HandlerTable::with_defaults(),
            enabled,
            maximum_age,
            ports: HashMap::new(),
        }
    }

    /// Records activity for `port_name`. Called from `process_observation`
    /// for every observation that passes through, same as the original's
    /// `action()` handler.
    fn touch(&mut self, port_name: &str) {
        if port_name.is_empty() {
            return;
        }
        self.ports.insert(port_name.to_string(), Instant::now());
    }

    /// Scans tracked ports for ones that have exceeded `maximum_age` since
    /// their last observation, logs an error for each, and forgets them --
    /// a port must report again to be tracked anew, mirroring the
    /// original's zombie sweep.
    fn sweep(&mut self) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let zombies: Vec<String> = self
            .ports
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > self.maximum_age)
            .map(|(port, _)| port.clone())
            .collect();

        for port in zombies {
            self.ports.remove(&port);
            let secs = self.maximum_age.as_secs();
            let since = if secs >= 60 && secs % 60 == 0 {
                format!("{} minutes", secs / 60)
            } else {
                format!("{secs} seconds")
            };
            error!(port, since, "sensor on port seems to be dead (no response since)");
        }
    }
}

impl Worker for ObservationTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn worker_type(&self) -> &str {
        "modules.health.ObservationTracker"
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
        if self.enabled {
            self.touch(&obs.port_name);
        }
        obs
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }

    fn on_tick(&mut self, _publish: &Publish<'_>) {
        self.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_then_sweep_within_age_keeps_port() {
        let mut tracker = ObservationTracker::new("tracker1", true, Duration::from_secs(60));
        tracker.touch("com1");
        tracker.sweep();
        assert!(tracker.ports.contains_key("com1"));
    }

    #[test]
    fn sweep_forgets_port_once_tracked_as_zombie() {
        let mut tracker = ObservationTracker::new("tracker1", true, Duration::from_millis(0));
        tracker.touch("com1");
        std::thread::sleep(Duration::from_millis(5));
        tracker.sweep();
        assert!(!tracker.ports.contains_key("com1"));
    }

    #[test]
    fn disabled_tracker_never_flags_zombies() {
        let mut tracker = ObservationTracker::new("tracker1", false, Duration::from_millis(0));
        tracker.touch("com1");
        std::thread::sleep(Duration::from_millis(5));
        tracker.sweep();
        assert!(tracker.ports.contains_key("com1"), "disabled tracker must not sweep at all");
    }
}

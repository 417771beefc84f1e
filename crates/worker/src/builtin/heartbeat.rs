//! Periodic liveness ping to a fixed receiver list, the counterpart
//! `modules/health.py::ObservationTracker` expects on the other end of each
//! port: a receiver that sees a `heartbeat` message on schedule and can
//! complain in its absence.

use std::time::Duration;

use sensorflow_protocol::{message_type, Header};

use crate::prototype::{HandlerTable, Publish, Worker};

pub struct Heartbeat {
    name: String,
    running: bool,
    handlers: HandlerTable,
    receivers: Vec<String>,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(name: impl Into<String>, receivers: Vec<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            running: true,
            handlers: HandlerTable::with_defaults(),
            receivers,
            interval,
        }
    }

    pub fn beat(&self, publish: &Publish<'_>) {
        if !self.running {
            return;
        }
        for receiver in &self.receivers {
            let payload = serde_json::json!({
                "source": self.name,
                "dt": chrono::Utc::now().to_rfc3339(),
                "pid": std::process::id(),
            });
            publish(receiver, Header::new(message_type::HEARTBEAT, self.name.clone()), payload, false);
        }
    }
}

impl Worker for Heartbeat {
    fn name(&self) -> &str {
        &self.name
    }

    fn worker_type(&self) -> &str {
        "modules.health.Heartbeat"
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
        self.beat(publish);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_publishes_to_every_receiver() {
        let hb = Heartbeat::new("hb1", vec!["a".into(), "b".into()], Duration::from_secs(30));
        let seen = std::cell::RefCell::new(Vec::new());
        let publish: &Publish<'_> = &|target, _h, _p, _r| seen.borrow_mut().push(target.to_string());
        hb.beat(publish);
        assert_eq!(*seen.borrow(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn beat_is_silent_while_stopped() {
        let mut hb = Heartbeat::new("hb1", vec!["a".into()], Duration::from_secs(30));
        hb.stop();
        let seen = std::cell::Cell::new(0);
        let publish: &Publish<'_> = &|_t, _h, _p, _r| seen.set(seen.get() + 1);
        hb.beat(publish);
        assert_eq!(seen.get(), 0);
    }
}

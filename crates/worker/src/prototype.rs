//! The `Worker` abstraction every module wraps, and the message dispatch
//! logic shared by all of them.
//!
//! Grounded in `core/prototype.py::Prototype`: `handle()` validates and
//! routes a message to a handler, `do_handle_observation`/`do_handle_service`
//! are the two always-present handlers, and `publish_observation` is the
//! self-routing logic every worker shares regardless of what it does with
//! an observation.

use std::collections::HashSet;

use sensorflow_protocol::{message_type, Envelope, Header, Observation};
use sensorflow_schema::SchemaRegistry;
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// The set of message types a worker's `handle` will dispatch. Every worker
/// starts with `observation` and `service` registered; built-ins that speak
/// an additional type (e.g. `alert`) register it in their constructor.
#[derive(Debug, Clone)]
pub struct HandlerTable {
    registered: HashSet<String>,
}

impl HandlerTable {
    pub fn with_defaults() -> Self {
        let mut registered = HashSet::new();
        registered.insert(message_type::OBSERVATION.to_string());
        registered.insert(message_type::SERVICE.to_string());
        Self { registered }
    }

    pub fn register(&mut self, msg_type: impl Into<String>) {
        self.registered.insert(msg_type.into());
    }

    pub fn contains(&self, msg_type: &str) -> bool {
        self.registered.contains(msg_type)
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Sends a message to `target` built from `header`/`payload`, via whatever
/// transport the caller closes over (usually `BusClient::publish`). The
/// trailing `bool` is the MQTT `retain` flag -- `true` only for retained
/// state such as `status`.
pub type Publish<'a> = dyn Fn(&str, Header, Value, bool) + 'a;

pub trait Worker: Send {
    fn name(&self) -> &str;
    fn worker_type(&self) -> &str;
    fn is_running(&self) -> bool;

    /// Transforms an observation. Identity by default; built-in and
    /// application workers override this to do real work.
    fn process_observation(&mut self, obs: Observation) -> Observation {
        obs
    }

    fn handlers(&self) -> &HandlerTable;

    fn start(&mut self);
    fn stop(&mut self);

    /// Handles a message type beyond the built-in `observation`/`service`
    /// pair. Called only for types the worker registered itself in its
    /// `HandlerTable`. Default: no-op.
    fn handle_custom(&mut self, _header: &Header, _payload: &Value, _publish: &Publish<'_>) {}

    /// How often the container should invoke `on_tick`, if at all. Workers
    /// that publish on a schedule rather than in response to a message
    /// (`StatusPublisher`, `Heartbeat`, the coalescing window of
    /// `AlertMessageFormatter`) override this; the default `None` means the
    /// container never wakes this worker on a timer.
    fn tick_interval(&self) -> Option<std::time::Duration> {
        None
    }

    /// Invoked by the container every `tick_interval`. Default: no-op.
    fn on_tick(&mut self, _publish: &Publish<'_>) {}
}

/// Validates, then routes, a decoded envelope to `worker`. Mirrors
/// `Prototype.handle`: an unknown or unvalidatable message type is logged
/// and dropped, never propagated as an error to the caller, since a single
/// malformed message must not take a worker's inbox loop down.
pub fn dispatch(worker: &mut dyn Worker, schema: &SchemaRegistry, envelope: Envelope, publish: &Publish<'_>) {
    let payload_type = envelope.header.kind.as_str();
    let sender = envelope.header.from.as_str();

    if !worker.handlers().contains(payload_type) {
        error!(worker = worker.name(), payload_type, "undefined handler for payload type");
        return;
    }

    if let Err(e) = schema.validate(payload_type, &envelope.payload) {
        error!(worker = worker.name(), payload_type, error = %e, "payload failed schema validation");
        return;
    }

    match payload_type {
        message_type::OBSERVATION => handle_observation(worker, envelope.payload, publish),
        message_type::SERVICE => handle_service(worker, sender, &envelope.payload),
        _ => {
            debug!(worker = worker.name(), payload_type, "dispatched to custom handler");
            worker.handle_custom(&envelope.header, &envelope.payload, publish);
        }
    }
}

fn handle_observation(worker: &mut dyn Worker, payload: Value, publish: &Publish<'_>) {
    let obs = match Observation::from_payload(payload) {
        Ok(obs) => obs,
        Err(e) => {
            error!(worker = worker.name(), error = %e, "observation payload failed to decode");
            return;
        }
    };

    // Processing is skipped while the worker is stopped, but the
    // observation is still forwarded unchanged -- a stopped worker does
    // not break the pipeline for observations behind it.
    let obs = if worker.is_running() {
        worker.process_observation(obs)
    } else {
        obs
    };

    publish_observation(worker.name(), obs, publish);
}

fn handle_service(worker: &mut dyn Worker, sender: &str, payload: &Value) {
    let action = payload.get("action").and_then(Value::as_str).unwrap_or("");
    match action {
        "stop" => {
            worker.stop();
            debug!(worker = worker.name(), sender, "stopped by service message");
        }
        "start" => {
            worker.start();
            debug!(worker = worker.name(), sender, "started by service message");
        }
        other => warn!(worker = worker.name(), sender, action = other, "unrecognized service action"),
    }
}

/// Routes an observation to its next receiver, following
/// `Observation.receivers`/`nextReceiver`. Exactly the five cases of
/// `Prototype.publish_observation`:
///
/// 1. no receivers at all -> drop (debug log)
/// 2. `nextReceiver` undefined/negative -> drop (warning)
/// 3. `nextReceiver` at or past the end -> finished (info log)
/// 4. otherwise -> compute `from`/`next`, bump the index, publish
///
/// The `from` computation (`receivers[index - 1]`) reproduces the
/// original's Python negative-index wraparound at `index == 0` (it resolves
/// to the last receiver). Every dispatch path sets `nextReceiver = 1`
/// before the first publish, but the wraparound case does fire afterwards:
/// `ReturnCodeInspector` resets `nextReceiver` to 0 on a retry
/// (`builtin::processing::ReturnCodeInspector::process_observation`), so
/// this runs again with `index == 0` for every retried observation.
pub fn publish_observation(worker_name: &str, mut obs: Observation, publish: &Publish<'_>) {
    if obs.receivers.is_empty() {
        debug!(name = %obs.name, target = %obs.target, "no receivers defined in observation");
        return;
    }

    if obs.next_receiver < 0 {
        warn!(name = %obs.name, target = %obs.target, "undefined receiver index in observation");
        return;
    }

    let index = obs.next_receiver as usize;
    if index >= obs.receivers.len() {
        info!(name = %obs.name, target = %obs.target, "observation has been finished");
        return;
    }

    let len = obs.receivers.len() as isize;
    let prev = ((index as isize - 1).rem_euclid(len)) as usize;
    let sender = obs.receivers[prev].clone();
    let next_receiver = obs.receivers[index].clone();
    obs.next_receiver = (index + 1) as i64;

    let header = Header::new(message_type::OBSERVATION, sender);
    let payload = match serde_json::to_value(&obs) {
        Ok(v) => v,
        Err(e) => {
            error!(worker = worker_name, error = %e, "observation could not be serialized for publishing");
            return;
        }
    };
    publish(&next_receiver, header, payload, false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct RecordingWorker {
        handlers: HandlerTable,
        running: bool,
        seen: Vec<Observation>,
    }

    impl Worker for RecordingWorker {
        fn name(&self) -> &str {
            "recorder"
        }
        fn worker_type(&self) -> &str {
            "test.Recorder"
        }
        fn is_running(&self) -> bool {
            self.running
        }
        fn process_observation(&mut self, obs: Observation) -> Observation {
            self.seen.push(obs.clone());
            obs
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
    }

    #[test]
    fn finished_observation_is_dropped_silently() {
        let mut obs = Observation::new("o1", "t1", vec!["a".into()]);
        obs.next_receiver = 1;
        let calls = std::cell::Cell::new(0);
        let publish: &Publish<'_> = &|_t, _h, _p, _r| calls.set(calls.get() + 1);
        publish_observation("w", obs, publish);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn no_receivers_is_dropped_silently() {
        let obs = Observation::new("o1", "t1", vec![]);
        let calls = std::cell::Cell::new(0);
        let publish: &Publish<'_> = &|_t, _h, _p, _r| calls.set(calls.get() + 1);
        publish_observation("w", obs, publish);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn negative_index_is_dropped_with_warning() {
        let mut obs = Observation::new("o1", "t1", vec!["a".into()]);
        obs.next_receiver = -1;
        let calls = std::cell::Cell::new(0);
        let publish: &Publish<'_> = &|_t, _h, _p, _r| calls.set(calls.get() + 1);
        publish_observation("w", obs, publish);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn routes_to_next_receiver_and_advances_index() {
        let mut obs = Observation::new("o1", "t1", vec!["com1".into(), "pre1".into()]);
        obs.next_receiver = 1;
        let seen_target: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
        let seen_from: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
        let t2 = seen_target.clone();
        let f2 = seen_from.clone();
        let publish: &Publish<'_> = &move |target, header, _payload, _retain| {
            *t2.borrow_mut() = Some(target.to_string());
            *f2.borrow_mut() = Some(header.from.clone());
        };
        publish_observation("w", obs, publish);
        assert_eq!(seen_target.borrow().as_deref(), Some("pre1"));
        assert_eq!(seen_from.borrow().as_deref(), Some("com1"));
    }

    #[test]
    fn observation_processing_skipped_while_stopped_but_still_forwarded() {
        let mut worker = RecordingWorker {
            handlers: HandlerTable::with_defaults(),
            running: false,
            seen: Vec::new(),
        };
        let mut obs = Observation::new("o1", "t1", vec!["a".into(), "b".into()]);
        obs.next_receiver = 1;
        let envelope = Envelope::new(
            Header::new(message_type::OBSERVATION, "a"),
            serde_json::to_value(&obs).unwrap(),
        );
        let schema = sensorflow_schema::SchemaRegistry::bootstrap().unwrap();
        let forwarded = std::cell::Cell::new(false);
        let publish: &Publish<'_> = &|_t, _h, _p, _r| forwarded.set(true);
        dispatch(&mut worker, &schema, envelope, publish);
        assert!(worker.seen.is_empty(), "stopped worker must not process the observation");
        assert!(forwarded.get(), "observation must still be forwarded while stopped");
    }

    #[test]
    fn observation_missing_request_sets_is_dropped_before_processing() {
        let mut worker = RecordingWorker {
            handlers: HandlerTable::with_defaults(),
            running: true,
            seen: Vec::new(),
        };
        let payload = serde_json::json!({
            "id": "x",
            "name": "o1",
            "target": "t1",
            "receivers": ["a"],
            "nextReceiver": 0,
        });
        let envelope = Envelope::new(Header::new(message_type::OBSERVATION, "a"), payload);
        let schema = sensorflow_schema::SchemaRegistry::bootstrap().unwrap();
        let calls = std::cell::Cell::new(0);
        let publish: &Publish<'_> = &|_t, _h, _p, _r| calls.set(calls.get() + 1);
        dispatch(&mut worker, &schema, envelope, publish);
        assert!(worker.seen.is_empty(), "observation missing requestSets must not reach process_observation");
        assert_eq!(calls.get(), 0, "observation missing requestSets must not be forwarded either");
    }

    #[test]
    fn service_action_uses_value_equality_not_identity() {
        let mut worker = RecordingWorker {
            handlers: HandlerTable::with_defaults(),
            running: false,
            seen: Vec::new(),
        };
        let envelope = Envelope::new(
            Header::new(message_type::SERVICE, "ctl"),
            serde_json::json!({ "action": "start".to_string() }),
        );
        let schema = sensorflow_schema::SchemaRegistry::bootstrap().unwrap();
        let publish: &Publish<'_> = &|_t, _h, _p, _r| {};
        dispatch(&mut worker, &schema, envelope, publish);
        assert!(worker.is_running());
    }
}

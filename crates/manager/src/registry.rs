//! Closed static registry mapping a worker's configured class path to a
//! constructor. Grounded in `core/manager.py::ModuleManager.get_worker_instance`,
//! which dynamically imports a Python class by dotted path; Rust has no
//! equivalent, so per spec.md §9's redesign note this collapses to an
//! exhaustive `match` over the class-path strings the runtime ships workers
//! for. An unrecognized class path is a configuration error caught here,
//! before any bus connection is opened -- never a dispatch-time surprise.

use std::time::Duration;

use sensorflow_worker::builtin::{
    AlertMessageFormatter, Heartbeat, NullSink, PreProcessor, ReturnCodeInspector, StatusPublisher, Templates,
};
use sensorflow_worker::Worker;
use serde_json::Value;

use crate::health::ObservationTracker;
use crate::manager::WorkerContext;

pub type WorkerFactory = fn(&str, &Value, &WorkerContext) -> Box<dyn Worker>;

pub fn resolve(class_path: &str) -> Option<WorkerFactory> {
    match class_path {
        "modules.processing.PreProcessor" => Some(build_preprocessor),
        "modules.processing.ReturnCodeInspector" => Some(build_return_code_inspector),
        "modules.health.StatusPublisher" => Some(build_status_publisher),
        "modules.health.Heartbeat" => Some(build_heartbeat),
        "modules.health.ObservationTracker" => Some(build_observation_tracker),
        "modules.notification.AlertMessageFormatter" => Some(build_alert_formatter),
        "modules.export.NullSink" => Some(build_null_sink),
        _ => None,
    }
}

fn str_list(config: &Value, key: &str) -> Vec<String> {
    config
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn str_field<'a>(config: &'a Value, key: &str, default: &'a str) -> String {
    config.get(key).and_then(Value::as_str).unwrap_or(default).to_string()
}

fn secs_field(config: &Value, key: &str, default: u64) -> u64 {
    config.get(key).and_then(Value::as_u64).unwrap_or(default)
}

fn build_preprocessor(name: &str, _config: &Value, _ctx: &WorkerContext) -> Box<dyn Worker> {
    Box::new(PreProcessor::new(name))
}

fn build_null_sink(name: &str, _config: &Value, _ctx: &WorkerContext) -> Box<dyn Worker> {
    Box::new(NullSink::new(name))
}

fn build_return_code_inspector(name: &str, config: &Value, _ctx: &WorkerContext) -> Box<dyn Worker> {
    let response_sets = str_list(config, "responseSets");
    let retries = config.get("retries").and_then(Value::as_u64).unwrap_or(0) as u32;
    Box::new(ReturnCodeInspector::new(name, response_sets, retries))
}

fn build_heartbeat(name: &str, config: &Value, _ctx: &WorkerContext) -> Box<dyn Worker> {
    let receivers = str_list(config, "receivers");
    let interval = secs_field(config, "intervalSeconds", 60);
    Box::new(Heartbeat::new(name, receivers, Duration::from_secs(interval)))
}

fn build_status_publisher(name: &str, config: &Value, ctx: &WorkerContext) -> Box<dyn Worker> {
    let target = str_field(config, "target", "status");
    let interval = secs_field(config, "intervalSeconds", 60);
    Box::new(StatusPublisher::new(
        name,
        target,
        ctx.project.to_string(),
        ctx.node.to_string(),
        ctx.modules.clone(),
        ctx.sensors.clone(),
        Duration::from_secs(interval),
    ))
}

fn build_observation_tracker(name: &str, config: &Value, _ctx: &WorkerContext) -> Box<dyn Worker> {
    let enabled = config.get("enabled").and_then(Value::as_bool).unwrap_or(true);
    let maximum_age = secs_field(config, "maximumAgeSeconds", 300);
    Box::new(ObservationTracker::new(name, enabled, Duration::from_secs(maximum_age)))
}

fn build_alert_formatter(name: &str, config: &Value, ctx: &WorkerContext) -> Box<dyn Worker> {
    let receiver = str_field(config, "receiver", "");
    let transport_topic = str_field(config, "transportTopic", "");
    let message_type = str_field(config, "messageType", "alert");
    let templates_value = config.get("templates");
    let templates = Templates {
        header: templates_value.and_then(|t| t.get("header")).and_then(Value::as_str).unwrap_or("").to_string(),
        body: templates_value.and_then(|t| t.get("body")).and_then(Value::as_str).unwrap_or("").to_string(),
        footer: templates_value.and_then(|t| t.get("footer")).and_then(Value::as_str).unwrap_or("").to_string(),
    };
    let collection_enabled = config.get("collectionEnabled").and_then(Value::as_bool).unwrap_or(false);
    let collection_window = secs_field(config, "collectionWindowSeconds", 0);

    Box::new(AlertMessageFormatter::new(
        name,
        receiver,
        transport_topic,
        message_type,
        templates,
        ctx.project.to_string(),
        ctx.node.to_string(),
        collection_enabled,
        Duration::from_secs(collection_window),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_class_paths() {
        for class_path in [
            "modules.processing.PreProcessor",
            "modules.processing.ReturnCodeInspector",
            "modules.health.StatusPublisher",
            "modules.health.Heartbeat",
            "modules.health.ObservationTracker",
            "modules.notification.AlertMessageFormatter",
            "modules.export.NullSink",
        ] {
            assert!(resolve(class_path).is_some(), "expected a factory for {class_path}");
        }
    }

    #[test]
    fn unknown_class_path_is_unresolved() {
        assert!(resolve("modules.totalstation.TotalStation").is_none());
    }
}

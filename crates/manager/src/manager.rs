//! Ties configuration, schema validation, the bus connection, and the
//! worker registry together into one running node, grounded in
//! `core/manager.py::Manager`/`ModuleManager`/`ConfigManager`/`NodeManager`/
//! `ProjectManager`/`SensorManager`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sensorflow_bus::{BusClient, BusConfig, Credentials};
use sensorflow_logging::AlertRecord;
use sensorflow_protocol::{message_type, Envelope, Header, SensorCatalog};
use sensorflow_schema::{Config, SchemaRegistry};
use sensorflow_worker::builtin::{ModuleStatus, SensorStatus};
use sensorflow_worker::Module;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alerter::Alerter;
use crate::error::{ManagerError, Result};
use crate::scheduler::{Job, Scheduler, TimePeriod};

/// Everything a `WorkerFactory` needs besides its own config subtree: the
/// node/project identifiers and the full module/sensor roster, both needed
/// only by `StatusPublisher` but computed once up front rather than per
/// worker.
pub struct WorkerContext<'a> {
    pub project: &'a str,
    pub node: &'a str,
    pub modules: Vec<ModuleStatus>,
    pub sensors: Vec<SensorStatus>,
}

/// Strips everything but `[a-zA-Z0-9_-]` from a configured node/project id,
/// mirroring `re.sub('[^a-zA-Z0-9_-]', '', id)` in the original runtime's
/// `Node`/`Project`. Hand-rolled rather than pulling in `regex` for a single
/// character class this small -- consistent with `sensorflow_protocol::sensor`'s
/// `unescape`.
fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

fn mqtt_config(config: &Config, project_topic: &str) -> BusConfig {
    let raw = config.get_path(&["core", "intercom", "mqtt"]).map(|v| v.clone()).unwrap_or(Value::Null);
    let host = raw.get("host").and_then(Value::as_str).unwrap_or("localhost").to_string();
    let port = raw.get("port").and_then(Value::as_u64).unwrap_or(1883) as u16;
    let keep_alive = raw.get("keepAlive").and_then(Value::as_u64).unwrap_or(60);
    let credentials = match (raw.get("user").and_then(Value::as_str), raw.get("password").and_then(Value::as_str)) {
        (Some(user), Some(password)) => Some(Credentials { username: user.to_string(), password: password.to_string() }),
        _ => None,
    };

    let last_will = Envelope::new(Header::new(message_type::STATUS, "manager"), serde_json::json!({ "state": "offline" }));
    let last_will_payload = last_will.to_json_string().ok().map(String::into_bytes);

    BusConfig {
        host,
        port,
        client_id: format!("{project_topic}-{}", std::process::id()),
        project_topic: project_topic.to_string(),
        keep_alive: Duration::from_secs(keep_alive),
        credentials,
        last_will_offline_payload: last_will_payload,
    }
}

fn parse_weekdays(value: Option<&Value>) -> HashMap<String, Vec<TimePeriod>> {
    let Some(obj) = value.and_then(Value::as_object) else {
        return HashMap::new();
    };

    let parse_time = |s: &str| {
        chrono::NaiveTime::parse_from_str(s, "%H:%M:%S").or_else(|_| chrono::NaiveTime::parse_from_str(s, "%H:%M")).ok()
    };

    obj.iter()
        .map(|(day, periods)| {
            let periods = periods
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|p| {
                            let start = p.get("startTime").and_then(Value::as_str).and_then(parse_time)?;
                            let end = p.get("endTime").and_then(Value::as_str).and_then(parse_time)?;
                            Some(TimePeriod { start_time: start, end_time: end })
                        })
                        .collect()
                })
                .unwrap_or_default();
            (day.to_lowercase(), periods)
        })
        .collect()
}

fn build_schedulers(config: &Config, sensors: &SensorCatalog, bus: Arc<BusClient>) -> Vec<JoinHandle<()>> {
    let Ok(entries) = config.get_path(&["schedulers"]) else {
        return Vec::new();
    };
    let Some(entries) = entries.as_array() else {
        return Vec::new();
    };

    let mut handles = Vec::new();

    for (idx, entry) in entries.iter().enumerate() {
        let port_name = entry.get("port").and_then(Value::as_str).unwrap_or("").to_string();
        let sensor_name = entry.get("sensor").and_then(Value::as_str).unwrap_or("");
        let Some(sensor) = sensors.find(sensor_name) else {
            warn!(sensor_name, port_name, "scheduler references unknown sensor, skipping");
            continue;
        };
        let templates = sensor.build_observations();

        let Some(schedules) = entry.get("schedules").and_then(Value::as_array) else {
            continue;
        };

        let mut jobs = Vec::new();
        for (schedule_idx, schedule) in schedules.iter().enumerate() {
            let enabled = schedule.get("enabled").and_then(Value::as_bool).unwrap_or(true);
            let start_date = schedule
                .get("startDate")
                .and_then(Value::as_str)
                .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .unwrap_or_else(|| chrono::Local::now().date_naive());
            let end_date = schedule
                .get("endDate")
                .and_then(Value::as_str)
                .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .unwrap_or_else(|| start_date + chrono::Duration::days(3650));
            let weekdays = parse_weekdays(schedule.get("weekdays"));

            let Some(observation_names) = schedule.get("observations").and_then(Value::as_array) else {
                continue;
            };

            for name in observation_names.iter().filter_map(Value::as_str) {
                let Some(template) = templates.get(name) else {
                    warn!(name, sensor_name, "scheduled observation not found on sensor, skipping");
                    continue;
                };
                jobs.push(Job::new(
                    format!("{sensor_name}.{name}.{schedule_idx}"),
                    port_name.clone(),
                    enabled,
                    start_date,
                    end_date,
                    weekdays.clone(),
                    template.clone(),
                ));
            }
        }

        if jobs.is_empty() {
            continue;
        }

        let scheduler = Scheduler::new(format!("scheduler.{port_name}.{idx}"), jobs, bus.clone());
        handles.push(scheduler.spawn());
    }

    handles
}

/// Owns every running task for one node: the module containers, the bus
/// router, the per-port schedulers, and the alerter. Dropping a `Manager`
/// does not stop any of them -- call `shutdown` (orderly) or `kill_all`
/// (immediate) first.
pub struct Manager {
    schema: Arc<SchemaRegistry>,
    bus: Arc<BusClient>,
    project_id: String,
    node_id: String,
    modules: HashMap<String, Module>,
    sensor_roster: Vec<SensorStatus>,
    schedulers: Vec<JoinHandle<()>>,
    alerter: Option<JoinHandle<()>>,
    router: Option<JoinHandle<()>>,
    started_at: Instant,
}

impl Manager {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn module_names(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }

    /// A point-in-time view of the node's configured topology, for the
    /// local status HTTP surface. Reflects what was bootstrapped, not each
    /// worker's live running flag.
    pub fn status_snapshot(&self) -> Value {
        let mut modules: Vec<&str> = self.module_names();
        modules.sort_unstable();
        serde_json::json!({
            "project": self.project_id,
            "node": self.node_id,
            "uptimeSecs": self.started_at.elapsed().as_secs(),
            "modules": modules,
            "sensors": self.sensor_roster,
        })
    }

    /// Sends a `service` message to a single named module's inbox. Returns
    /// `false` if no module by that name is running.
    pub fn send_service(&self, module_name: &str, action: &str) -> bool {
        match self.modules.get(module_name) {
            Some(module) => {
                let envelope = Envelope::new(Header::new(message_type::SERVICE, "http"), serde_json::json!({ "action": action }));
                let _ = module.inbox.send(envelope);
                true
            }
            None => false,
        }
    }

    /// Loads configuration from `config_path`, validates the core sections,
    /// opens the bus connection, instantiates every configured module
    /// through the worker registry, and starts the router, schedulers, and
    /// alerter. `alert_rx` is the warning+ channel `sensorflow_logging::init_logging`
    /// returns; the manager takes ownership of it for the lifetime of the node.
    pub async fn bootstrap(config_path: &Path, alert_rx: mpsc::UnboundedReceiver<AlertRecord>) -> Result<Self> {
        let config = Config::load(config_path)?;
        let schema = Arc::new(SchemaRegistry::bootstrap()?);

        let project_value = config.get_valid_config(&schema, "project", &["core", "project"])?;
        let node_value = config.get_valid_config(&schema, "node", &["core", "node"])?;
        let project_id = sanitize_id(project_value.get("id").and_then(Value::as_str).unwrap_or(""));
        let node_id = sanitize_id(node_value.get("id").and_then(Value::as_str).unwrap_or(""));
        let project_topic = format!("{project_id}/{node_id}");

        let modules_value = config.get_valid_config(&schema, "modules", &["core", "modules"])?.clone();
        let sensors_value = config.get_valid_config(&schema, "sensors", &["sensors"])?.clone();
        let sensors: SensorCatalog = SensorCatalog {
            sensors: sensors_value
                .as_object()
                .map(|obj| {
                    obj.iter()
                        .filter_map(|(name, value)| {
                            let mut with_name = value.clone();
                            if let Some(obj) = with_name.as_object_mut() {
                                obj.insert("name".to_string(), Value::String(name.clone()));
                            }
                            serde_json::from_value(with_name).ok()
                        })
                        .collect()
                })
                .unwrap_or_default(),
        };

        let (bus, downlink_rx) = BusClient::connect(mqtt_config(&config, &project_topic));
        let bus = Arc::new(bus);

        let module_entries: Vec<(String, String)> = modules_value
            .as_object()
            .into_iter()
            .flatten()
            .filter_map(|(name, class_path)| class_path.as_str().map(|cp| (name.clone(), cp.to_string())))
            .collect();

        let roster: Vec<ModuleStatus> = module_entries
            .iter()
            .map(|(name, _)| ModuleStatus { name: name.clone(), is_running: true })
            .collect();
        let sensor_roster: Vec<SensorStatus> = sensors
            .sensors
            .iter()
            .map(|s| SensorStatus { name: s.name.clone(), sensor_type: s.sensor_type.clone() })
            .collect();

        let mut modules = HashMap::new();
        let mut inboxes = HashMap::new();

        for (name, class_path) in &module_entries {
            let factory = crate::registry::resolve(class_path)
                .ok_or_else(|| ManagerError::UnknownClass(name.clone(), class_path.clone()))?;
            let worker_config = config.raw().get(name).cloned().unwrap_or(Value::Null);
            let ctx = WorkerContext {
                project: &project_id,
                node: &node_id,
                modules: roster.clone(),
                sensors: sensor_roster.clone(),
            };
            let worker = factory(name, &worker_config, &ctx);
            let module = Module::spawn(worker, schema.clone(), bus.clone());
            inboxes.insert(name.clone(), module.inbox.clone());
            modules.insert(name.clone(), module);
        }

        for name in modules.keys() {
            bus.subscribe(name).await?;
        }

        let router = spawn_router(bus.clone(), downlink_rx, inboxes);

        let agents: Vec<String> = module_entries
            .iter()
            .filter(|(_, cp)| cp.as_str() == "modules.notification.AlertMessageFormatter")
            .map(|(name, _)| name.clone())
            .collect();
        let alert_receivers: Vec<String> = config
            .get_path(&["alerting", "receivers"])
            .ok()
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let alerter = Alerter::spawn(alert_rx, agents, alert_receivers, bus.clone());

        let schedulers = build_schedulers(&config, &sensors, bus.clone());

        info!(project = %project_id, node = %node_id, modules = modules.len(), "node bootstrapped");

        Ok(Self {
            schema,
            bus,
            project_id,
            node_id,
            modules,
            sensor_roster,
            schedulers,
            alerter: Some(alerter),
            router: Some(router),
            started_at: Instant::now(),
        })
    }

    /// Sends a `service` "start" message to every module's own inbox,
    /// bypassing the bus (a module's worker is only reachable through the
    /// `Box<dyn Worker>` owned by its spawned container task).
    pub fn start_all(&self) {
        for module in self.modules.values() {
            let envelope = Envelope::new(Header::new(message_type::SERVICE, "manager"), serde_json::json!({ "action": "start" }));
            let _ = module.inbox.send(envelope);
        }
    }

    pub fn stop_all(&self) {
        for module in self.modules.values() {
            let envelope = Envelope::new(Header::new(message_type::SERVICE, "manager"), serde_json::json!({ "action": "stop" }));
            let _ = module.inbox.send(envelope);
        }
    }

    /// Aborts every running task immediately -- no drain, no grace period.
    /// Used by `restart`; for an orderly shutdown use `shutdown` instead.
    pub fn kill_all(&mut self) {
        for (_, module) in self.modules.drain() {
            module.abort();
        }
        for handle in self.schedulers.drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.alerter.take() {
            handle.abort();
        }
        if let Some(handle) = self.router.take() {
            handle.abort();
        }
    }

    /// Drops each module's inbox sender so its message loop drains and
    /// exits on its own, then joins every task with `timeout`. Intended for
    /// `SIGINT`; does not reload configuration.
    ///
    /// The router must be aborted *before* the per-module drain: it holds
    /// its own clone of every module's inbox sender (so it can route
    /// incoming bus messages), and a module's `rx.recv()` only returns
    /// `None` once every sender -- the module's own plus the router's
    /// clone -- has been dropped. Draining first would leave the router's
    /// clone alive and every module waiting out the full timeout.
    pub async fn shutdown(&mut self, timeout: Duration) {
        if let Some(handle) = self.router.take() {
            handle.abort();
        }
        for handle in self.schedulers.drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.alerter.take() {
            handle.abort();
        }

        let modules = std::mem::take(&mut self.modules);
        for (_, module) in modules {
            module.shutdown(timeout).await;
        }
    }

    /// `kill_all`, a fixed grace period, then a full reload from
    /// `config_path` -- `SIGHUP`'s handler.
    pub async fn restart(&mut self, config_path: &Path, alert_rx: mpsc::UnboundedReceiver<AlertRecord>) -> Result<()> {
        self.kill_all();
        tokio::time::sleep(Duration::from_secs(3)).await;
        let fresh = Self::bootstrap(config_path, alert_rx).await?;
        *self = fresh;
        self.start_all();
        Ok(())
    }
}

fn spawn_router(
    bus: Arc<BusClient>,
    mut downlink_rx: mpsc::UnboundedReceiver<(String, Envelope)>,
    inboxes: HashMap<String, mpsc::UnboundedSender<Envelope>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((topic, envelope)) = downlink_rx.recv().await {
            let Some(tail) = bus.strip_project_prefix(&topic) else {
                warn!(topic, "received message outside this node's topic namespace");
                continue;
            };
            match inboxes.get(tail) {
                Some(inbox) => {
                    if inbox.send(envelope).is_err() {
                        debug!(module = tail, "module inbox closed, dropping routed message");
                    }
                }
                None => debug!(topic, tail, "no module subscribed to this topic"),
            }
        }
    })
}

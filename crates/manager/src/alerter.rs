//! Drains the logging crate's warning+ channel and turns every record into
//! an `alert` message per configured agent module and receiver, grounded in
//! `modules/notification.py`'s dispatch loop and spec.md §4.J.

use std::sync::Arc;

use chrono::Utc;
use sensorflow_bus::{BusClient, Qos};
use sensorflow_logging::AlertRecord;
use sensorflow_protocol::{message_type, Envelope, Header};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

pub struct Alerter;

impl Alerter {
    /// Spawns the drain loop. `agents` are the bus topics of configured
    /// transport-agent modules (e.g. an `AlertMessageFormatter` instance);
    /// `receivers` are the configured alert recipients, one `alert` message
    /// is emitted per agent per receiver for every record.
    pub fn spawn(
        mut alert_rx: mpsc::UnboundedReceiver<AlertRecord>,
        agents: Vec<String>,
        receivers: Vec<String>,
        bus: Arc<BusClient>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(record) = alert_rx.recv().await {
                for agent in &agents {
                    for receiver in &receivers {
                        let payload = serde_json::json!({
                            "dt": Utc::now().to_rfc3339(),
                            "level": record.level,
                            "name": record.target,
                            "message": record.message,
                            "receiver": receiver,
                        });
                        let envelope = Envelope::new(Header::new(message_type::ALERT, "alerter"), payload);
                        if let Err(e) = bus.publish(agent, &envelope, Qos::AtMostOnce, false) {
                            warn!(agent, error = %e, "failed to publish alert message");
                        }
                    }
                }
            }
        })
    }
}

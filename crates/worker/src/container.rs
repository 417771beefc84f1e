//! `Module` pairs one worker with one bus connection and an inbox, and runs
//! the worker's strictly-serial message loop as a single task.
//!
//! Grounded in `core/module.py::Module`: a messenger/worker pair, a blocking
//! inbox, and a `run()` loop that processes exactly one message at a time so
//! a worker never observes two of its own messages concurrently.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use sensorflow_bus::{BusClient, Qos};
use sensorflow_protocol::Envelope;
use sensorflow_schema::SchemaRegistry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::prototype::{dispatch, Worker};

/// Handle to a running module: the inbox sender (used by the bus downlink
/// router to hand this module its messages) and the task running its
/// message loop.
pub struct Module {
    pub name: String,
    pub inbox: mpsc::UnboundedSender<Envelope>,
    task: JoinHandle<()>,
}

impl Module {
    /// Spawns the worker's message loop. `bus` is used only to publish; the
    /// caller is responsible for routing incoming bus messages for this
    /// worker's topic into the returned `inbox`.
    pub fn spawn(mut worker: Box<dyn Worker>, schema: Arc<SchemaRegistry>, bus: Arc<BusClient>) -> Self {
        let name = worker.name().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let task = tokio::spawn(async move {
            let mut ticker = worker.tick_interval().map(tokio::time::interval);

            loop {
                let envelope = match &mut ticker {
                    Some(interval) => {
                        tokio::select! {
                            biased;
                            maybe_envelope = rx.recv() => match maybe_envelope {
                                Some(envelope) => envelope,
                                None => break,
                            },
                            _ = interval.tick() => {
                                let bus = bus.clone();
                                let publish = move |target: &str, header: sensorflow_protocol::Header, payload: serde_json::Value, retain: bool| {
                                    let envelope = Envelope::new(header, payload);
                                    if let Err(e) = bus.publish(target, &envelope, Qos::AtMostOnce, retain) {
                                        warn!(target, error = %e, "failed to publish routed message");
                                    }
                                };
                                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                                    worker.on_tick(&publish);
                                }));
                                if let Err(panic) = result {
                                    error!(worker = %worker.name(), ?panic, "worker tick panicked, continuing");
                                }
                                continue;
                            }
                        }
                    }
                    None => match rx.recv().await {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };

                let bus = bus.clone();
                let publish = move |target: &str, header: sensorflow_protocol::Header, payload: serde_json::Value, retain: bool| {
                    let envelope = Envelope::new(header, payload);
                    if let Err(e) = bus.publish(target, &envelope, Qos::AtMostOnce, retain) {
                        warn!(target, error = %e, "failed to publish routed message");
                    }
                };

                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    dispatch(worker.as_mut(), &*schema, envelope, &publish);
                }));

                if let Err(panic) = result {
                    error!(worker = %worker.name(), ?panic, "worker handler panicked, continuing");
                }
            }
        });

        Self { name, inbox: tx, task }
    }

    /// Drops the inbox sender so the worker's `recv()` loop ends, then
    /// waits up to `timeout` for the task to finish.
    pub async fn shutdown(self, timeout: std::time::Duration) {
        drop(self.inbox);
        if tokio::time::timeout(timeout, self.task).await.is_err() {
            warn!(module = %self.name, "module task did not finish within shutdown timeout");
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

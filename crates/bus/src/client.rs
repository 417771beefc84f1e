//! MQTT bus client. Wraps `rumqttc::AsyncClient`/`EventLoop` behind a small
//! publish/subscribe/downlink surface, with project-scoped topic
//! namespacing and automatic re-subscription on reconnect.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS as RumqttQos};
use sensorflow_protocol::Envelope;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{BusError, Result};

const MIN_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<Qos> for RumqttQos {
    fn from(q: Qos) -> Self {
        match q {
            Qos::AtMostOnce => RumqttQos::AtMostOnce,
            Qos::AtLeastOnce => RumqttQos::AtLeastOnce,
            Qos::ExactlyOnce => RumqttQos::ExactlyOnce,
        }
    }
}

pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Connection parameters for `BusClient::connect`.
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// All topics passed to `subscribe`/`publish` are namespaced under
    /// `<project_topic>/`.
    pub project_topic: String,
    pub keep_alive: Duration,
    pub credentials: Option<Credentials>,
    /// Retained last-will payload published by the broker if this client
    /// disconnects uncleanly; topic is `<project_topic>/status`.
    pub last_will_offline_payload: Option<Vec<u8>>,
}

pub struct BusClient {
    client: AsyncClient,
    project_topic: String,
    subscriptions: Arc<Mutex<HashSet<String>>>,
}

impl BusClient {
    /// Connects to the broker and spawns the event loop poll task. Returns
    /// immediately; the returned client is usable before the underlying
    /// TCP connection completes, matching `rumqttc`'s lazy-connect model.
    ///
    /// The downlink channel carries `(topic, envelope)` pairs rather than
    /// bare envelopes: a single client fans in messages for every worker's
    /// topic, so the caller (the manager's router) needs the topic to know
    /// which module's inbox a message belongs to.
    pub fn connect(config: BusConfig) -> (Self, mpsc::UnboundedReceiver<(String, Envelope)>) {
        let mut options = MqttOptions::new(config.client_id, config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);

        if let Some(creds) = &config.credentials {
            options.set_credentials(&creds.username, &creds.password);
        }

        if let Some(payload) = config.last_will_offline_payload {
            options.set_last_will(rumqttc::LastWill {
                topic: format!("{}/status", config.project_topic),
                message: payload.into(),
                qos: RumqttQos::AtLeastOnce,
                retain: true,
            });
        }

        let (client, event_loop) = AsyncClient::new(options, 256);
        let (downlink_tx, downlink_rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(Mutex::new(HashSet::new()));

        tokio::spawn(poll_event_loop(event_loop, client.clone(), subscriptions.clone(), downlink_tx));

        (
            Self {
                client,
                project_topic: config.project_topic,
                subscriptions,
            },
            downlink_rx,
        )
    }

    fn full_topic(&self, tail: &str) -> String {
        format!("{}/{}", self.project_topic, tail)
    }

    /// Strips the `<project_topic>/` prefix from a wire topic, returning
    /// the tail (usually a worker name) used to route a downlink message
    /// to the right module inbox.
    pub fn strip_project_prefix<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic.strip_prefix(&self.project_topic)?.strip_prefix('/')
    }

    /// Subscribes to `<project_topic>/<tail>`. Tracked so the subscription
    /// survives a reconnect.
    pub async fn subscribe(&self, tail: &str) -> Result<()> {
        let topic = self.full_topic(tail);
        self.client
            .subscribe(&topic, RumqttQos::AtLeastOnce)
            .await
            .map_err(|e| BusError::Subscribe(topic.clone(), e.to_string()))?;
        self.subscriptions.lock().await.insert(topic);
        Ok(())
    }

    /// Publishes fire-and-forget: the actual send happens on a spawned
    /// task so a slow or unreachable broker never blocks the caller.
    pub fn publish(&self, tail: &str, envelope: &Envelope, qos: Qos, retain: bool) -> Result<()> {
        let topic = self.full_topic(tail);
        let payload = envelope
            .to_json_string()
            .map_err(|e| BusError::Publish(topic.clone(), e.to_string()))?;
        let client = self.client.clone();
        let qos: RumqttQos = qos.into();
        let spawn_topic = topic.clone();
        tokio::spawn(async move {
            if let Err(e) = client.publish(&spawn_topic, qos, retain, payload).await {
                warn!(topic = %spawn_topic, error = %e, "failed to publish message");
            }
        });
        Ok(())
    }
}

async fn poll_event_loop(
    mut event_loop: rumqttc::EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    downlink_tx: mpsc::UnboundedSender<(String, Envelope)>,
) {
    let mut backoff_ms = MIN_BACKOFF_MS;
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                backoff_ms = MIN_BACKOFF_MS;
                match Envelope::from_json_slice(&publish.payload) {
                    Ok(envelope) => {
                        if downlink_tx.send((publish.topic.clone(), envelope)).is_err() {
                            warn!("downlink receiver dropped, discarding message");
                        }
                    }
                    Err(e) => {
                        warn!(topic = %publish.topic, error = %e, "dropping message that failed to decode");
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff_ms = MIN_BACKOFF_MS;
                info!("connected to broker");
                let topics: Vec<String> = subscriptions.lock().await.iter().cloned().collect();
                for topic in topics {
                    if let Err(e) = client.subscribe(&topic, RumqttQos::AtLeastOnce).await {
                        error!(topic = %topic, error = %e, "failed to re-subscribe after reconnect");
                    }
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::PingResp)) => {
                debug!("ping response received");
            }
            Ok(Event::Outgoing(_)) => {}
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, backoff_ms, "broker connection error, retrying");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_maps_to_rumqttc_levels() {
        assert_eq!(RumqttQos::from(Qos::AtMostOnce), RumqttQos::AtMostOnce);
        assert_eq!(RumqttQos::from(Qos::AtLeastOnce), RumqttQos::AtLeastOnce);
        assert_eq!(RumqttQos::from(Qos::ExactlyOnce), RumqttQos::ExactlyOnce);
    }
}

//! The self-routing `Observation` record.
//!
//! An observation carries its own routing state (`receivers`/`nextReceiver`)
//! so that any worker along the chain can decide where it goes next without
//! consulting an external routing table. See `prototype.py::publish_observation`
//! in the original runtime for the routing arithmetic this mirrors.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtocolError;

/// A single named request/response exchange a sensor performs, e.g. a
/// serial command and the pattern used to parse its reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestSet {
    pub enabled: bool,
    pub request: String,
    #[serde(default)]
    pub response: String,
    #[serde(rename = "responsePattern", default)]
    pub response_pattern: String,
    #[serde(rename = "responseDelimiter", default)]
    pub response_delimiter: String,
    #[serde(default)]
    pub timeout: f64,
    #[serde(rename = "sleepTime", default)]
    pub sleep_time: f64,
}

/// A tagged numeric/string value extracted from a sensor response.
///
/// The original runtime keeps this untyped (a bare Python value); tagging it
/// here removes a class of bugs where a `float` response set silently holds
/// a string because parsing was skipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResponseValue {
    Int(i64),
    Float(f64),
    Str(String),
    Null,
}

impl ResponseValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResponseValue::Float(v) => Some(*v),
            ResponseValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ResponseValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ResponseValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseSet {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_response_value")]
    pub value: ResponseValue,
}

fn default_response_value() -> ResponseValue {
    ResponseValue::Null
}

/// Pure factory, mirrors `Observation.create_response_set` in the original
/// runtime: it never mutates an existing response set, it only builds the
/// dict-like structure a worker then assigns.
pub fn create_response_set(
    kind: impl Into<String>,
    unit: impl Into<String>,
    value: ResponseValue,
) -> ResponseSet {
    ResponseSet {
        kind: kind.into(),
        unit: unit.into(),
        value,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub id: String,
    pub name: String,
    pub target: String,
    #[serde(rename = "sensorName", default)]
    pub sensor_name: String,
    #[serde(rename = "sensorType", default)]
    pub sensor_type: String,
    #[serde(rename = "portName", default)]
    pub port_name: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub project: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub onetime: bool,
    #[serde(default)]
    pub corrupted: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(rename = "sleepTime", default)]
    pub sleep_time: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub receivers: Vec<String>,
    #[serde(rename = "nextReceiver", default)]
    pub next_receiver: i64,
    #[serde(rename = "requestsOrder", default)]
    pub requests_order: Vec<String>,
    #[serde(rename = "requestSets", default)]
    pub request_sets: HashMap<String, RequestSet>,
    #[serde(rename = "responseSets", default)]
    pub response_sets: HashMap<String, ResponseSet>,
}

fn default_true() -> bool {
    true
}

impl Observation {
    /// Builds a fresh observation from a sensor template. `receivers` is
    /// cloned by value; the caller's template is never shared or mutated.
    pub fn new(name: impl Into<String>, target: impl Into<String>, receivers: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name: name.into(),
            target: target.into(),
            sensor_name: String::new(),
            sensor_type: String::new(),
            port_name: String::new(),
            node: String::new(),
            project: String::new(),
            enabled: true,
            onetime: false,
            corrupted: false,
            attempts: 0,
            sleep_time: 0.0,
            timestamp: None,
            receivers,
            next_receiver: 0,
            requests_order: Vec::new(),
            request_sets: HashMap::new(),
            response_sets: HashMap::new(),
        }
    }

    /// Deep clone suitable for dispatching an independent run of a
    /// recurring job. The clone gets a fresh id; everything else, including
    /// request/response sets, is copied by value so neither observation can
    /// observe the other's mutations afterwards. `timestamp` is left
    /// untouched (`None` on a fresh template) -- it is set by the port
    /// worker on response receipt and must never be rewritten downstream.
    pub fn clone_for_dispatch(&self) -> Self {
        let mut clone = self.clone();
        clone.id = Uuid::new_v4().simple().to_string();
        clone
    }

    /// Short-circuiting nested lookup, mirrors `Observation.get_value` in the
    /// original runtime: `get_value(&["responseSets", "t1", "value"])`. Returns
    /// `None` as soon as any path segment is absent, rather than erroring.
    pub fn get_value(&self, path: &[&str]) -> Option<Value> {
        let root = serde_json::to_value(self).ok()?;
        let mut cur = &root;
        for seg in path {
            cur = cur.get(seg)?;
        }
        Some(cur.clone())
    }

    pub fn response_value(&self, response_set: &str) -> Option<&ResponseValue> {
        self.response_sets.get(response_set).map(|rs| &rs.value)
    }

    pub fn set_response_value(&mut self, response_set: &str, kind: &str, unit: &str, value: ResponseValue) {
        self.response_sets
            .insert(response_set.to_string(), create_response_set(kind, unit, value));
    }

    /// `true` once every receiver has processed the observation.
    pub fn is_finished(&self) -> bool {
        self.next_receiver < 0 || self.next_receiver as usize >= self.receivers.len()
    }

    /// Decodes an observation out of a message envelope's `payload`, used at
    /// the boundary where a worker's handler table routes a message to
    /// `handle_observation`. A decode failure here is always a dropped
    /// message, never a propagated panic -- see `ProtocolError::Decode`.
    pub fn from_payload(payload: Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_observation_has_unique_id() {
        let a = Observation::new("n", "t", vec!["a".into()]);
        let b = Observation::new("n", "t", vec!["a".into()]);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn clone_for_dispatch_does_not_share_ids() {
        let template = Observation::new("n", "t", vec!["a".into(), "b".into()]);
        let one = template.clone_for_dispatch();
        let two = template.clone_for_dispatch();
        assert_ne!(one.id, two.id);
        assert_ne!(one.id, template.id);
    }

    #[test]
    fn get_value_short_circuits_on_missing_segment() {
        let obs = Observation::new("n", "t", vec![]);
        assert_eq!(obs.get_value(&["responseSets", "missing", "value"]), None);
    }

    #[test]
    fn get_value_finds_response_value() {
        let mut obs = Observation::new("n", "t", vec![]);
        obs.set_response_value("t1", "float", "C", ResponseValue::Float(12.5));
        let v = obs.get_value(&["responseSets", "t1", "value"]).unwrap();
        assert_eq!(v, serde_json::json!(12.5));
    }

    #[test]
    fn is_finished_when_next_receiver_exceeds_len() {
        let mut obs = Observation::new("n", "t", vec!["a".into()]);
        assert!(!obs.is_finished());
        obs.next_receiver = 1;
        assert!(obs.is_finished());
    }

    #[test]
    fn integral_json_number_deserializes_as_int_not_float() {
        let value: ResponseValue = serde_json::from_value(serde_json::json!(13)).unwrap();
        assert_eq!(value, ResponseValue::Int(13));
        assert_eq!(value.as_i64(), Some(13));
    }

    #[test]
    fn fractional_json_number_deserializes_as_float() {
        let value: ResponseValue = serde_json::from_value(serde_json::json!(25.9)).unwrap();
        assert_eq!(value, ResponseValue::Float(25.9));
    }

    #[test]
    fn return_code_round_trips_through_json_as_int() {
        let mut obs = Observation::new("n", "t", vec!["a".into()]);
        obs.set_response_value("returnCode", "integer", "", ResponseValue::Int(13));
        let payload = serde_json::to_value(&obs).unwrap();
        let round_tripped = Observation::from_payload(payload).unwrap();
        assert_eq!(round_tripped.response_value("returnCode").and_then(ResponseValue::as_i64), Some(13));
    }

    #[test]
    fn is_finished_when_no_receivers() {
        let obs = Observation::new("n", "t", vec![]);
        assert!(obs.is_finished());
    }
}

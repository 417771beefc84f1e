//! Sensor templates: the static description of a physical sensor and the
//! observations it can produce, loaded once from configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::observation::{Observation, RequestSet};

/// Well-known sensor type groupings, mirrors `SensorType` in the original
/// runtime. Used by workers that special-case total stations (which speak a
/// request/response protocol) versus weather stations (which push data
/// unsolicited).
pub struct SensorType;

impl SensorType {
    pub const TOTAL_STATIONS: &'static [&'static str] = &["TM30", "TS16"];
    pub const WEATHER_STATIONS: &'static [&'static str] = &["WXT520"];

    pub fn is_total_station(sensor_type: &str) -> bool {
        Self::TOTAL_STATIONS.contains(&sensor_type)
    }

    pub fn is_weather_station(sensor_type: &str) -> bool {
        Self::WEATHER_STATIONS.contains(&sensor_type)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservationTemplate {
    pub name: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub receivers: Vec<String>,
    #[serde(rename = "requestsOrder", default)]
    pub requests_order: Vec<String>,
    #[serde(rename = "requestSets", default)]
    pub request_sets: HashMap<String, RequestSet>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sensor {
    pub name: String,
    #[serde(rename = "type")]
    pub sensor_type: String,
    pub description: String,
    #[serde(default)]
    pub observations: Vec<ObservationTemplate>,
}

impl Sensor {
    /// Builds the fixed set of observations this sensor can produce. Escape
    /// sequences in `request`/`responsePattern`/`responseDelimiter` are
    /// decoded exactly once here, at template-construction time, never on
    /// every dispatch — matching `Sensor.create_observation` in the original
    /// runtime, which un-escapes when the sensor is loaded rather than per
    /// observation.
    pub fn build_observations(&self) -> HashMap<String, Observation> {
        let mut out = HashMap::new();
        for tmpl in &self.observations {
            let mut obs = Observation::new(tmpl.name.clone(), tmpl.target.clone(), tmpl.receivers.clone());
            obs.sensor_name = self.name.clone();
            obs.sensor_type = self.sensor_type.clone();
            obs.requests_order = tmpl.requests_order.clone();
            obs.request_sets = tmpl
                .request_sets
                .iter()
                .map(|(k, rs)| {
                    let mut rs = rs.clone();
                    rs.request = unescape(&rs.request);
                    rs.response_pattern = unescape(&rs.response_pattern);
                    rs.response_delimiter = unescape(&rs.response_delimiter);
                    (k.clone(), rs)
                })
                .collect();
            out.insert(tmpl.name.clone(), obs);
        }
        out
    }
}

/// Resolves the handful of backslash escapes sensor configurations use for
/// control characters in serial request strings (e.g. `\r\n`). Equivalent in
/// effect to Python's `codecs.decode(x, 'unicode_escape')` restricted to the
/// escapes that actually occur in sensor protocols.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('n') => {
                out.push('\n');
                chars.next();
            }
            Some('r') => {
                out.push('\r');
                chars.next();
            }
            Some('t') => {
                out.push('\t');
                chars.next();
            }
            Some('\\') => {
                out.push('\\');
                chars.next();
            }
            _ => out.push('\\'),
        }
    }
    out
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SensorCatalog {
    #[serde(default)]
    pub sensors: Vec<Sensor>,
}

impl SensorCatalog {
    pub fn find(&self, name: &str) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_resolves_crlf() {
        assert_eq!(unescape("GET\\r\\n"), "GET\r\n");
    }

    #[test]
    fn unescape_leaves_plain_text_untouched() {
        assert_eq!(unescape("plain"), "plain");
    }

    #[test]
    fn build_observations_escapes_once_per_template() {
        let mut request_sets = HashMap::new();
        request_sets.insert(
            "r1".to_string(),
            RequestSet {
                enabled: true,
                request: "PING\\r\\n".to_string(),
                response: String::new(),
                response_pattern: String::new(),
                response_delimiter: String::new(),
                timeout: 1.0,
                sleep_time: 0.0,
            },
        );
        let sensor = Sensor {
            name: "s1".into(),
            sensor_type: "TM30".into(),
            description: "d".into(),
            observations: vec![ObservationTemplate {
                name: "obs1".into(),
                target: "port1".into(),
                receivers: vec!["com1".into()],
                requests_order: vec!["r1".into()],
                request_sets,
            }],
        };
        let built = sensor.build_observations();
        let obs = built.get("obs1").unwrap();
        assert_eq!(obs.request_sets["r1"].request, "PING\r\n");
    }

    #[test]
    fn sensor_type_classification() {
        assert!(SensorType::is_total_station("TM30"));
        assert!(!SensorType::is_weather_station("TM30"));
        assert!(SensorType::is_weather_station("WXT520"));
    }
}

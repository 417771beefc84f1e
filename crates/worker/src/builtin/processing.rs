//! Regex-based response extraction and return-code-driven retry, grounded
//! in `module/processing.py::PreProcessor` and `ReturnCodeInspector`.

use std::collections::HashMap;

use regex::Regex;
use sensorflow_protocol::{Observation, ResponseValue};
use tracing::{debug, error, warn};

use crate::prototype::{HandlerTable, Worker};

/// Extracts named groups from each enabled request's raw response using its
/// `responsePattern`, converting the extracted string to the response set's
/// declared type. Has nothing to configure: the patterns live on the
/// request sets themselves.
pub struct PreProcessor {
    name: String,
    running: bool,
    handlers: HandlerTable,
}

impl PreProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: true,
            handlers: HandlerTable::with_defaults(),
        }
    }

    /// Replaces `,` with `.` before parsing; returns `None` (leaving the
    /// existing response value untouched) when the result still isn't a
    /// valid float.
    fn to_float(raw_value: &str) -> Option<f64> {
        let dot_value = raw_value.replace(',', ".");
        match dot_value.parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(raw_value, "value could not be converted (invalid float)");
                None
            }
        }
    }

    fn to_int(raw_value: &str) -> Option<i64> {
        match raw_value.parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(raw_value, "value could not be converted (invalid integer)");
                None
            }
        }
    }
}

impl Worker for PreProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn worker_type(&self) -> &str {
        "modules.processing.PreProcessor"
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

    fn process_observation(&mut self, mut obs: Observation) -> Observation {
        let requests_order = obs.requests_order.clone();
        let set_names: Vec<String> = obs.request_sets.keys().cloned().collect();

        for set_name in set_names {
            let request_set = obs.request_sets.get(&set_name).expect("key from own keys()");
            if !request_set.enabled || !requests_order.contains(&set_name) {
                continue;
            }

            let response = request_set.response.clone();
            let pattern_str = request_set.response_pattern.clone();

            if response.is_empty() {
                warn!(
                    set_name, name = %obs.name, target_name = %obs.target, sensor = %obs.sensor_name,
                    "no response in observation"
                );
                continue;
            }

            let pattern = match Regex::new(&pattern_str) {
                Ok(p) => p,
                Err(_) => {
                    error!(set_name, name = %obs.name, "invalid regular expression for response");
                    return obs;
                }
            };

            if pattern.captures_len() <= 1 {
                error!(name = %obs.name, target_name = %obs.target, "no group(s) defined in extraction pattern");
                return obs;
            }

            let captures = match pattern.captures(&response) {
                Some(c) => c,
                None => {
                    error!(set_name, name = %obs.name, "response does not match extraction pattern");
                    return obs;
                }
            };

            let group_names: Vec<&str> = pattern.capture_names().flatten().collect();
            let mut extracted: HashMap<String, String> = HashMap::new();
            for group_name in group_names {
                if let Some(m) = captures.name(group_name) {
                    extracted.insert(group_name.to_string(), m.as_str().to_string());
                }
            }

            for (group_name, raw_value) in extracted {
                if raw_value.is_empty() {
                    error!(group_name, name = %obs.name, "undefined raw value in response set");
                    continue;
                }

                let Some(response_set) = obs.response_sets.get_mut(&group_name) else {
                    error!(group_name, name = %obs.name, "undefined response set");
                    continue;
                };

                let response_value = match response_set.kind.to_lowercase().as_str() {
                    "float" => Self::to_float(&raw_value).map(ResponseValue::Float),
                    "integer" => Self::to_int(&raw_value).map(ResponseValue::Int),
                    _ => Some(ResponseValue::Str(raw_value.clone())),
                };

                if let Some(value) = response_value {
                    debug!(group_name, name = %obs.name, "extracted value from raw response");
                    response_set.value = value;
                }
            }
        }

        obs
    }
}

/// Known GeoCOM-style return codes: `(log level 1..5, retry-eligible,
/// message)`. Grounded in `modules/processing.py::ReturnCodes.codes`;
/// incomplete by design, same as the original.
fn return_codes() -> &'static HashMap<i64, (u8, bool, &'static str)> {
    use std::sync::OnceLock;
    static CODES: OnceLock<HashMap<i64, (u8, bool, &'static str)>> = OnceLock::new();
    CODES.get_or_init(|| {
        HashMap::from([
            (2, (4, false, "unknown error, result unspecified")),
            (3, (3, false, "invalid result")),
            (4, (4, false, "fatal error")),
            (5, (4, false, "command unknown (not implemented yet)")),
            (6, (4, false, "function execution timed out (result unspecified)")),
            (13, (4, true, "system busy")),
            (514, (4, false, "several targets detected")),
            (1283, (3, false, "measurement without full correction")),
            (1284, (3, false, "accuracy can not be guaranteed")),
            (1285, (4, true, "only angle measurement valid")),
            (1288, (3, false, "only angle measurement valid, but without full correction")),
            (1292, (4, true, "distance measurement not done (no aim, etc.)")),
            (8704, (4, true, "position not reached")),
            (8708, (4, true, "position not exactly reached")),
            (8710, (4, true, "no target detected")),
            (8711, (4, false, "multiple targets detected")),
            (8714, (4, false, "target acquisition not enabled")),
            (8716, (4, true, "target position not exactly reached")),
        ])
    })
}

/// Inspects a configured response set for a numeric return code and either
/// retries the observation (resetting `nextReceiver` to 0 so the scheduler's
/// dispatch path re-runs it) or marks it `corrupted`, grounded line-for-line
/// in `ReturnCodeInspector.process_observation`.
pub struct ReturnCodeInspector {
    name: String,
    running: bool,
    handlers: HandlerTable,
    response_sets: Vec<String>,
    retries: u32,
}

impl ReturnCodeInspector {
    pub fn new(name: impl Into<String>, response_sets: Vec<String>, retries: u32) -> Self {
        Self {
            name: name.into(),
            running: true,
            handlers: HandlerTable::with_defaults(),
            response_sets,
            retries,
        }
    }
}

impl Worker for ReturnCodeInspector {
    fn name(&self) -> &str {
        &self.name
    }

    fn worker_type(&self) -> &str {
        "modules.processing.ReturnCodeInspector"
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

    fn process_observation(&mut self, mut obs: Observation) -> Observation {
        for response_set in &self.response_sets {
            let return_code = match obs.response_value(response_set).and_then(ResponseValue::as_i64) {
                Some(code) => code,
                None => continue,
            };

            if return_code == 0 {
                if obs.corrupted {
                    obs.corrupted = false;
                }
                continue;
            }

            let error_values = return_codes().get(&return_code);
            let attempts = obs.attempts;

            if error_values.is_some() && attempts < self.retries {
                obs.attempts = attempts + 1;
                obs.corrupted = false;
                obs.next_receiver = 0;

                tracing::info!(
                    name = %obs.name, target_name = %obs.target, return_code, response_set,
                    attempt = attempts + 1, retries = self.retries,
                    "retrying observation due to return code"
                );
            } else {
                obs.corrupted = true;

                if let Some((level, _retry, message)) = error_values {
                    log_return_code(*level, &obs.name, &obs.target, return_code, response_set, message);
                } else {
                    error!(name = %obs.name, return_code, response_set, "unknown return code");
                }
            }
            return obs;
        }

        obs
    }
}

fn log_return_code(level: u8, name: &str, target_name: &str, return_code: i64, response_set: &str, message: &str) {
    match level {
        5 | 4 => error!(name, target_name, return_code, response_set, message, "return code inspector"),
        3 => warn!(name, target_name, return_code, response_set, message, "return code inspector"),
        2 => tracing::info!(name, target_name, return_code, response_set, message, "return code inspector"),
        1 => debug!(name, target_name, return_code, response_set, message, "return code inspector"),
        _ => tracing::trace!(name, target_name, return_code, response_set, message, "return code inspector"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorflow_protocol::{create_response_set, RequestSet};

    fn sample_observation() -> Observation {
        let mut obs = Observation::new("getDistance", "t1", vec!["a".into()]);
        obs.requests_order = vec!["r1".into()];
        obs.request_sets.insert(
            "r1".to_string(),
            RequestSet {
                enabled: true,
                request: "G".into(),
                response: "D=12.34".into(),
                response_pattern: r"D=(?P<slopeDist>[-0-9.,]+)".into(),
                response_delimiter: String::new(),
                timeout: 1.0,
                sleep_time: 0.0,
            },
        );
        obs.response_sets.insert(
            "slopeDist".to_string(),
            create_response_set("float", "m", ResponseValue::Null),
        );
        obs
    }

    #[test]
    fn preprocessor_extracts_float_value() {
        let mut worker = PreProcessor::new("pre1");
        let obs = worker.process_observation(sample_observation());
        assert_eq!(
            obs.response_sets["slopeDist"].value,
            ResponseValue::Float(12.34)
        );
    }

    #[test]
    fn preprocessor_leaves_value_on_bad_float() {
        let mut obs = sample_observation();
        obs.request_sets.get_mut("r1").unwrap().response = "D=notanumber".into();
        obs.request_sets.get_mut("r1").unwrap().response_pattern = r"D=(?P<slopeDist>.+)".into();
        let mut worker = PreProcessor::new("pre1");
        let obs = worker.process_observation(obs);
        assert_eq!(obs.response_sets["slopeDist"].value, ResponseValue::Null);
    }

    #[test]
    fn preprocessor_handles_comma_decimal() {
        let mut obs = sample_observation();
        obs.request_sets.get_mut("r1").unwrap().response = "D=12,34".into();
        let mut worker = PreProcessor::new("pre1");
        let obs = worker.process_observation(obs);
        assert_eq!(
            obs.response_sets["slopeDist"].value,
            ResponseValue::Float(12.34)
        );
    }

    #[test]
    fn return_code_inspector_retries_within_budget() {
        let mut obs = Observation::new("getDistance", "t1", vec!["a".into()]);
        obs.response_sets.insert(
            "returnCode".to_string(),
            create_response_set("integer", "", ResponseValue::Int(13)),
        );
        obs.next_receiver = 3;
        let mut worker = ReturnCodeInspector::new("rci1", vec!["returnCode".into()], 3);
        let obs = worker.process_observation(obs);
        assert!(!obs.corrupted);
        assert_eq!(obs.attempts, 1);
        assert_eq!(obs.next_receiver, 0);
    }

    #[test]
    fn return_code_inspector_marks_corrupted_once_retries_exhausted() {
        let mut obs = Observation::new("getDistance", "t1", vec!["a".into()]);
        obs.attempts = 3;
        obs.response_sets.insert(
            "returnCode".to_string(),
            create_response_set("integer", "", ResponseValue::Int(13)),
        );
        let mut worker = ReturnCodeInspector::new("rci1", vec!["returnCode".into()], 3);
        let obs = worker.process_observation(obs);
        assert!(obs.corrupted);
    }

    #[test]
    fn return_code_inspector_clears_corrupted_on_success_code() {
        let mut obs = Observation::new("getDistance", "t1", vec!["a".into()]);
        obs.corrupted = true;
        obs.response_sets.insert(
            "returnCode".to_string(),
            create_response_set("integer", "", ResponseValue::Int(0)),
        );
        let mut worker = ReturnCodeInspector::new("rci1", vec!["returnCode".into()], 3);
        let obs = worker.process_observation(obs);
        assert!(!obs.corrupted);
    }
}

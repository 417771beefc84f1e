//! JSON Schema registry: compiled validators keyed by logical name or by
//! worker class path.
//!
//! Bound once at startup (`bootstrap`) and read-mostly afterward, so reads
//! take an uncontended `parking_lot::RwLock` read guard rather than going
//! through a channel or mutex with real contention.

use std::collections::HashMap;
use std::sync::Arc;

use jsonschema::Validator;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Result, SchemaError};

const OBSERVATION_SCHEMA: &str = include_str!("schemas/observation.json");
const SERVICE_SCHEMA: &str = include_str!("schemas/service.json");
const ALERT_SCHEMA: &str = include_str!("schemas/alert.json");
const STATUS_SCHEMA: &str = include_str!("schemas/status.json");
const HEARTBEAT_SCHEMA: &str = include_str!("schemas/heartbeat.json");
const NODE_SCHEMA: &str = include_str!("schemas/node.json");
const PROJECT_SCHEMA: &str = include_str!("schemas/project.json");
const MODULES_SCHEMA: &str = include_str!("schemas/modules.json");
const SENSORS_SCHEMA: &str = include_str!("schemas/sensors.json");

pub struct SchemaRegistry {
    validators: RwLock<HashMap<String, Arc<Validator>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            validators: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the message-type schemas every worker handler table relies
    /// on (`observation`, `service`, `alert`, `status`, `heartbeat`) plus the
    /// core configuration-section schemas the manager validates at startup
    /// (`node`, `project`, `modules`, `sensors`).
    pub fn bootstrap() -> Result<Self> {
        let registry = Self::new();
        for (name, raw) in [
            ("observation", OBSERVATION_SCHEMA),
            ("service", SERVICE_SCHEMA),
            ("alert", ALERT_SCHEMA),
            ("status", STATUS_SCHEMA),
            ("heartbeat", HEARTBEAT_SCHEMA),
            ("node", NODE_SCHEMA),
            ("project", PROJECT_SCHEMA),
            ("modules", MODULES_SCHEMA),
            ("sensors", SENSORS_SCHEMA),
        ] {
            registry.add_schema_str(name, raw)?;
        }
        Ok(registry)
    }

    pub fn add_schema(&self, name: &str, schema: &Value) -> Result<()> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| SchemaError::Compile(name.to_string(), e.to_string()))?;
        self.validators
            .write()
            .insert(name.to_string(), Arc::new(validator));
        Ok(())
    }

    pub fn add_schema_str(&self, name: &str, raw: &str) -> Result<()> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| SchemaError::Compile(name.to_string(), e.to_string()))?;
        self.add_schema(name, &value)
    }

    pub fn has(&self, name: &str) -> bool {
        self.validators.read().contains_key(name)
    }

    pub fn validate(&self, name: &str, instance: &Value) -> Result<()> {
        let guard = self.validators.read();
        let validator = guard
            .get(name)
            .ok_or_else(|| SchemaError::NotFound(name.to_string()))?;
        if let Err(err) = validator.validate(instance) {
            return Err(SchemaError::Validation {
                schema: name.to_string(),
                errors: err.to_string(),
            });
        }
        Ok(())
    }

    /// Derives the on-disk schema path for a worker's class path, e.g.
    /// `modules.processing.PreProcessor` -> `modules/processing/preprocessor.json`,
    /// mirroring the way `ConfigManager.get_class_path` locates a worker's
    /// schema in the original runtime.
    pub fn schema_path_for_class(class_path: &str) -> String {
        let segments: Vec<String> = class_path
            .split('.')
            .map(|seg| seg.to_lowercase())
            .collect();
        format!("{}.json", segments.join("/"))
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_registers_reserved_schemas() {
        let registry = SchemaRegistry::bootstrap().unwrap();
        for name in [
            "observation",
            "service",
            "alert",
            "status",
            "heartbeat",
            "node",
            "project",
            "modules",
            "sensors",
        ] {
            assert!(registry.has(name), "missing schema {name}");
        }
    }

    #[test]
    fn validate_rejects_missing_required_field() {
        let registry = SchemaRegistry::bootstrap().unwrap();
        let bad = serde_json::json!({ "action": 5 });
        assert!(registry.validate("service", &bad).is_err());
    }

    #[test]
    fn validate_accepts_well_formed_service_message() {
        let registry = SchemaRegistry::bootstrap().unwrap();
        let good = serde_json::json!({ "action": "stop" });
        assert!(registry.validate("service", &good).is_ok());
    }

    #[test]
    fn validate_unknown_schema_name_errors() {
        let registry = SchemaRegistry::bootstrap().unwrap();
        let err = registry.validate("nonexistent", &serde_json::json!({}));
        assert!(matches!(err, Err(SchemaError::NotFound(_))));
    }

    #[test]
    fn schema_path_for_class_lowercases_and_slashes() {
        assert_eq!(
            SchemaRegistry::schema_path_for_class("modules.processing.PreProcessor"),
            "modules/processing/preprocessor.json"
        );
    }
}

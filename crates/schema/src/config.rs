//! Configuration tree access: a thin wrapper over `serde_json::Value` that
//! walks a dotted/segmented path and validates the subtree it finds against
//! a named schema, mirroring `ConfigManager.get_valid_config` in the
//! original runtime.

use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::error::ConfigError;
use crate::registry::SchemaRegistry;

pub struct Config {
    root: Value,
}

impl Config {
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let root = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn raw(&self) -> &Value {
        &self.root
    }

    /// Walks `path` through the tree. A missing segment at any depth is
    /// `ConfigError::PathNotFound` — the caller decides whether that is
    /// fatal (it is not, by itself; only an invalid-but-present subtree is).
    pub fn get_path(&self, path: &[&str]) -> Result<&Value, ConfigError> {
        let mut cur = &self.root;
        for seg in path {
            cur = cur
                .get(seg)
                .ok_or_else(|| ConfigError::PathNotFound(path.join(".")))?;
        }
        Ok(cur)
    }

    /// Walks to `path` and validates the subtree found there against the
    /// schema named `schema_name` in `registry`. A present-but-invalid
    /// subtree is fatal: the caller must not instantiate the worker or
    /// sensor the subtree describes.
    pub fn get_valid_config(
        &self,
        registry: &SchemaRegistry,
        schema_name: &str,
        path: &[&str],
    ) -> Result<&Value, ConfigError> {
        let value = self.get_path(path)?;
        registry.validate(schema_name, value)?;
        Ok(value)
    }
}

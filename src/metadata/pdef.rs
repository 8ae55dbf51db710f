//! # ArduPilot Parameter Definition Catalog
//!
//! Loads `apm.pdef.json`-style files. The document is an object of groups;
//! each group maps full parameter names to their definitions:
//!
//! ```text
//! {
//!   "json": { "version": 0 },
//!   "ATC_": {
//!     "ATC_ACCEL_P_MAX": {
//!       "DisplayName": "Acceleration Max for Pitch",
//!       "Units": "cdeg/s/s",
//!       "Range": { "low": "0", "high": "180000" },
//!       "RebootRequired": "True",
//!       "Values": { "0": "Disabled" }
//!     }
//!   }
//! }
//! ```
//!
//! Numbers are carried as strings. Malformed entries are skipped.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{MetadataCatalog, MetadataProvider, ParamMetadata};
use crate::error::{ParamSyncError, Result};

/// Metadata provider reading a parameter definition file
#[derive(Debug, Clone)]
pub struct PdefCatalog {
    path: PathBuf,
}

impl PdefCatalog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Parse a parameter definition document
    ///
    /// # Errors
    ///
    /// Returns error if the text is not JSON or its root is not an object
    pub fn parse(contents: &str) -> Result<MetadataCatalog> {
        let root: Value = serde_json::from_str(contents)?;
        let groups = root
            .as_object()
            .ok_or_else(|| ParamSyncError::Metadata("pdef root is not an object".to_string()))?;

        let mut catalog = MetadataCatalog::new();
        for (group_name, group) in groups {
            let Some(params) = group.as_object() else {
                continue;
            };
            for (name, definition) in params {
                match definition.as_object() {
                    Some(fields) if is_definition(fields) => {
                        catalog.insert(name, parse_definition(fields));
                    }
                    _ => debug!("Skipping non-parameter entry {} in group {:?}", name, group_name),
                }
            }
        }

        Ok(catalog)
    }
}

#[async_trait]
impl MetadataProvider for PdefCatalog {
    async fn load(&self) -> Result<MetadataCatalog> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        Self::parse(&contents)
    }
}

fn is_definition(fields: &Map<String, Value>) -> bool {
    ["DisplayName", "Description", "Units", "Range", "Values"]
        .iter()
        .any(|key| fields.contains_key(*key))
}

fn parse_definition(fields: &Map<String, Value>) -> ParamMetadata {
    let text = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_string);
    let range = fields.get("Range").and_then(Value::as_object);

    ParamMetadata {
        display_name: text("DisplayName"),
        description: text("Description"),
        units: text("Units"),
        min: range.and_then(|r| r.get("low")).and_then(number),
        max: range.and_then(|r| r.get("high")).and_then(number),
        default: fields.get("Default").and_then(number),
        reboot_required: fields
            .get("RebootRequired")
            .map(|v| match v {
                Value::Bool(b) => *b,
                Value::String(s) => s.eq_ignore_ascii_case("true"),
                _ => false,
            })
            .unwrap_or(false),
        values: fields
            .get("Values")
            .and_then(Value::as_object)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|(code, label)| {
                        let code = code.trim().parse::<i64>().ok()?;
                        Some((code, label.as_str()?.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// pdef numbers arrive as strings; accept real numbers too
fn number(value: &Value) -> Option<f32> {
    match value {
        Value::Number(n) => n.as_f64().map(|f| f as f32),
        Value::String(s) => s.trim().parse::<f32>().ok(),
        _ => None,
    }
}

//! # Parameter Model
//!
//! One named remote setting as the ground station knows it.

use serde::Serialize;

use crate::metadata::ParamMetadata;
use crate::protocol::{normalize_name, ParamType, ValueEcho, INVALID_INDEX};

/// Tolerance used when deciding whether a local edit differs from the device
const DIRTY_EPSILON: f32 = 1e-6;

/// Last-known state of a remote parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    /// Normalized name (cache key)
    pub name: String,

    /// Current value: the staged local edit, or the confirmed value
    pub value: f32,

    /// Last value confirmed by the device
    pub original_value: f32,

    /// How to interpret `value`
    pub param_type: ParamType,

    /// Position in the device table, or [`INVALID_INDEX`]
    pub index: u16,

    /// Enrichment from the metadata catalog
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ParamMetadata>,
}

impl Parameter {
    /// Create a confirmed parameter with no index and no metadata
    pub fn new(name: &str, value: f32, param_type: ParamType) -> Self {
        Self {
            name: normalize_name(name),
            value,
            original_value: value,
            param_type,
            index: INVALID_INDEX,
            metadata: None,
        }
    }

    /// Create a confirmed parameter from a device echo
    pub fn from_echo(echo: &ValueEcho) -> Self {
        Self {
            name: normalize_name(&echo.name),
            value: echo.value,
            original_value: echo.value,
            param_type: echo.param_type,
            index: if echo.has_valid_index() {
                echo.index
            } else {
                INVALID_INDEX
            },
            metadata: None,
        }
    }

    /// Does a staged local edit differ from the confirmed value?
    pub fn is_dirty(&self) -> bool {
        !self
            .param_type
            .values_match(self.value, self.original_value, DIRTY_EPSILON)
    }

    pub fn has_valid_index(&self) -> bool {
        self.index != INVALID_INDEX
    }

    /// Display name from metadata, falling back to the parameter name
    pub fn display_name(&self) -> &str {
        self.metadata
            .as_ref()
            .and_then(|m| m.display_name.as_deref())
            .unwrap_or(&self.name)
    }

    /// Value formatted for its type, with units when known
    pub fn display_value(&self) -> String {
        let value = self.param_type.format_value(self.value);
        match self.metadata.as_ref().and_then(|m| m.units.as_deref()) {
            Some(units) => format!("{} {}", value, units),
            None => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_echo() {
        let echo = ValueEcho::new("angle_max", 4500.0, ParamType::Int16, 4, 10);
        let param = Parameter::from_echo(&echo);
        assert_eq!(param.name, "ANGLE_MAX");
        assert_eq!(param.value, 4500.0);
        assert_eq!(param.original_value, 4500.0);
        assert_eq!(param.index, 4);
        assert!(!param.is_dirty());
    }

    #[test]
    fn test_from_echo_with_invalid_index() {
        let echo = ValueEcho::new("ANGLE_MAX", 4500.0, ParamType::Int16, INVALID_INDEX, 10);
        let param = Parameter::from_echo(&echo);
        assert!(!param.has_valid_index());
    }

    #[test]
    fn test_dirty_is_computed_from_values() {
        let mut param = Parameter::new("RC1_MIN", 1000.0, ParamType::Int16);
        assert!(!param.is_dirty());

        param.value = 1100.0;
        assert!(param.is_dirty());

        param.value = 1000.0;
        assert!(!param.is_dirty());
    }

    #[test]
    fn test_display_without_metadata() {
        let param = Parameter::new("ANGLE_MAX", 4500.0, ParamType::Int16);
        assert_eq!(param.display_name(), "ANGLE_MAX");
        assert_eq!(param.display_value(), "4500");
    }

    #[test]
    fn test_display_with_metadata() {
        let mut param = Parameter::new("ANGLE_MAX", 4500.0, ParamType::Int16);
        param.metadata = Some(ParamMetadata {
            display_name: Some("Angle Max".to_string()),
            units: Some("cdeg".to_string()),
            ..Default::default()
        });
        assert_eq!(param.display_name(), "Angle Max");
        assert_eq!(param.display_value(), "4500 cdeg");
    }
}

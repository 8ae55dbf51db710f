//! # Parameter Value Types
//!
//! Every value travels as a float32 on the wire; [`ParamType`] says how to
//! interpret and format it.

use serde::{Deserialize, Serialize};

/// Logical numeric type of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Real32,
}

impl ParamType {
    /// True for every integer type
    pub fn is_integer(self) -> bool {
        !matches!(self, Self::Real32)
    }

    /// Inclusive value range of the type
    pub fn range(self) -> (f64, f64) {
        match self {
            Self::UInt8 => (0.0, u8::MAX as f64),
            Self::Int8 => (i8::MIN as f64, i8::MAX as f64),
            Self::UInt16 => (0.0, u16::MAX as f64),
            Self::Int16 => (i16::MIN as f64, i16::MAX as f64),
            Self::UInt32 => (0.0, u32::MAX as f64),
            Self::Int32 => (i32::MIN as f64, i32::MAX as f64),
            Self::Real32 => (f32::MIN as f64, f32::MAX as f64),
        }
    }

    /// Coerce a float into what the device would store for this type
    ///
    /// Integer types round to the nearest integer and clamp to their range.
    pub fn coerce(self, value: f32) -> f32 {
        if !self.is_integer() {
            return value;
        }
        let (min, max) = self.range();
        (value as f64).round().clamp(min, max) as f32
    }

    /// Compare a device value against an intended one
    ///
    /// Integer types compare after coercion; floats use a relative tolerance.
    pub fn values_match(self, actual: f32, intended: f32, epsilon: f32) -> bool {
        if self.is_integer() {
            return self.coerce(actual) == self.coerce(intended);
        }
        let scale = actual.abs().max(intended.abs()).max(1.0);
        (actual - intended).abs() <= epsilon * scale
    }

    /// Human-readable value formatted for this type
    pub fn format_value(self, value: f32) -> String {
        if self.is_integer() {
            format!("{}", self.coerce(value) as i64)
        } else {
            format!("{}", value)
        }
    }
}

//! # Parameter Protocol Messages
//!
//! Core message definitions for parameter exchange with a flight controller.
//! Framing, checksums and versioning belong to the wire codec; these are the
//! messages after decoding.

use super::name::normalize_name;
use super::types::ParamType;

/// Index sentinel meaning "no stable position in the device table"
pub const INVALID_INDEX: u16 = u16::MAX;

/// System/component pair identifying one end of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    pub system_id: u8,
    pub component_id: u8,
}

impl DeviceAddress {
    pub fn new(system_id: u8, component_id: u8) -> Self {
        Self {
            system_id,
            component_id,
        }
    }

    /// Does a frame from `source` come from this device?
    ///
    /// Component id 0 addresses every component of the system.
    pub fn accepts(&self, source: &DeviceAddress) -> bool {
        self.system_id == source.system_id
            && (self.component_id == 0 || self.component_id == source.component_id)
    }
}

/// What a read request asks for
#[derive(Debug, Clone, PartialEq)]
pub enum ReadTarget {
    /// Read by name (single reads, write verification)
    Name(String),
    /// Read by table index (fetch recovery; the name may be unknown)
    Index(u16),
}

/// Messages the engine sends
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Ask the device to stream its whole table
    ListRequest,
    /// Ask for one parameter
    ReadRequest(ReadTarget),
    /// Write one parameter
    SetRequest {
        name: String,
        value: f32,
        param_type: ParamType,
    },
}

impl Outbound {
    /// Build a set request with a normalized name and a type-coerced value
    pub fn set(name: &str, value: f32, param_type: ParamType) -> Self {
        Self::SetRequest {
            name: normalize_name(name),
            value: param_type.coerce(value),
            param_type,
        }
    }

    /// Build a read-by-name request
    pub fn read_name(name: &str) -> Self {
        Self::ReadRequest(ReadTarget::Name(normalize_name(name)))
    }

    /// Build a read-by-index request
    pub fn read_index(index: u16) -> Self {
        Self::ReadRequest(ReadTarget::Index(index))
    }
}

/// Addressed outbound message
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub source: DeviceAddress,
    pub target: DeviceAddress,
    pub message: Outbound,
}

/// The device's value report
///
/// One message type serves as list item, read response and write
/// confirmation; callers correlate by name or index.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueEcho {
    /// Parameter name, as decoded from the wire id
    pub name: String,

    /// Current value on the device
    pub value: f32,

    /// Logical type
    pub param_type: ParamType,

    /// Position in the device table, or [`INVALID_INDEX`]
    pub index: u16,

    /// Total number of parameters the device announces
    pub total_count: u16,
}

impl ValueEcho {
    /// Create an echo with a normalized name
    pub fn new(name: &str, value: f32, param_type: ParamType, index: u16, total_count: u16) -> Self {
        Self {
            name: normalize_name(name),
            value,
            param_type,
            index,
            total_count,
        }
    }

    /// True when the index may count toward fetch completion
    pub fn has_valid_index(&self) -> bool {
        self.index != INVALID_INDEX && (self.total_count == 0 || self.index < self.total_count)
    }
}

/// Messages the engine receives
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Parameter value report
    ValueEcho(ValueEcho),
    /// Anything else the codec decoded (heartbeats, telemetry); ignored
    Other(u32),
}

/// Inbound message with its sender
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub source: DeviceAddress,
    pub message: Inbound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_accepts_matching_source() {
        let target = DeviceAddress::new(1, 1);
        assert!(target.accepts(&DeviceAddress::new(1, 1)));
        assert!(!target.accepts(&DeviceAddress::new(1, 2)));
        assert!(!target.accepts(&DeviceAddress::new(2, 1)));
    }

    #[test]
    fn test_address_component_zero_accepts_any_component() {
        let target = DeviceAddress::new(1, 0);
        assert!(target.accepts(&DeviceAddress::new(1, 1)));
        assert!(target.accepts(&DeviceAddress::new(1, 250)));
        assert!(!target.accepts(&DeviceAddress::new(3, 1)));
    }

    #[test]
    fn test_set_request_normalizes_and_coerces() {
        let msg = Outbound::set("angle_max ", 4500.4, ParamType::Int16);
        assert_eq!(
            msg,
            Outbound::SetRequest {
                name: "ANGLE_MAX".to_string(),
                value: 4500.0,
                param_type: ParamType::Int16,
            }
        );
    }

    #[test]
    fn test_read_requests() {
        assert_eq!(
            Outbound::read_name("rc1_min"),
            Outbound::ReadRequest(ReadTarget::Name("RC1_MIN".to_string()))
        );
        assert_eq!(
            Outbound::read_index(7),
            Outbound::ReadRequest(ReadTarget::Index(7))
        );
    }

    #[test]
    fn test_echo_index_validity() {
        assert!(ValueEcho::new("A", 1.0, ParamType::Real32, 0, 3).has_valid_index());
        assert!(!ValueEcho::new("A", 1.0, ParamType::Real32, INVALID_INDEX, 3).has_valid_index());
        // Out of the announced range
        assert!(!ValueEcho::new("A", 1.0, ParamType::Real32, 3, 3).has_valid_index());
    }
}

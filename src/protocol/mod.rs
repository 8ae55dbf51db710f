//! # Parameter Protocol Module
//!
//! Logical (already-decoded) messages of the flight controller parameter
//! protocol.
//!
//! This module handles:
//! - Request messages sent to the device (list, read, set)
//! - The single inbound message type, the value echo
//! - Parameter value types and their float32 wire representation
//! - Name normalization and the 16-byte wire id boundary

pub mod message;
pub mod name;
pub mod types;

pub use message::{
    DeviceAddress, Inbound, InboundFrame, Outbound, OutboundFrame, ReadTarget, ValueEcho,
    INVALID_INDEX,
};
pub use name::{normalize_name, names_match, PARAM_NAME_LEN};
pub use types::ParamType;

//! # Transport Module
//!
//! The link between the engine and the flight controller.
//!
//! The engine only needs two things from a link: a way to send addressed
//! messages ([`Transport`]) and a stream of decoded inbound frames (an
//! `mpsc::Receiver<InboundFrame>`). Serial, UDP or Bluetooth links plug in
//! by implementing the trait over their own codec.
//!
//! This module also provides:
//! - An in-memory link ([`memory_link`])
//! - A simulated flight controller with fault injection ([`SimulatedDevice`])

pub mod channel;
pub mod sim;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::OutboundFrame;

pub use channel::{memory_link, ChannelTransport, DeviceEnd};
pub use sim::{SimFaults, SimHandle, SimulatedDevice};

/// Send side of a link
///
/// Implementations report an unusable link as
/// [`ParamSyncError::NoConnection`](crate::error::ParamSyncError::NoConnection).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one addressed message
    async fn send(&self, frame: OutboundFrame) -> Result<()>;
}

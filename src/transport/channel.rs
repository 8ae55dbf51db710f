//! In-memory link built from tokio channels

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::Transport;
use crate::error::{ParamSyncError, Result};
use crate::protocol::{InboundFrame, OutboundFrame};

/// Engine side of an in-memory link
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<OutboundFrame>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: OutboundFrame) -> Result<()> {
        debug!("Sending {:?} to {:?}", frame.message, frame.target);
        self.tx
            .send(frame)
            .await
            .map_err(|_| ParamSyncError::NoConnection("link closed".to_string()))
    }
}

/// Device side of an in-memory link
#[derive(Debug)]
pub struct DeviceEnd {
    /// Requests sent by the engine
    pub requests: mpsc::Receiver<OutboundFrame>,
    /// Replies delivered to the engine
    pub replies: mpsc::Sender<InboundFrame>,
}

/// Create an in-memory link
///
/// # Arguments
///
/// * `capacity` - Queue depth in each direction
///
/// # Returns
///
/// The engine's transport, the engine's inbound receiver and the device end.
///
/// # Examples
///
/// ```
/// use param_sync::transport::memory_link;
///
/// let (transport, inbound, device) = memory_link(64);
/// # drop((transport, inbound, device));
/// ```
pub fn memory_link(
    capacity: usize,
) -> (ChannelTransport, mpsc::Receiver<InboundFrame>, DeviceEnd) {
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (in_tx, in_rx) = mpsc::channel(capacity);
    (
        ChannelTransport { tx: out_tx },
        in_rx,
        DeviceEnd {
            requests: out_rx,
            replies: in_tx,
        },
    )
}

//! Inbound message classifier
//!
//! The one long-lived task reading the link. Every value echo from the
//! target is written to the cache first and then broadcast, so a waiter
//! that sees an echo can rely on the cache already holding it.

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cache::ParameterCache;
use crate::protocol::{DeviceAddress, Inbound, InboundFrame, ValueEcho};

pub(crate) struct Listener {
    pub(crate) inbound: mpsc::Receiver<InboundFrame>,
    pub(crate) target: DeviceAddress,
    pub(crate) cache: ParameterCache,
    pub(crate) echoes: broadcast::Sender<ValueEcho>,
    pub(crate) link_down: CancellationToken,
    pub(crate) shutdown: CancellationToken,
}

impl Listener {
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Listener shutting down");
                    break;
                }
                frame = self.inbound.recv() => match frame {
                    Some(frame) => self.classify(frame),
                    None => {
                        warn!("Inbound link closed");
                        break;
                    }
                },
            }
        }

        self.link_down.cancel();
        info!("Parameter listener stopped");
    }

    fn classify(&self, frame: InboundFrame) {
        if !self.target.accepts(&frame.source) {
            trace!("Ignoring frame from {:?}", frame.source);
            return;
        }

        match frame.message {
            Inbound::ValueEcho(echo) => {
                trace!(
                    name = %echo.name,
                    value = echo.value,
                    index = echo.index,
                    total = echo.total_count,
                    "Value echo"
                );
                self.cache.apply_echo(&echo);
                // No receivers just means nobody is waiting right now
                let _ = self.echoes.send(echo);
            }
            Inbound::Other(id) => trace!("Ignoring message id {}", id),
        }
    }
}

//! Timeout-bounded waiting on the shared echo stream
//!
//! Each waiting operation subscribes to the broadcast of classified echoes,
//! filters by its own correlation key (name or index) and takes the first
//! match. Subscribing happens before the request is sent, so a fast reply
//! cannot slip past.

use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ParamSyncError, Result};
use crate::protocol::ValueEcho;

pub(crate) struct EchoWaiter<'a> {
    rx: broadcast::Receiver<ValueEcho>,
    link_down: &'a CancellationToken,
    cancel: &'a CancellationToken,
}

impl<'a> EchoWaiter<'a> {
    pub(crate) fn new(
        rx: broadcast::Receiver<ValueEcho>,
        link_down: &'a CancellationToken,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            rx,
            link_down,
            cancel,
        }
    }

    /// Next echo, or `None` once `deadline` passes
    pub(crate) async fn next(&mut self, deadline: Instant) -> Result<Option<ValueEcho>> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ParamSyncError::Cancelled),
                _ = self.link_down.cancelled() => {
                    return Err(ParamSyncError::NoConnection("link closed".to_string()));
                }
                received = self.rx.recv() => match received {
                    Ok(echo) => return Ok(Some(echo)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Echo stream lagged, {} echoes skipped", skipped);
                    }
                    Err(RecvError::Closed) => {
                        return Err(ParamSyncError::NoConnection("echo stream closed".to_string()));
                    }
                },
                _ = sleep_until(deadline) => return Ok(None),
            }
        }
    }

    /// First echo accepted by `accept` within `timeout`
    pub(crate) async fn wait_for<F>(
        &mut self,
        timeout: Duration,
        mut accept: F,
    ) -> Result<Option<ValueEcho>>
    where
        F: FnMut(&ValueEcho) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while let Some(echo) = self.next(deadline).await? {
            if accept(&echo) {
                return Ok(Some(echo));
            }
        }
        Ok(None)
    }
}

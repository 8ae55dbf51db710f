//! Single parameter write confirmed by echo
//!
//! The device acknowledges a write only by echoing the parameter back, the
//! same message it uses for list items and reads. An echo confirms the write
//! when both the name and the value agree; echoes of the old value (a list
//! burst still in flight, say) are skipped. When no confirmation arrives in
//! time the device is asked for the value directly before retrying, since
//! echoes get lost even when the write landed.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::EngineInner;
use crate::cache::Parameter;
use crate::error::{ParamSyncError, Result};
use crate::protocol::{names_match, normalize_name, Outbound, ParamType};

pub(crate) async fn set(
    inner: &EngineInner,
    name: &str,
    value: f32,
    param_type: ParamType,
    force: bool,
    cancel: &CancellationToken,
) -> Result<Parameter> {
    let config = &inner.write;
    let name = normalize_name(name);
    let value = param_type.coerce(value);
    let epsilon = config.value_epsilon;
    let agrees = |actual: f32| param_type.values_match(actual, value, epsilon);

    // One write per name at a time, so no call consumes another's echo
    let _serial = inner.lock_name(&name, cancel).await?;

    if !force {
        if let Some(cached) = inner.cache.get(&name) {
            if agrees(cached.original_value) {
                debug!("{} already holds {}, nothing to send", name, value);
                return Ok(inner.cache.revert(&name).unwrap_or(cached));
            }
        }
    }

    let mut last_read = None;
    for attempt in 1..=config.max_retries {
        let mut waiter = inner.waiter(cancel);
        inner.send(Outbound::set(&name, value, param_type)).await?;
        debug!(attempt, "Sent {} = {}", name, value);

        let echo = waiter
            .wait_for(config.attempt_timeout(), |echo| {
                names_match(&name, &echo.name) && agrees(echo.value)
            })
            .await?;
        if let Some(echo) = echo {
            info!("{} set to {}", name, param_type.format_value(echo.value));
            return Ok(inner.written(&echo));
        }

        debug!("No echo for {}, reading it back", name);
        let read = inner
            .read_remote(&name, config.read_timeout(), cancel)
            .await?;
        match &read {
            Some(echo) if agrees(echo.value) => {
                info!("{} confirmed by read-back", name);
                return Ok(inner.written(echo));
            }
            Some(echo) => warn!(
                "{} reads back as {} after writing {} (attempt {})",
                name, echo.value, value, attempt
            ),
            None => warn!("{} did not answer (attempt {})", name, attempt),
        }
        last_read = read.map(|echo| echo.value);

        if attempt < config.max_retries {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ParamSyncError::Cancelled),
                _ = tokio::time::sleep(config.retry_backoff()) => {}
            }
        }
    }

    Err(match last_read {
        Some(actual) => ParamSyncError::VerificationMismatch {
            name,
            expected: value,
            actual,
        },
        None => ParamSyncError::Timeout {
            name,
            attempts: config.max_retries,
        },
    })
}

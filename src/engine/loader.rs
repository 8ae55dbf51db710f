//! Metadata catalog loading
//!
//! The catalog decorates cache entries but is never required for a fetch.
//! Loads are bounded by the configured timeout and may run in the
//! background; a catalog that arrives late still decorates entries already
//! in the cache.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ParameterCache;
use crate::metadata::MetadataProvider;

pub(crate) struct MetadataLoader {
    provider: Arc<dyn MetadataProvider>,
    cache: ParameterCache,
    timeout: Duration,
    /// Held for the whole of a load; true once a catalog is installed
    loaded: Mutex<bool>,
}

impl MetadataLoader {
    pub(crate) fn new(
        provider: Arc<dyn MetadataProvider>,
        cache: ParameterCache,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            cache,
            timeout,
            loaded: Mutex::new(false),
        }
    }

    /// Load and install the catalog unless that already happened
    ///
    /// Failures and timeouts are logged and retried on the next call.
    /// Returns whether a catalog is installed.
    pub(crate) async fn ensure(&self) -> bool {
        let mut loaded = self.loaded.lock().await;
        if *loaded {
            return true;
        }

        match tokio::time::timeout(self.timeout, self.provider.load()).await {
            Ok(Ok(catalog)) => {
                info!("Loaded metadata for {} parameters", catalog.len());
                self.cache.install_metadata(Arc::new(catalog));
                *loaded = true;
            }
            Ok(Err(e)) => warn!("Parameter metadata unavailable, continuing without it: {}", e),
            Err(_) => warn!(
                "Parameter metadata load timed out after {:?}, continuing without it",
                self.timeout
            ),
        }

        *loaded
    }

    /// Start a load on its own task
    ///
    /// Does nothing when a catalog is installed or a load is already
    /// running. The task stops early on `shutdown`.
    pub(crate) fn spawn(self: &Arc<Self>, shutdown: &CancellationToken) {
        let idle = matches!(self.loaded.try_lock(), Ok(loaded) if !*loaded);
        if !idle {
            return;
        }

        let loader = Arc::clone(self);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => debug!("Metadata load abandoned on shutdown"),
                _ = loader.ensure() => {}
            }
        });
    }
}

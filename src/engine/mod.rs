//! # Parameter Synchronization Engine
//!
//! Keeps the local [`ParameterCache`] eventually consistent with the
//! parameter table of one flight controller.
//!
//! This module handles:
//! - Bulk fetch with index-set completion tracking and recovery passes
//! - Single writes confirmed by echo, with retry and read-back fallback
//! - Cache-first reads and prefix lookups
//! - At most one bulk fetch in flight, writes serialized per name
//! - Cooperative cancellation through [`CancellationToken`]s
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use param_sync::config::Config;
//! use param_sync::engine::ParamEngine;
//! use param_sync::metadata::NoMetadata;
//! use param_sync::protocol::ParamType;
//! use param_sync::transport::memory_link;
//!
//! # async fn run() -> param_sync::error::Result<()> {
//! let config = Config::default();
//! let (transport, inbound, _device) = memory_link(256);
//! let engine = ParamEngine::new(&config, Arc::new(transport), inbound, Arc::new(NoMetadata));
//!
//! let report = engine.fetch_all(false).await?;
//! println!("{} parameters, complete: {}", report.parameters.len(), report.outcome.is_complete());
//!
//! engine.set("ANGLE_MAX", 4500.0, ParamType::Int16, false).await?;
//! # Ok(())
//! # }
//! ```

pub mod fetch;
mod listener;
mod loader;
mod waiter;
pub mod write;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{Parameter, ParameterCache, Snapshot};
use crate::config::{Config, FetchConfig, LinkConfig, WriteConfig};
use crate::error::{ParamSyncError, Result};
use crate::metadata::MetadataProvider;
use crate::protocol::{
    names_match, normalize_name, InboundFrame, Outbound, OutboundFrame, ParamType, ValueEcho,
};
use crate::transport::Transport;

pub use fetch::{FetchOutcome, FetchReport, FetchStatus};

use listener::Listener;
use loader::MetadataLoader;
use waiter::EchoWaiter;

type NameLock = Arc<tokio::sync::Mutex<()>>;

/// Holds one name's write lock; prunes the lock table on drop
pub(crate) struct NameGuard<'a> {
    table: &'a Mutex<HashMap<String, NameLock>>,
    name: String,
    lock: NameLock,
    held: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());

        // Clones are only taken under the table lock, so two references
        // (the table and this guard) means nobody else wants the name
        let mut table = self.table.lock();
        let ours = table
            .get(&self.name)
            .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock));
        if ours && Arc::strong_count(&self.lock) == 2 {
            table.remove(&self.name);
        }
    }
}

/// Handle to a running synchronization engine
///
/// Cheap to clone; every clone drives the same connection and cache.
/// The engine stops when the last clone is dropped or on [`shutdown`].
///
/// [`shutdown`]: ParamEngine::shutdown
#[derive(Clone)]
pub struct ParamEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) link: LinkConfig,
    pub(crate) fetch: FetchConfig,
    pub(crate) write: WriteConfig,
    transport: Arc<dyn Transport>,
    pub(crate) cache: ParameterCache,
    echoes: broadcast::Sender<ValueEcho>,
    pub(crate) fetch_status: watch::Sender<FetchStatus>,
    pub(crate) refresh: watch::Sender<u64>,
    write_locks: Mutex<HashMap<String, NameLock>>,
    pub(crate) metadata: Arc<MetadataLoader>,
    link_down: CancellationToken,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ParamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamEngine")
            .field("target", &self.inner.link.target())
            .field("cached", &self.inner.cache.len())
            .finish_non_exhaustive()
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl ParamEngine {
    /// Start an engine on an established, addressed connection
    ///
    /// Spawns the listener task, so it must be called inside a tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `config` - Link addressing and timing configuration
    /// * `transport` - Send side of the link
    /// * `inbound` - Decoded frames received from the link
    /// * `metadata` - Catalog source used to decorate cache entries
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundFrame>,
        metadata: Arc<dyn MetadataProvider>,
    ) -> Self {
        let cache = ParameterCache::new();
        let (echoes, _) = broadcast::channel(config.link.echo_buffer);
        let (fetch_status, _) = watch::channel(FetchStatus::Idle);
        let (refresh, _) = watch::channel(0);
        let link_down = CancellationToken::new();
        let shutdown = CancellationToken::new();

        let listener = Listener {
            inbound,
            target: config.link.target(),
            cache: cache.clone(),
            echoes: echoes.clone(),
            link_down: link_down.clone(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(listener.run());

        info!(
            "Parameter engine started for system {} component {}",
            config.link.target_system, config.link.target_component
        );

        Self {
            inner: Arc::new(EngineInner {
                link: config.link.clone(),
                fetch: config.fetch.clone(),
                write: config.write.clone(),
                transport,
                cache: cache.clone(),
                echoes,
                fetch_status,
                refresh,
                write_locks: Mutex::new(HashMap::new()),
                metadata: Arc::new(MetadataLoader::new(
                    metadata,
                    cache.clone(),
                    config.metadata.load_timeout(),
                )),
                link_down,
                shutdown,
            }),
        }
    }

    /// Read every parameter from the device
    ///
    /// Joins a fetch already in flight instead of starting another one.
    /// With `force_refresh` an in-flight fetch restarts its bookkeeping and
    /// re-requests the list. A fetch that gives up with indices missing is
    /// not an error: the report carries what was collected.
    ///
    /// # Errors
    ///
    /// Returns [`ParamSyncError::NoConnection`] if the link is unusable
    pub async fn fetch_all(&self, force_refresh: bool) -> Result<FetchReport> {
        let cancel = self.inner.shutdown.child_token();
        self.fetch_all_with_cancel(force_refresh, &cancel).await
    }

    /// [`fetch_all`](Self::fetch_all) with caller-controlled cancellation
    pub async fn fetch_all_with_cancel(
        &self,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<FetchReport> {
        fetch::fetch_all(&self.inner, force_refresh, cancel).await
    }

    /// Cache-first read of one parameter
    ///
    /// Returns the cached entry when present; otherwise asks the device and
    /// waits up to the read timeout. `Ok(None)` means the device did not
    /// answer.
    pub async fn get(&self, name: &str) -> Result<Option<Parameter>> {
        if let Some(param) = self.inner.cache.get(name) {
            return Ok(Some(param));
        }

        let cancel = self.inner.shutdown.child_token();
        let echo = self
            .inner
            .read_remote(name, self.inner.write.read_timeout(), &cancel)
            .await?;
        Ok(echo.map(|echo| self.inner.confirmed(&echo)))
    }

    /// Write one parameter and wait for the device to confirm it
    ///
    /// Unless `force` is set, a value the device already holds is confirmed
    /// without sending anything.
    ///
    /// # Errors
    ///
    /// - [`ParamSyncError::Timeout`] when no confirmation arrived after every retry
    /// - [`ParamSyncError::VerificationMismatch`] when the read-back disagrees
    /// - [`ParamSyncError::NoConnection`] when the link is unusable
    pub async fn set(
        &self,
        name: &str,
        value: f32,
        param_type: ParamType,
        force: bool,
    ) -> Result<Parameter> {
        let cancel = self.inner.shutdown.child_token();
        self.set_with_cancel(name, value, param_type, force, &cancel)
            .await
    }

    /// [`set`](Self::set) with caller-controlled cancellation
    pub async fn set_with_cancel(
        &self,
        name: &str,
        value: f32,
        param_type: ParamType,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Parameter> {
        write::set(&self.inner, name, value, param_type, force, cancel).await
    }

    /// Parameters whose name starts with `prefix`
    ///
    /// Served from the cache when it has matches. Otherwise listens to the
    /// list stream for the prefix listen window, requesting the list unless
    /// a fetch is already running, and returns whatever matched.
    pub async fn find_by_prefix(&self, prefix: &str) -> Result<HashMap<String, Parameter>> {
        let cached = self.inner.cache.find_by_prefix(prefix);
        if !cached.is_empty() {
            return Ok(cached);
        }

        let prefix = normalize_name(prefix);
        let cancel = self.inner.shutdown.child_token();
        let mut waiter = self.inner.waiter(&cancel);

        if *self.inner.fetch_status.borrow() != FetchStatus::InProgress {
            self.inner.send(Outbound::ListRequest).await?;
        }

        let deadline = Instant::now() + self.inner.fetch.prefix_listen();
        let mut found = HashMap::new();
        while let Some(echo) = waiter.next(deadline).await? {
            if normalize_name(&echo.name).starts_with(&prefix) {
                let param = self.inner.confirmed(&echo);
                found.insert(param.name.clone(), param);
            }
        }
        debug!("Prefix {} matched {} parameters", prefix, found.len());

        found.extend(self.inner.cache.find_by_prefix(&prefix));
        Ok(found)
    }

    /// Current cache contents; no protocol activity
    pub fn snapshot(&self) -> Snapshot {
        self.inner.cache.snapshot()
    }

    /// Receive a new snapshot after every cache change
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.inner.cache.subscribe()
    }

    /// The shared cache, for staging local edits
    pub fn cache(&self) -> &ParameterCache {
        &self.inner.cache
    }

    /// State of the bulk fetch
    pub fn fetch_status(&self) -> FetchStatus {
        self.inner.fetch_status.borrow().clone()
    }

    /// Write every staged local edit
    ///
    /// Each entry is written independently; one failure does not stop the
    /// rest. Returns one result per dirty parameter, in table order.
    pub async fn save_dirty(&self) -> Vec<(String, Result<Parameter>)> {
        let dirty = self.inner.cache.dirty();
        let mut results = Vec::with_capacity(dirty.len());

        for param in dirty {
            let result = self
                .set(&param.name, param.value, param.param_type, false)
                .await;
            if let Err(e) = &result {
                warn!("Failed to save {}: {}", param.name, e);
            }
            results.push((param.name, result));
        }

        results
    }

    /// Load the metadata catalog if it has not been loaded yet
    ///
    /// Waits at most the configured load timeout. Failures are logged and
    /// retried on the next call. Returns whether a catalog is installed.
    pub async fn load_metadata(&self) -> bool {
        self.inner.metadata.ensure().await
    }

    /// Stop the listener and cancel every pending operation
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl EngineInner {
    /// Send one message to the target
    pub(crate) async fn send(&self, message: Outbound) -> Result<()> {
        if self.link_down.is_cancelled() {
            return Err(ParamSyncError::NoConnection("link closed".to_string()));
        }

        let frame = OutboundFrame {
            source: self.link.source(),
            target: self.link.target(),
            message,
        };
        self.transport.send(frame).await.map_err(|e| match e {
            ParamSyncError::NoConnection(_) => e,
            other => ParamSyncError::NoConnection(other.to_string()),
        })
    }

    /// Subscribe to echoes; do this before sending the request
    pub(crate) fn waiter<'a>(&'a self, cancel: &'a CancellationToken) -> EchoWaiter<'a> {
        EchoWaiter::new(self.echoes.subscribe(), &self.link_down, cancel)
    }

    /// Read one parameter by name from the device
    pub(crate) async fn read_remote(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<ValueEcho>> {
        let mut waiter = self.waiter(cancel);
        self.send(Outbound::read_name(name)).await?;
        waiter
            .wait_for(timeout, |echo| names_match(name, &echo.name))
            .await
    }

    /// Cache entry for an echo the listener has already applied
    pub(crate) fn confirmed(&self, echo: &ValueEcho) -> Parameter {
        self.cache
            .get(&echo.name)
            .unwrap_or_else(|| Parameter::from_echo(echo))
    }

    /// Cache entry for an echo confirming a write
    ///
    /// The device now holds the written value, so a staged edit of the
    /// same parameter is dropped.
    pub(crate) fn written(&self, echo: &ValueEcho) -> Parameter {
        self.cache
            .revert(&echo.name)
            .unwrap_or_else(|| self.confirmed(echo))
    }

    /// Take the per-name write lock, waiting in FIFO order
    ///
    /// The entry is removed from the lock table once the last holder or
    /// waiter for that name is gone.
    pub(crate) async fn lock_name(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<NameGuard<'_>> {
        let name = normalize_name(name);
        let lock = Arc::clone(
            self.write_locks
                .lock()
                .entry(name.clone())
                .or_default(),
        );
        let mut guard = NameGuard {
            table: &self.write_locks,
            name,
            lock,
            held: None,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ParamSyncError::Cancelled),
            held = Arc::clone(&guard.lock).lock_owned() => {
                guard.held = Some(held);
                Ok(guard)
            }
        }
    }
}

//! Bulk fetch with index-set completion
//!
//! A fetch sends one list request and consumes the resulting stream of
//! value echoes in any order, with duplicates. Completion is decided by the
//! set of distinct indices seen, never by counting messages. When the
//! stream stalls, missing indices are re-requested one by one for a
//! bounded number of passes; after that the fetch ends with a partial
//! result rather than an error.

use serde::Serialize;
use std::collections::BTreeSet;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::EngineInner;
use crate::cache::Snapshot;
use crate::error::{ParamSyncError, Result};
use crate::protocol::{Outbound, ValueEcho, INVALID_INDEX};

/// How a bulk fetch ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FetchOutcome {
    /// Every index of the table arrived
    Complete { count: usize },

    /// Gave up with indices missing; what arrived is still cached
    Partial {
        expected: u16,
        received: usize,
        missing: Vec<u16>,
    },

    /// Stopped by the caller
    Cancelled { received: usize },
}

impl FetchOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    /// Number of parameters known to be missing
    pub fn missing_count(&self) -> usize {
        match self {
            Self::Partial { missing, .. } => missing.len(),
            _ => 0,
        }
    }
}

/// Result of [`ParamEngine::fetch_all`](super::ParamEngine::fetch_all)
#[derive(Debug, Clone)]
pub struct FetchReport {
    /// Cache contents when the fetch ended
    pub parameters: Snapshot,
    pub outcome: FetchOutcome,
}

/// Bulk fetch state shared with joining callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Idle,
    InProgress,
    Finished(FetchOutcome),
    Failed(String),
}

/// Index bookkeeping for one fetch
#[derive(Debug, Default)]
pub(crate) struct FetchSession {
    expected: u16,
    received: BTreeSet<u16>,
    recovery_attempts: u32,
}

impl FetchSession {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record an echo; true when it carried an index not seen before
    pub(crate) fn record(&mut self, echo: &ValueEcho) -> bool {
        if self.expected == 0 && echo.total_count > 0 {
            self.expected = echo.total_count;
        }

        if echo.index == INVALID_INDEX {
            return false;
        }
        if self.expected > 0 && echo.index >= self.expected {
            return false;
        }
        self.received.insert(echo.index)
    }

    pub(crate) fn received_count(&self) -> usize {
        if self.expected == 0 {
            return self.received.len();
        }
        self.received.range(..self.expected).count()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.expected > 0 && self.received_count() >= self.expected as usize
    }

    /// Indices not yet received; empty while the table size is unknown
    pub(crate) fn missing(&self) -> Vec<u16> {
        (0..self.expected)
            .filter(|index| !self.received.contains(index))
            .collect()
    }

    /// Forget everything and start over
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn outcome(&self) -> FetchOutcome {
        if self.is_complete() {
            return FetchOutcome::Complete {
                count: self.expected as usize,
            };
        }
        FetchOutcome::Partial {
            expected: self.expected,
            received: self.received_count(),
            missing: self.missing(),
        }
    }
}

/// Marks the fetch idle again if the driving future is dropped
struct InFlight<'a> {
    status: &'a watch::Sender<FetchStatus>,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(mut self, status: FetchStatus) {
        self.status.send_replace(status);
        self.settled = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.status.send_replace(FetchStatus::Idle);
        }
    }
}

pub(crate) async fn fetch_all(
    inner: &EngineInner,
    force_refresh: bool,
    cancel: &CancellationToken,
) -> Result<FetchReport> {
    let started = inner.fetch_status.send_if_modified(|status| {
        if *status == FetchStatus::InProgress {
            return false;
        }
        *status = FetchStatus::InProgress;
        true
    });

    if !started {
        if force_refresh {
            info!("Forced refresh, restarting the fetch in progress");
            inner.refresh.send_modify(|generation| *generation += 1);
        } else {
            debug!("Joining the fetch in progress");
        }
        return join(inner, cancel).await;
    }

    let guard = InFlight {
        status: &inner.fetch_status,
        settled: false,
    };
    let mut refresh = inner.refresh.subscribe();

    match drive(inner, &mut refresh, cancel).await {
        Ok(outcome) => {
            guard.settle(FetchStatus::Finished(outcome.clone()));
            Ok(FetchReport {
                parameters: inner.cache.snapshot(),
                outcome,
            })
        }
        Err(e) => {
            warn!("Parameter fetch failed: {}", e);
            guard.settle(FetchStatus::Failed(e.to_string()));
            Err(e)
        }
    }
}

/// Wait for the fetch someone else is driving and share its outcome
async fn join(inner: &EngineInner, cancel: &CancellationToken) -> Result<FetchReport> {
    let mut status = inner.fetch_status.subscribe();

    let settled = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ParamSyncError::Cancelled),
        settled = status.wait_for(|s| *s != FetchStatus::InProgress) => {
            settled.map(|s| s.clone())
        }
    };

    let outcome = match settled {
        Ok(FetchStatus::Finished(outcome)) => outcome,
        Ok(FetchStatus::Failed(reason)) => return Err(ParamSyncError::NoConnection(reason)),
        Ok(_) => FetchOutcome::Cancelled {
            received: inner.cache.len(),
        },
        Err(_) => return Err(ParamSyncError::NoConnection("engine stopped".to_string())),
    };

    Ok(FetchReport {
        parameters: inner.cache.snapshot(),
        outcome,
    })
}

async fn drive(
    inner: &EngineInner,
    refresh: &mut watch::Receiver<u64>,
    cancel: &CancellationToken,
) -> Result<FetchOutcome> {
    inner.metadata.spawn(&inner.shutdown);

    let config = &inner.fetch;
    let mut session = FetchSession::new();
    let mut waiter = inner.waiter(cancel);
    inner.send(Outbound::ListRequest).await?;
    info!("Requested parameter list");

    let mut overall = Instant::now() + config.overall_timeout();
    let mut stall = Instant::now() + config.stall_timeout();

    loop {
        let next = tokio::select! {
            changed = refresh.changed() => {
                if changed.is_err() {
                    return Err(ParamSyncError::NoConnection("engine stopped".to_string()));
                }
                session.reset();
                inner.send(Outbound::ListRequest).await?;
                overall = Instant::now() + config.overall_timeout();
                stall = Instant::now() + config.stall_timeout();
                continue;
            }
            next = waiter.next(stall.min(overall)) => next,
        };

        let echo = match next {
            Ok(echo) => echo,
            Err(ParamSyncError::Cancelled) => {
                info!("Parameter fetch cancelled after {} entries", session.received_count());
                return Ok(FetchOutcome::Cancelled {
                    received: session.received_count(),
                });
            }
            Err(e) => return Err(e),
        };

        match echo {
            Some(echo) => {
                if !session.record(&echo) {
                    continue;
                }
                stall = Instant::now() + config.stall_timeout();
                if session.is_complete() {
                    info!("Received all {} parameters", session.expected);
                    return Ok(session.outcome());
                }
            }
            None if Instant::now() >= overall => {
                let outcome = session.outcome();
                warn!(
                    "Parameter fetch timed out, {} parameters missing",
                    outcome.missing_count()
                );
                return Ok(outcome);
            }
            None => {
                if session.recovery_attempts >= config.max_recovery_attempts {
                    let outcome = session.outcome();
                    warn!(
                        "Recovery exhausted, {} parameters missing",
                        outcome.missing_count()
                    );
                    return Ok(outcome);
                }
                session.recovery_attempts += 1;

                if session.expected == 0 {
                    debug!("No table size yet, re-requesting the list");
                    inner.send(Outbound::ListRequest).await?;
                } else {
                    let missing = session.missing();
                    info!(
                        "Recovery pass {}: re-requesting {} missing indices",
                        session.recovery_attempts,
                        missing.len()
                    );
                    for index in missing {
                        inner.send(Outbound::read_index(index)).await?;
                    }
                }
                stall = Instant::now() + config.stall_timeout();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::config::Config;
    use crate::metadata::NoMetadata;
    use crate::protocol::ParamType;
    use crate::transport::SimFaults;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_ok, assert_pending};

    fn echo(index: u16, total: u16) -> ValueEcho {
        ValueEcho::new(&format!("P{}", index), 1.0, ParamType::Real32, index, total)
    }

    fn faults(f: impl FnOnce(&mut SimFaults)) -> SimFaults {
        let mut faults = SimFaults::default();
        f(&mut faults);
        faults
    }

    #[test]
    fn test_session_tracks_distinct_indices() {
        let mut session = FetchSession::new();

        assert!(session.record(&echo(2, 3)));
        assert!(session.record(&echo(0, 3)));
        assert!(!session.record(&echo(0, 3)));
        assert!(!session.is_complete());
        assert_eq!(session.missing(), vec![1]);

        assert!(session.record(&echo(1, 3)));
        assert!(session.is_complete());
        assert_eq!(session.outcome(), FetchOutcome::Complete { count: 3 });
    }

    #[test]
    fn test_session_ignores_invalid_and_out_of_range() {
        let mut session = FetchSession::new();

        assert!(!session.record(&echo(INVALID_INDEX, 2)));
        assert_eq!(session.expected, 2);
        assert!(!session.record(&echo(5, 2)));
        assert_eq!(session.received_count(), 0);
    }

    #[test]
    fn test_session_learns_size_late() {
        let mut session = FetchSession::new();

        // Unsolicited echo without a table size
        assert!(session.record(&echo(4, 0)));
        assert!(!session.is_complete());
        assert!(session.missing().is_empty());

        assert!(session.record(&echo(0, 2)));
        assert!(session.record(&echo(1, 2)));
        assert!(session.is_complete());
    }

    #[test]
    fn test_session_reset() {
        let mut session = FetchSession::new();
        session.record(&echo(0, 2));
        session.recovery_attempts = 2;

        session.reset();
        assert_eq!(session.expected, 0);
        assert_eq!(session.received_count(), 0);
        assert_eq!(session.recovery_attempts, 0);
    }

    #[test]
    fn test_partial_outcome_lists_missing() {
        let mut session = FetchSession::new();
        for index in 0..3 {
            session.record(&echo(index, 5));
        }

        let outcome = session.outcome();
        assert_eq!(
            outcome,
            FetchOutcome::Partial {
                expected: 5,
                received: 3,
                missing: vec![3, 4],
            }
        );
        assert_eq!(outcome.missing_count(), 2);
        assert!(!outcome.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_tolerates_order_and_duplicates() {
        let (engine, sim) = start(copter().with_faults(faults(|f| {
            f.list_order = Some(vec![2, 0, 1, 0, 4, 2, 3]);
        })));

        let report = engine.fetch_all(false).await.unwrap();
        assert_eq!(report.outcome, FetchOutcome::Complete { count: 5 });
        assert_eq!(report.parameters.len(), 5);
        assert_eq!(report.parameters["ANGLE_MAX"].index, 0);
        assert_eq!(sim.count_requests(is_list), 1);
        assert_eq!(sim.count_requests(is_read), 0);
        assert_eq!(engine.fetch_status(), FetchStatus::Finished(report.outcome));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_completes_on_third_distinct_index() {
        let (engine, _sim) = start(
            device()
                .with_param("FRAME_CLASS", 1.0, ParamType::Int8)
                .with_param("FRAME_TYPE", 1.0, ParamType::Int8)
                .with_param("ANGLE_MAX", 4500.0, ParamType::Int16)
                .with_faults(faults(|f| f.list_order = Some(vec![2, 0, 1, 0]))),
        );

        let report = engine.fetch_all(false).await.unwrap();
        assert_eq!(report.outcome, FetchOutcome::Complete { count: 3 });
        assert_eq!(report.parameters.len(), 3);
        assert_eq!(engine.snapshot().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_requests_missing_indices() {
        let (engine, sim) = start(copter().with_faults(faults(|f| {
            f.drop_from_list = [3, 4].into_iter().collect();
        })));

        let report = engine.fetch_all(false).await.unwrap();
        assert!(report.outcome.is_complete());
        assert_eq!(report.parameters.len(), 5);
        assert_eq!(sim.count_requests(is_read), 2);
        assert!(sim
            .requests()
            .contains(&Outbound::read_index(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_exhausted_keeps_partial_result() {
        let (engine, sim) = start(copter().with_faults(faults(|f| {
            f.unreachable = [3, 4].into_iter().collect();
        })));
        let started = Instant::now();

        let report = engine.fetch_all(false).await.unwrap();
        assert_eq!(
            report.outcome,
            FetchOutcome::Partial {
                expected: 5,
                received: 3,
                missing: vec![3, 4],
            }
        );
        assert_eq!(report.parameters.len(), 3);
        assert_eq!(sim.count_requests(is_read), 6);

        // Three recovery stalls plus the final one
        let stall = Config::default().fetch.stall_timeout();
        assert_eq!(started.elapsed(), stall * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_deadline_ends_fetch() {
        let mut config = Config::default();
        config.fetch.stall_timeout_ms = 1000;
        config.fetch.overall_timeout_ms = 2500;
        let (engine, sim) = start_with(
            copter().with_faults(faults(|f| f.silent = true)),
            config,
            Arc::new(NoMetadata),
        );
        let started = Instant::now();

        let report = engine.fetch_all(false).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(2500));
        assert!(report.parameters.is_empty());
        assert!(matches!(report.outcome, FetchOutcome::Partial { expected: 0, .. }));

        // Table size never learned, so the list itself was re-requested
        assert_eq!(sim.count_requests(is_list), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_share_one_session() {
        let (engine, sim) = start(copter());

        let (first, second) = tokio::join!(engine.fetch_all(false), engine.fetch_all(false));
        let first = assert_ok!(first);
        let second = assert_ok!(second);

        assert_eq!(sim.count_requests(is_list), 1);
        assert!(first.outcome.is_complete());
        assert_eq!(first.outcome, second.outcome);
        assert_eq!(first.parameters, second.parameters);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_refresh_restarts_session() {
        let (engine, sim) = start(copter().with_faults(faults(|f| {
            f.reply_delay = Some(Duration::from_secs(1));
        })));

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.fetch_all(false).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.fetch_status(), FetchStatus::InProgress);

        let forced = engine.fetch_all(true).await.unwrap();
        let first = first.await.unwrap().unwrap();
        assert!(forced.outcome.is_complete());
        assert_eq!(first.outcome, forced.outcome);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sim.count_requests(is_list), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_after_finish_starts_fresh() {
        let (engine, sim) = start(copter());

        engine.fetch_all(false).await.unwrap();
        engine.fetch_all(true).await.unwrap();
        assert_eq!(sim.count_requests(is_list), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_fetch_keeps_cache() {
        let (engine, sim) = start(copter().with_faults(faults(|f| {
            f.unreachable = [4].into_iter().collect();
        })));
        let cancel = CancellationToken::new();

        let pending = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.fetch_all_with_cancel(false, &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let report = pending.await.unwrap().unwrap();
        assert_eq!(report.outcome, FetchOutcome::Cancelled { received: 4 });
        assert_eq!(report.parameters.len(), 4);
        assert_eq!(engine.snapshot().len(), 4);

        // The next fetch is not blocked
        sim.update_faults(|f| f.unreachable.clear());
        let report = engine.fetch_all(false).await.unwrap();
        assert!(report.outcome.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_joiner_leaves_fetch_running() {
        let (engine, _sim) = start(copter().with_faults(faults(|f| {
            f.reply_delay = Some(Duration::from_secs(1));
        })));

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.fetch_all(false).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let joined = engine.fetch_all_with_cancel(false, &cancel).await;
        assert!(matches!(joined, Err(ParamSyncError::Cancelled)));

        let report = first.await.unwrap().unwrap();
        assert!(report.outcome.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_fetch_returns_to_idle() {
        let (engine, _sim) = start(copter().with_faults(faults(|f| f.silent = true)));

        let mut fetch = tokio_test::task::spawn(engine.fetch_all(false));
        assert_pending!(fetch.poll());
        assert_eq!(engine.fetch_status(), FetchStatus::InProgress);

        drop(fetch);
        assert_eq!(engine.fetch_status(), FetchStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_metadata_does_not_delay_list_request() {
        use crate::metadata::{MetadataCatalog, MetadataProvider};
        use async_trait::async_trait;

        struct StalledMetadata;

        #[async_trait]
        impl MetadataProvider for StalledMetadata {
            async fn load(&self) -> Result<MetadataCatalog> {
                std::future::pending().await
            }
        }

        let config = Config::default();
        let (engine, sim) = start_with(copter(), config.clone(), Arc::new(StalledMetadata));
        let start = Instant::now();

        let fetch = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.fetch_all(false).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sim.count_requests(is_list), 1);

        let report = fetch.await.unwrap().unwrap();
        assert!(report.outcome.is_complete());
        assert_eq!(report.parameters.len(), 5);
        assert!(start.elapsed() < config.metadata.load_timeout());
        assert_eq!(sim.count_requests(is_list), 1);
    }
}

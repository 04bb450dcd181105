//! Flushing unsynced samples to the remote endpoint
//!
//! A flush walks the unsynced records oldest first and pushes them one at a
//! time. A record is marked synced only after the endpoint answered
//! `accepted` or `duplicate`; every other outcome leaves it for the next
//! flush and the walk moves on.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SyncConfig;
use crate::db::LocalStore;
use crate::error::{Error, Result};

use super::record::{PushStatus, SyncRecord};
use super::RemoteEndpoint;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Outcome of one flush pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Records pushed (each counted once, however many retries)
    pub attempted: usize,
    pub accepted: usize,
    /// Already known to the service; marked synced like an accept
    pub duplicates: usize,
    pub rejected: usize,
    /// Gave up after retries; left unsynced
    pub transport_failures: usize,
    /// Rejected records that reached the abandon threshold in this pass
    pub abandoned: usize,
}

impl FlushReport {
    /// Records marked synced by this pass
    pub fn synced(&self) -> usize {
        self.accepted + self.duplicates
    }

    fn merge(&mut self, other: &FlushReport) {
        self.attempted += other.attempted;
        self.accepted += other.accepted;
        self.duplicates += other.duplicates;
        self.rejected += other.rejected;
        self.transport_failures += other.transport_failures;
        self.abandoned += other.abandoned;
    }
}

/// Cumulative sync statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    /// Completed flush passes
    pub flushes: usize,
    pub totals: FlushReport,
    pub last_flush_at: Option<DateTime<Utc>>,
    /// Most recent rejection or transport error message
    pub last_error: Option<String>,
}

/// Drains the local store to a [`RemoteEndpoint`].
///
/// Flushes are serialized: a flush requested while another is running waits
/// for it, then walks whatever is still unsynced.
pub struct SyncEngine<R> {
    store: Arc<LocalStore>,
    remote: R,
    config: SyncConfig,
    flush_lock: tokio::sync::Mutex<()>,
    stats: Mutex<SyncStats>,
}

impl<R: RemoteEndpoint> SyncEngine<R> {
    pub fn new(store: Arc<LocalStore>, remote: R, config: SyncConfig) -> Self {
        Self {
            store,
            remote,
            config,
            flush_lock: tokio::sync::Mutex::new(()),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    /// Push every unsynced record captured at or after `since`.
    ///
    /// Remote failures are absorbed into the report; only local store
    /// failures are returned as errors.
    pub async fn flush(&self, since: DateTime<Utc>) -> Result<FlushReport> {
        let _guard = self.flush_lock.lock().await;
        let mut report = FlushReport::default();
        let mut last_error = None;

        let cursor = self.store.unsynced_since(since, self.config.page_size);
        for record in cursor {
            let record = record?;
            let captured_at = record.sample.captured_at;
            let wire = SyncRecord::from_sample(&record.sample);
            report.attempted += 1;

            match self.push_with_retry(&wire).await {
                Ok(PushStatus::Accepted) => {
                    self.store.mark_synced(captured_at)?;
                    report.accepted += 1;
                }
                Ok(PushStatus::Duplicate) => {
                    self.store.mark_synced(captured_at)?;
                    report.duplicates += 1;
                    tracing::debug!(%captured_at, "Remote already had record");
                }
                Ok(PushStatus::Rejected(message)) => {
                    let outcome = self.store.record_rejection(
                        captured_at,
                        &message,
                        self.config.abandon_after_rejections,
                    )?;
                    let rejection = Error::SyncRejected(message);
                    report.rejected += 1;
                    if outcome.abandoned {
                        report.abandoned += 1;
                        tracing::warn!(
                            %captured_at,
                            rejections = outcome.rejections,
                            error = %rejection,
                            "Abandoning record after repeated rejections"
                        );
                    } else {
                        tracing::warn!(
                            %captured_at,
                            rejections = outcome.rejections,
                            error = %rejection,
                            "Remote rejected record"
                        );
                    }
                    last_error = Some(rejection.to_string());
                }
                Err(e) => {
                    report.transport_failures += 1;
                    tracing::warn!(%captured_at, error = %e, "Failed to push record, will retry next flush");
                    last_error = Some(e.to_string());
                }
            }
        }

        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                synced = report.synced(),
                rejected = report.rejected,
                transport_failures = report.transport_failures,
                "Flush complete"
            );
        }

        if let Ok(mut stats) = self.stats.lock() {
            stats.flushes += 1;
            stats.totals.merge(&report);
            stats.last_flush_at = Some(Utc::now());
            if last_error.is_some() {
                stats.last_error = last_error;
            }
        }

        Ok(report)
    }

    /// Push one record, retrying transient failures with exponential backoff.
    async fn push_with_retry(&self, record: &SyncRecord) -> Result<PushStatus> {
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 0;

        loop {
            match self.remote.push(record).await {
                Ok(status) => return Ok(status),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::debug!(
                        "Retrying push (attempt {}/{}), waiting {:?}: {}",
                        attempt + 1,
                        self.config.max_retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Get cumulative statistics
    pub fn stats(&self) -> SyncStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    /// Unsynced records still eligible for flushing
    pub fn pending_count(&self) -> Result<i64> {
        self.store.count_unsynced()
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::{LocationSample, SampleKind};
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + ChronoDuration::seconds(secs)
    }

    fn sample(at: DateTime<Utc>) -> LocationSample {
        LocationSample {
            captured_at: at,
            latitude: 1.0,
            longitude: 2.0,
            accuracy: 5.0,
            agent_id: "7".to_string(),
            attendance_id: "42".to_string(),
            session_id: "s".to_string(),
            task_id: None,
            kind: SampleKind::RoutePoint,
            comment: None,
            cluster_id: None,
            synced: false,
        }
    }

    /// Answers per key from a script; unscripted keys are accepted.
    #[derive(Default)]
    struct ScriptedRemote {
        script: Mutex<HashMap<DateTime<Utc>, Vec<Result<PushStatus>>>>,
        calls: Mutex<Vec<DateTime<Utc>>>,
    }

    impl ScriptedRemote {
        fn answer(self, at: DateTime<Utc>, answers: Vec<Result<PushStatus>>) -> Self {
            self.script.lock().unwrap().insert(at, answers);
            self
        }

        fn calls(&self) -> Vec<DateTime<Utc>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RemoteEndpoint for ScriptedRemote {
        async fn push(&self, record: &SyncRecord) -> Result<PushStatus> {
            self.calls.lock().unwrap().push(record.captured_at);
            let mut script = self.script.lock().unwrap();
            match script.get_mut(&record.captured_at) {
                Some(answers) if !answers.is_empty() => answers.remove(0),
                _ => Ok(PushStatus::Accepted),
            }
        }
    }

    fn transport() -> Result<PushStatus> {
        Err(Error::SyncTransport("connection reset".to_string()))
    }

    fn engine(remote: ScriptedRemote, config: SyncConfig) -> (Arc<LocalStore>, SyncEngine<ScriptedRemote>) {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let engine = SyncEngine::new(store.clone(), remote, config);
        (store, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_in_order_and_marks_synced() {
        let (store, engine) = engine(ScriptedRemote::default(), SyncConfig::default());
        for secs in [20, 0, 10] {
            store.append(&sample(t(secs))).unwrap();
        }

        let report = engine.flush(t(0)).await.unwrap();
        assert_eq!(report.accepted, 3);
        assert_eq!(engine.remote().calls(), vec![t(0), t(10), t(20)]);
        assert_eq!(store.count_unsynced().unwrap(), 0);

        // Nothing left to do
        let report = engine.flush(t(0)).await.unwrap();
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_counts_as_synced() {
        let remote = ScriptedRemote::default().answer(t(0), vec![Ok(PushStatus::Duplicate)]);
        let (store, engine) = engine(remote, SyncConfig::default());
        store.append(&sample(t(0))).unwrap();

        let report = engine.flush(t(0)).await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.synced(), 1);
        assert!(store.get_sample(t(0)).unwrap().unwrap().synced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_skips_record_and_continues() {
        let remote = ScriptedRemote::default().answer(t(10), vec![transport(), transport(), transport()]);
        let (store, engine) = engine(remote, SyncConfig::default());
        for secs in [0, 10, 20] {
            store.append(&sample(t(secs))).unwrap();
        }

        let report = engine.flush(t(0)).await.unwrap();
        assert_eq!(report.accepted, 2);
        assert_eq!(report.transport_failures, 1);
        assert!(!store.get_sample(t(10)).unwrap().unwrap().synced);
        assert!(store.get_sample(t(20)).unwrap().unwrap().synced);
        // One try plus two retries for the failing record
        assert_eq!(
            engine.remote().calls(),
            vec![t(0), t(10), t(10), t(10), t(20)]
        );

        // Next flush picks it up
        let report = engine.flush(t(0)).await.unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(store.count_unsynced().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_within_one_flush() {
        let remote = ScriptedRemote::default().answer(t(0), vec![transport()]);
        let (store, engine) = engine(remote, SyncConfig::default());
        store.append(&sample(t(0))).unwrap();

        let report = engine.flush(t(0)).await.unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.transport_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_retried_forever_by_default() {
        let remote = ScriptedRemote::default().answer(
            t(0),
            (0..5)
                .map(|_| Ok(PushStatus::Rejected("Invalid latitude".to_string())))
                .collect(),
        );
        let (store, engine) = engine(remote, SyncConfig::default());
        store.append(&sample(t(0))).unwrap();

        for _ in 0..5 {
            let report = engine.flush(t(0)).await.unwrap();
            assert_eq!(report.rejected, 1);
            assert_eq!(report.abandoned, 0);
        }
        assert_eq!(store.count_unsynced().unwrap(), 1);

        let stats = engine.stats();
        assert_eq!(stats.flushes, 5);
        assert_eq!(stats.totals.rejected, 5);
        assert_eq!(stats.last_error.as_deref(), Some("sync rejected: Invalid latitude"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_abandoned_after_threshold() {
        let remote = ScriptedRemote::default().answer(
            t(0),
            vec![
                Ok(PushStatus::Rejected("bad".to_string())),
                Ok(PushStatus::Rejected("bad".to_string())),
            ],
        );
        let config = SyncConfig {
            abandon_after_rejections: Some(2),
            ..Default::default()
        };
        let (store, engine) = engine(remote, config);
        store.append(&sample(t(0))).unwrap();

        assert_eq!(engine.flush(t(0)).await.unwrap().abandoned, 0);
        assert_eq!(engine.flush(t(0)).await.unwrap().abandoned, 1);

        let report = engine.flush(t(0)).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert!(!store.get_sample(t(0)).unwrap().unwrap().synced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_since_bounds_the_scan() {
        let (store, engine) = engine(ScriptedRemote::default(), SyncConfig::default());
        store.append(&sample(t(0))).unwrap();
        store.append(&sample(t(60))).unwrap();

        let report = engine.flush(t(30)).await.unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(engine.pending_count().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_pages_drain_everything() {
        let config = SyncConfig {
            page_size: 2,
            ..Default::default()
        };
        let (store, engine) = engine(ScriptedRemote::default(), config);
        for secs in 0..7 {
            store.append(&sample(t(secs))).unwrap();
        }

        let report = engine.flush(t(0)).await.unwrap();
        assert_eq!(report.accepted, 7);
    }
}

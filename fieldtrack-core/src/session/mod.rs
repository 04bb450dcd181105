//! Tracking session lifecycle
//!
//! [`TrackingService`] owns at most one active session. While a session is
//! active two [`PeriodicTask`]s run: the sampler, which requests a fix and
//! pushes it through the filter into the store, and the syncer, which
//! flushes unsynced samples to the remote endpoint.
//!
//! ```text
//!            start()                 stop()
//!   Idle ─────────────▶ Active ─────────────▶ Idle
//!                       │    ▲
//!                       └────┘ sampling tick / manual point
//! ```
//!
//! All session state sits behind one async mutex. The mutex is never held
//! while waiting on the provider or the network; handlers re-check the
//! session id after every such wait and drop their result if the session
//! they started under has ended.

pub mod clock;
pub mod identity;
pub mod provider;
pub mod scheduler;

use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::Instrument;

use crate::config::{SyncConfig, TrackingConfig};
use crate::db::LocalStore;
use crate::error::{Error, ProviderError, Result};
use crate::logging::session_span;
use crate::sync::{FlushReport, RemoteEndpoint, SyncEngine};
use crate::tracking::{AcceptedPoint, Candidate, ClusterIndex, DecisionReason, LocationFilter};
use crate::types::{LocationSample, SampleKind, StartRequest, TrackingSession};

pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{FixedIdentity, IdentityResolver, IdentityStatus};
pub use provider::{Fix, FixOptions, PositionProvider};
pub use scheduler::PeriodicTask;

/// Upper bound on the flush attempted from [`TrackingService::on_terminate`].
const TERMINATE_FLUSH_BUDGET: Duration = Duration::from_secs(5);

const EVENT_CAPACITY: usize = 64;

/// Notifications for the host UI.
#[derive(Debug, Clone)]
pub enum TrackingEvent {
    SessionStarted(TrackingSession),
    SessionStopped {
        session_id: String,
        final_flush: Option<FlushReport>,
    },
    SampleAccepted(LocationSample),
    /// Provider failures reached the configured threshold in a row
    DegradedTracking {
        consecutive_failures: u32,
        last_error: ProviderError,
    },
    /// Store writes failed the configured number of times in a row
    StorageUnhealthy { consecutive_failures: u32 },
}

/// Result of one capture attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Accepted(LocationSample),
    Rejected(DecisionReason),
    /// The session the capture started under is gone
    Stale,
}

impl CaptureOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CaptureOutcome::Accepted(_))
    }
}

/// Kind and comment forced onto a captured sample.
#[derive(Debug, Clone)]
struct Stamp {
    kind: SampleKind,
    comment: Option<String>,
}

struct ActiveSession {
    session: TrackingSession,
    filter: LocationFilter,
    clusters: ClusterIndex,
    last_accepted: Option<AcceptedPoint>,
    /// The session's own kind/comment still wait for their first sample
    opening_pending: bool,
    provider_failures: u32,
    write_failures: u32,
    // Dropping these aborts the timers
    _sampler: PeriodicTask,
    _syncer: PeriodicTask,
}

struct ServiceState {
    config: TrackingConfig,
    active: Option<ActiveSession>,
    /// Last key written by this service; keeps capture times strictly increasing
    last_captured_at: Option<DateTime<Utc>>,
}

struct Shared<P, R, I> {
    provider: P,
    identity: I,
    store: Arc<LocalStore>,
    sync: SyncEngine<R>,
    sync_interval: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<ServiceState>,
    events: broadcast::Sender<TrackingEvent>,
}

/// The tracking state machine.
///
/// Cheap to clone; clones drive the same session.
pub struct TrackingService<P, R, I> {
    shared: Arc<Shared<P, R, I>>,
}

impl<P, R, I> Clone for TrackingService<P, R, I> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<P, R, I> TrackingService<P, R, I>
where
    P: PositionProvider,
    R: RemoteEndpoint,
    I: IdentityResolver,
{
    pub fn new(
        tracking: TrackingConfig,
        sync: SyncConfig,
        store: Arc<LocalStore>,
        provider: P,
        remote: R,
        identity: I,
    ) -> Result<Self> {
        Self::with_clock(tracking, sync, store, provider, remote, identity, Arc::new(SystemClock))
    }

    /// Like [`TrackingService::new`] with an explicit time source for capture timestamps.
    pub fn with_clock(
        tracking: TrackingConfig,
        sync: SyncConfig,
        store: Arc<LocalStore>,
        provider: P,
        remote: R,
        identity: I,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        tracking.validate()?;
        sync.validate()?;

        // Never reuse a key already in the store, even across restarts
        let last_captured_at = store.latest_captured_at()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                provider,
                identity,
                sync_interval: sync.interval(),
                sync: SyncEngine::new(store.clone(), remote, sync),
                store,
                clock,
                state: Mutex::new(ServiceState {
                    config: tracking,
                    active: None,
                    last_captured_at,
                }),
                events,
            }),
        })
    }

    // ============================================
    // Lifecycle
    // ============================================

    /// Start a session and arm the sampling and sync timers.
    ///
    /// Identifiers missing from `request` are filled in from the identity
    /// resolver. Fails with [`Error::AlreadyActive`] if a session is running.
    pub async fn start(&self, request: StartRequest) -> Result<TrackingSession> {
        if self.shared.state.lock().await.active.is_some() {
            return Err(Error::AlreadyActive);
        }

        let (agent_id, attendance_id) = self.resolve_ids(&request).await?;

        let mut state = self.shared.state.lock().await;
        // Someone else may have started while we waited on the resolver
        if state.active.is_some() {
            return Err(Error::AlreadyActive);
        }

        let session = TrackingSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            agent_id,
            attendance_id,
            task_id: request.task_id.filter(|t| !t.trim().is_empty()),
            kind: request.kind.unwrap_or_default(),
            comment: request.comment,
            started_at: self.shared.clock.now(),
        };
        self.shared.store.record_session_start(&session)?;

        let filter = LocationFilter::new(&state.config);
        let clusters = ClusterIndex::new(state.config.cluster_radius_m, state.config.cluster_window());
        let sampler = self.spawn_sampler(&session, state.config.sample_interval());
        let syncer = self.spawn_syncer(&session);

        state.active = Some(ActiveSession {
            filter,
            clusters,
            session: session.clone(),
            last_accepted: None,
            opening_pending: true,
            provider_failures: 0,
            write_failures: 0,
            _sampler: sampler,
            _syncer: syncer,
        });
        drop(state);

        tracing::info!(
            session_id = %session.session_id,
            agent_id = %session.agent_id,
            attendance_id = %session.attendance_id,
            kind = %session.kind,
            "Tracking session started"
        );
        self.shared.emit(TrackingEvent::SessionStarted(session.clone()));

        Ok(session)
    }

    /// Stop the active session, if any.
    ///
    /// Timers are disarmed first, then one best-effort flush runs. Calling
    /// this while idle is a no-op returning `None`.
    pub async fn stop(&self) -> Result<Option<FlushReport>> {
        let Some(active) = self.shared.state.lock().await.active.take() else {
            return Ok(None);
        };
        let session = active.session.clone();
        drop(active);

        if let Err(e) = self
            .shared
            .store
            .record_session_stop(&session.session_id, self.shared.clock.now())
        {
            tracing::warn!(session_id = %session.session_id, error = %e, "Failed to record session stop");
        }

        let final_flush = match self.shared.sync.flush(session.started_at).await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(session_id = %session.session_id, error = %e, "Final flush failed");
                None
            }
        };

        tracing::info!(session_id = %session.session_id, "Tracking session stopped");
        self.shared.emit(TrackingEvent::SessionStopped {
            session_id: session.session_id,
            final_flush: final_flush.clone(),
        });

        Ok(final_flush)
    }

    /// Resume tracking after a restart if the resolver reports an open
    /// attendance period and nothing is running.
    ///
    /// Returns the started session, or `None` when there was nothing to do.
    /// Resolver failures are logged, not returned.
    pub async fn restore(&self) -> Result<Option<TrackingSession>> {
        if self.is_active().await {
            return Ok(None);
        }

        match self.shared.identity.resolve().await {
            IdentityStatus::Ok {
                agent_id,
                attendance_id: Some(attendance_id),
            } => match self.start(StartRequest::new(agent_id, attendance_id)).await {
                Ok(session) => {
                    tracing::info!(session_id = %session.session_id, "Restored tracking session");
                    Ok(Some(session))
                }
                Err(Error::AlreadyActive) => Ok(None),
                Err(e) => Err(e),
            },
            IdentityStatus::Ok {
                attendance_id: None,
                ..
            } => {
                tracing::debug!("No open attendance, nothing to restore");
                Ok(None)
            }
            IdentityStatus::Disabled => {
                tracing::info!("Tracking disabled for this agent, not restoring");
                Ok(None)
            }
            IdentityStatus::Error(detail) => {
                tracing::warn!(error = %detail, "Identity lookup failed, not restoring");
                Ok(None)
            }
        }
    }

    async fn resolve_ids(&self, request: &StartRequest) -> Result<(String, String)> {
        let given = |id: &Option<String>| id.clone().filter(|s| !s.trim().is_empty());
        let agent_id = given(&request.agent_id);
        let attendance_id = given(&request.attendance_id);

        if let (Some(agent_id), Some(attendance_id)) = (&agent_id, &attendance_id) {
            return Ok((agent_id.clone(), attendance_id.clone()));
        }

        match self.shared.identity.resolve().await {
            IdentityStatus::Ok {
                agent_id: resolved_agent,
                attendance_id: resolved_attendance,
            } => {
                let attendance_id = attendance_id.or(resolved_attendance).ok_or_else(|| {
                    Error::MissingIdentity("no open attendance period".to_string())
                })?;
                Ok((agent_id.unwrap_or(resolved_agent), attendance_id))
            }
            IdentityStatus::Disabled => Err(Error::TrackingDisabled),
            IdentityStatus::Error(detail) => Err(Error::MissingIdentity(detail)),
        }
    }

    fn spawn_sampler(&self, session: &TrackingSession, period: Duration) -> PeriodicTask {
        let weak = Arc::downgrade(&self.shared);
        let session_id = session.session_id.clone();
        let span = session_span(session);

        PeriodicTask::spawn("sampler", Duration::ZERO, period, move || {
            let weak = weak.clone();
            let session_id = session_id.clone();
            async move {
                match weak.upgrade() {
                    Some(shared) => shared.sample_tick(&session_id).await,
                    None => ControlFlow::Break(()),
                }
            }
            .instrument(span.clone())
        })
    }

    /// Periodic flushes cover this session's samples only.
    fn spawn_syncer(&self, session: &TrackingSession) -> PeriodicTask {
        let weak: Weak<Shared<P, R, I>> = Arc::downgrade(&self.shared);
        let session_id = session.session_id.clone();
        let since = session.started_at;
        let period = self.shared.sync_interval;
        let span = session_span(session);

        PeriodicTask::spawn("syncer", period, period, move || {
            let weak = weak.clone();
            let session_id = session_id.clone();
            async move {
                match weak.upgrade() {
                    Some(shared) => shared.sync_tick(&session_id, since).await,
                    None => ControlFlow::Break(()),
                }
            }
            .instrument(span.clone())
        })
    }

    // ============================================
    // Sampling
    // ============================================

    /// Capture a fix now with the given kind and comment.
    ///
    /// The fix goes through the same filter as timer samples; important kinds
    /// are therefore always kept. Returns whether the sample was stored.
    pub async fn add_manual_point(&self, comment: Option<String>, kind: SampleKind) -> Result<bool> {
        let session_id = self.active_session_id().await?;
        let stamp = Stamp { kind, comment };
        let outcome = self.shared.capture(&session_id, Some(stamp)).await?;
        Ok(outcome.is_accepted())
    }

    /// Run one sampling step immediately, outside the timer.
    pub async fn sample_now(&self) -> Result<CaptureOutcome> {
        let session_id = self.active_session_id().await?;
        self.shared.capture(&session_id, None).await
    }

    async fn active_session_id(&self) -> Result<String> {
        self.shared
            .state
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| a.session.session_id.clone())
            .ok_or(Error::NotActive)
    }

    // ============================================
    // Sync hooks
    // ============================================

    /// Flush every unsynced record, whatever session produced it.
    pub async fn flush_now(&self) -> Result<FlushReport> {
        self.shared.sync.flush(DateTime::<Utc>::UNIX_EPOCH).await
    }

    /// The host became visible again: flush opportunistically.
    pub async fn on_foreground(&self) {
        if let Err(e) = self.flush_now().await {
            tracing::warn!(error = %e, "Foreground flush failed");
        }
    }

    /// The host is about to terminate: flush with a bounded budget.
    ///
    /// Not guaranteed to finish; whatever is left stays unsynced.
    pub async fn on_terminate(&self) {
        match tokio::time::timeout(TERMINATE_FLUSH_BUDGET, self.flush_now()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Terminate flush failed"),
            Err(_) => tracing::warn!("Terminate flush did not finish in time"),
        }
    }

    // ============================================
    // Configuration and inspection
    // ============================================

    /// Replace the tracking thresholds.
    ///
    /// Filter and cluster thresholds apply to the next sample; timer periods
    /// apply from the next session.
    pub async fn update_config(&self, config: TrackingConfig) -> Result<()> {
        config.validate()?;

        let mut state = self.shared.state.lock().await;
        if let Some(active) = state.active.as_mut() {
            active.filter = LocationFilter::new(&config);
            active
                .clusters
                .reconfigure(config.cluster_radius_m, config.cluster_window());
        }
        state.config = config;
        tracing::info!("Tracking configuration updated");
        Ok(())
    }

    pub async fn config(&self) -> TrackingConfig {
        self.shared.state.lock().await.config.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.shared.state.lock().await.active.is_some()
    }

    pub async fn current_session(&self) -> Option<TrackingSession> {
        self.shared
            .state
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| a.session.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackingEvent> {
        self.shared.events.subscribe()
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.shared.store
    }

    pub fn sync_engine(&self) -> &SyncEngine<R> {
        &self.shared.sync
    }
}

impl<P, R, I> Shared<P, R, I>
where
    P: PositionProvider,
    R: RemoteEndpoint,
    I: IdentityResolver,
{
    fn emit(&self, event: TrackingEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn sample_tick(&self, session_id: &str) -> ControlFlow<()> {
        match self.capture(session_id, None).await {
            Ok(CaptureOutcome::Stale) => ControlFlow::Break(()),
            // Failures were logged and counted by capture
            Ok(_) | Err(_) => ControlFlow::Continue(()),
        }
    }

    async fn sync_tick(&self, session_id: &str, since: DateTime<Utc>) -> ControlFlow<()> {
        if !self.is_current(session_id).await {
            return ControlFlow::Break(());
        }
        if let Err(e) = self.sync.flush(since).await {
            tracing::warn!(session_id, error = %e, "Periodic flush failed");
        }
        ControlFlow::Continue(())
    }

    async fn is_current(&self, session_id: &str) -> bool {
        self.state
            .lock()
            .await
            .active
            .as_ref()
            .is_some_and(|a| a.session.session_id == session_id)
    }

    /// Request a fix and run it through filter and store.
    ///
    /// Provider and write failures are counted toward the health warnings
    /// and returned as errors.
    async fn capture(&self, session_id: &str, stamp: Option<Stamp>) -> Result<CaptureOutcome> {
        let options = {
            let state = self.state.lock().await;
            match &state.active {
                Some(active) if active.session.session_id == session_id => FixOptions {
                    high_accuracy: state.config.high_accuracy,
                    timeout: state.config.fix_timeout(),
                    max_age: Duration::from_secs(state.config.fix_max_age_secs),
                },
                _ => return Ok(CaptureOutcome::Stale),
            }
        };

        let fix = provider::request_fix(&self.provider, options, self.clock.as_ref()).await;

        let mut state = self.state.lock().await;
        let ServiceState {
            config,
            active,
            last_captured_at,
        } = &mut *state;
        let active = match active {
            Some(active) if active.session.session_id == session_id => active,
            _ => {
                tracing::debug!(session_id, "Session ended during fix request, dropping result");
                return Ok(CaptureOutcome::Stale);
            }
        };

        let fix = match fix {
            Ok(fix) => {
                active.provider_failures = 0;
                fix
            }
            Err(e) => {
                active.provider_failures += 1;
                tracing::warn!(
                    session_id,
                    consecutive_failures = active.provider_failures,
                    error = %e,
                    "Position fix failed, skipping"
                );
                if active.provider_failures == config.degraded_after_failures {
                    self.emit(TrackingEvent::DegradedTracking {
                        consecutive_failures: active.provider_failures,
                        last_error: e.clone(),
                    });
                }
                return Err(e.into());
            }
        };

        let carries_opening = stamp.is_none() && active.opening_pending;
        let stamp = match stamp {
            Some(stamp) => stamp,
            None if carries_opening => Stamp {
                kind: active.session.kind,
                comment: active.session.comment.clone(),
            },
            None => Stamp {
                kind: SampleKind::RoutePoint,
                comment: None,
            },
        };

        // Current time at accept, nudged past the previous key
        let now = self.clock.now();
        let captured_at = match *last_captured_at {
            Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
            _ => now,
        };

        let candidate = Candidate {
            coordinate: fix.coordinate(),
            accuracy: fix.accuracy,
            kind: stamp.kind,
            captured_at,
        };
        let decision = active
            .filter
            .decide(&candidate, active.last_accepted.as_ref(), &mut active.clusters);

        if !decision.accept {
            tracing::debug!(session_id, reason = ?decision.reason, "Sample rejected");
            return Ok(CaptureOutcome::Rejected(decision.reason));
        }

        let sample = LocationSample {
            captured_at,
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy: fix.accuracy,
            agent_id: active.session.agent_id.clone(),
            attendance_id: active.session.attendance_id.clone(),
            session_id: active.session.session_id.clone(),
            task_id: active.session.task_id.clone(),
            kind: stamp.kind,
            comment: stamp.comment,
            cluster_id: decision.cluster_id.clone(),
            synced: false,
        };

        if let Err(e) = self.store.append(&sample) {
            active.write_failures += 1;
            tracing::warn!(
                session_id,
                consecutive_failures = active.write_failures,
                error = %e,
                "Failed to persist sample, it is lost"
            );
            if active.write_failures == config.storage_warning_after_failures {
                self.emit(TrackingEvent::StorageUnhealthy {
                    consecutive_failures: active.write_failures,
                });
            }
            return Err(e);
        }
        active.write_failures = 0;

        match decision.cluster_id {
            Some(cluster_id) => active
                .clusters
                .insert_ordinary(captured_at, candidate.coordinate, cluster_id),
            None => active
                .clusters
                .insert_important(captured_at, candidate.coordinate),
        }
        active.last_accepted = Some(AcceptedPoint {
            coordinate: candidate.coordinate,
            captured_at,
        });
        if carries_opening {
            active.opening_pending = false;
        }
        *last_captured_at = Some(captured_at);

        tracing::debug!(
            session_id,
            %captured_at,
            kind = %sample.kind,
            reason = ?decision.reason,
            "Sample accepted"
        );
        self.emit(TrackingEvent::SampleAccepted(sample.clone()));

        Ok(CaptureOutcome::Accepted(sample))
    }
}

//! Scan trigger running manual and background discovery passes per scope
//!
//! Every registered scope owns its own session slot and schedule handle.
//! Scopes never share a lock, so passes for different bridges run fully in
//! parallel while at most one pass per scope is in flight.

use chrono::Utc;
use homescan_core::{CandidateDevice, DiscoverySink, KnownDeviceIndex, ScopeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::DiscoveryEvent;
use crate::probe::{CandidateSender, Probe};
use crate::reconciler::{Reconciled, Reconciler};
use crate::scope::ScanScope;
use crate::session::{ScanOrigin, ScanOutcome, ScanReport, ScanSession, ScanState};

/// Candidates buffered between a probe and the reconciler
const CANDIDATE_BUFFER: usize = 64;

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 100;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unknown scope {0}")]
    UnknownScope(ScopeId),
    #[error("scope {0} is already registered")]
    DuplicateScope(ScopeId),
}

/// Handle to a started pass
#[derive(Debug)]
pub struct ScanHandle {
    scope: ScopeId,
    session: u64,
    report: oneshot::Receiver<ScanReport>,
}

impl ScanHandle {
    pub fn scope(&self) -> &ScopeId {
        &self.scope
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Wait for the pass to reach a terminal state
    pub async fn finished(self) -> Option<ScanReport> {
        self.report.await.ok()
    }
}

#[derive(Debug, Default)]
struct ScopeState {
    session: Option<ScanSession>,
    /// Supervisor of the latest pass, finished once that pass is finalized
    pass: Option<JoinHandle<()>>,
    schedule: Option<JoinHandle<()>>,
    last_report: Option<ScanReport>,
}

impl ScopeState {
    fn schedule_active(&self) -> bool {
        self.schedule.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the schedule and signal the running pass
    ///
    /// Returns the pass supervisor so the caller can wait for finalization.
    fn stop(&mut self) -> Option<JoinHandle<()>> {
        if let Some(schedule) = self.schedule.take() {
            schedule.abort();
        }
        if let Some(session) = self.session.as_mut() {
            session.request_cancel();
        }
        self.pass.take()
    }
}

struct ScopeEntry {
    scope: ScanScope,
    probe: Arc<dyn Probe>,
    state: Mutex<ScopeState>,
}

struct EngineInner {
    scopes: RwLock<HashMap<ScopeId, Arc<ScopeEntry>>>,
    index: Arc<dyn KnownDeviceIndex>,
    sink: Arc<dyn DiscoverySink>,
    event_tx: broadcast::Sender<DiscoveryEvent>,
    next_session: AtomicU64,
}

/// Discovery engine owning every scope's session and schedule
#[derive(Clone)]
pub struct DiscoveryEngine {
    inner: Arc<EngineInner>,
    initial_delay: Duration,
}

impl DiscoveryEngine {
    pub fn new(index: Arc<dyn KnownDeviceIndex>, sink: Arc<dyn DiscoverySink>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(EngineInner {
                scopes: RwLock::new(HashMap::new()),
                index,
                sink,
                event_tx,
                next_session: AtomicU64::new(0),
            }),
            initial_delay: Duration::ZERO,
        }
    }

    /// Delay before the first background pass of each schedule
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Subscribe to discovery events
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Register a scope together with the probe that enumerates it
    pub async fn register_scope(&self, scope: ScanScope, probe: Arc<dyn Probe>) -> Result<(), EngineError> {
        let mut scopes = self.inner.scopes.write().await;
        if scopes.contains_key(&scope.id) {
            return Err(EngineError::DuplicateScope(scope.id));
        }
        info!(scope = %scope.id, probe = probe.name(), "Scope registered");
        scopes.insert(
            scope.id.clone(),
            Arc::new(ScopeEntry {
                scope,
                probe,
                state: Mutex::new(ScopeState::default()),
            }),
        );
        Ok(())
    }

    /// Remove a scope, stopping its schedule and any running pass
    ///
    /// Returns once the running pass is finalized, so the id can be
    /// registered again without two probes running for it.
    pub async fn unregister_scope(&self, id: &ScopeId) -> Result<(), EngineError> {
        let entry = self
            .inner
            .scopes
            .write()
            .await
            .remove(id)
            .ok_or_else(|| EngineError::UnknownScope(id.clone()))?;
        let pass = entry.state.lock().await.stop();
        if let Some(pass) = pass {
            let _ = pass.await;
        }
        info!(scope = %id, "Scope unregistered");
        Ok(())
    }

    /// Registered scope ids, sorted
    pub async fn scopes(&self) -> Vec<ScopeId> {
        let mut ids: Vec<_> = self.inner.scopes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start one pass for a scope
    ///
    /// Returns immediately. `Ok(None)` means a pass was already running for
    /// the scope and nothing new was started.
    pub async fn start_manual_scan(&self, id: &ScopeId) -> Result<Option<ScanHandle>, EngineError> {
        self.inner.start_pass(id, ScanOrigin::Manual).await
    }

    /// Run passes repeatedly with a fixed delay between the end of one pass
    /// and the start of the next
    ///
    /// Returns false without touching the existing schedule if one is
    /// already active for the scope.
    pub async fn enable_background_scanning(&self, id: &ScopeId, interval: Duration) -> Result<bool, EngineError> {
        let entry = self.inner.entry(id).await?;
        let mut state = entry.state.lock().await;
        if state.schedule_active() {
            debug!(scope = %id, "Background discovery already enabled");
            return Ok(false);
        }

        let schedule = tokio::spawn(background_loop(
            Arc::downgrade(&self.inner),
            id.clone(),
            self.initial_delay,
            interval,
        ));
        state.schedule = Some(schedule);
        info!(scope = %id, interval = ?interval, initial_delay = ?self.initial_delay, "Background discovery enabled");
        Ok(true)
    }

    /// Cancel the background schedule, returns false if none was active
    ///
    /// A background pass that is still running is cancelled too.
    pub async fn disable_background_scanning(&self, id: &ScopeId) -> Result<bool, EngineError> {
        let entry = self.inner.entry(id).await?;
        let mut state = entry.state.lock().await;
        let Some(schedule) = state.schedule.take() else {
            return Ok(false);
        };
        let was_active = !schedule.is_finished();
        schedule.abort();

        if let Some(session) = state.session.as_mut() {
            if session.origin == ScanOrigin::Background && session.request_cancel() {
                debug!(scope = %id, "Cancelling running background scan");
            }
        }
        info!(scope = %id, "Background discovery disabled");
        Ok(was_active)
    }

    /// Ask the running pass to stop, returns false if no pass was running
    ///
    /// Candidates the probe already produced are still reconciled.
    pub async fn abort_scan(&self, id: &ScopeId) -> Result<bool, EngineError> {
        let entry = self.inner.entry(id).await?;
        let mut state = entry.state.lock().await;
        let Some(session) = state.session.as_mut() else {
            return Ok(false);
        };
        if !session.request_cancel() {
            return Ok(false);
        }
        info!(scope = %id, session = session.id, "Aborting discovery scan");
        Ok(true)
    }

    pub async fn scan_state(&self, id: &ScopeId) -> Result<ScanState, EngineError> {
        let entry = self.inner.entry(id).await?;
        let state = entry.state.lock().await;
        Ok(state.session.as_ref().map(|s| s.state).unwrap_or(ScanState::Idle))
    }

    pub async fn is_background_enabled(&self, id: &ScopeId) -> Result<bool, EngineError> {
        let entry = self.inner.entry(id).await?;
        let state = entry.state.lock().await;
        Ok(state.schedule_active())
    }

    /// Report of the most recent finished pass
    pub async fn last_report(&self, id: &ScopeId) -> Result<Option<ScanReport>, EngineError> {
        let entry = self.inner.entry(id).await?;
        let state = entry.state.lock().await;
        Ok(state.last_report.clone())
    }

    /// Disable every schedule and abort every running pass
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self.inner.scopes.read().await.values().cloned().collect();
        let mut passes = Vec::new();
        for entry in entries {
            passes.extend(entry.state.lock().await.stop());
        }
        for pass in passes {
            let _ = pass.await;
        }
        info!("Discovery engine stopped");
    }
}

impl EngineInner {
    async fn entry(&self, id: &ScopeId) -> Result<Arc<ScopeEntry>, EngineError> {
        self.scopes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownScope(id.clone()))
    }

    async fn start_pass(self: &Arc<Self>, id: &ScopeId, origin: ScanOrigin) -> Result<Option<ScanHandle>, EngineError> {
        let entry = self.entry(id).await?;

        let mut state = entry.state.lock().await;
        if let Some(session) = &state.session {
            debug!(scope = %id, session = session.id, state = ?session.state, "Scan already in progress, ignoring request");
            return Ok(None);
        }
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let session = ScanSession::start(session_id, origin, entry.scope.timeout);
        let pass = Pass {
            scope: entry.scope.clone(),
            probe: Arc::clone(&entry.probe),
            index: Arc::clone(&self.index),
            sink: Arc::clone(&self.sink),
            event_tx: self.event_tx.clone(),
            origin,
            started_at: session.started_at,
            timeout_at: session.timeout_at,
            cancel: session.cancel.clone(),
        };
        state.session = Some(session);

        info!(scope = %id, session = session_id, origin = ?origin, probe = entry.probe.name(), "Starting discovery scan");
        let _ = self.event_tx.send(DiscoveryEvent::ScanStarted {
            scope: id.clone(),
            origin,
        });

        let (report_tx, report_rx) = oneshot::channel();
        let inner = Arc::clone(self);
        let supervised = Arc::clone(&entry);
        // Spawned under the state lock so the supervisor is recorded before finish() runs
        state.pass = Some(tokio::spawn(async move {
            let fallback = pass.empty_report();
            let report = match tokio::spawn(pass.run()).await {
                Ok(report) => report,
                Err(e) => {
                    error!(scope = %supervised.scope.id, session = session_id, error = %e, "Discovery pass aborted unexpectedly");
                    ScanReport {
                        outcome: ScanOutcome::Failed(format!("pass aborted: {}", e)),
                        finished_at: Utc::now(),
                        ..fallback
                    }
                }
            };
            inner.finish(&supervised, session_id, report.clone()).await;
            let _ = report_tx.send(report);
        }));
        drop(state);

        Ok(Some(ScanHandle {
            scope: id.clone(),
            session: session_id,
            report: report_rx,
        }))
    }

    /// Return the scope to idle and announce the report
    async fn finish(&self, entry: &ScopeEntry, session_id: u64, report: ScanReport) {
        let mut state = entry.state.lock().await;
        if state.session.as_ref().is_some_and(|s| s.id == session_id) {
            state.session = None;
        }
        state.last_report = Some(report.clone());
        drop(state);

        match &report.outcome {
            ScanOutcome::Failed(reason) => warn!(
                scope = %report.scope,
                session = session_id,
                reason = %reason,
                "Discovery scan failed, no new devices discovered"
            ),
            outcome => info!(
                scope = %report.scope,
                session = session_id,
                outcome = %outcome,
                candidates = report.candidates,
                published = report.published,
                dropped = report.dropped,
                withdrawn = report.withdrawn,
                "Discovery scan finished"
            ),
        }
        let _ = self.event_tx.send(DiscoveryEvent::ScanFinished(report));
    }
}

async fn background_loop(engine: Weak<EngineInner>, scope: ScopeId, initial_delay: Duration, interval: Duration) {
    tokio::time::sleep(initial_delay).await;
    loop {
        let Some(inner) = engine.upgrade() else {
            break;
        };
        let started = inner.start_pass(&scope, ScanOrigin::Background).await;
        drop(inner);

        match started {
            Ok(Some(handle)) => {
                handle.finished().await;
            }
            Ok(None) => debug!(scope = %scope, "Scan already running, skipping background tick"),
            Err(e) => {
                warn!(scope = %scope, error = %e, "Stopping background discovery");
                break;
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[derive(Debug, Default)]
struct Tally {
    candidates: usize,
    published: usize,
    dropped: usize,
}

/// Everything one pass needs, detached from the engine's locks
struct Pass {
    scope: ScanScope,
    probe: Arc<dyn Probe>,
    index: Arc<dyn KnownDeviceIndex>,
    sink: Arc<dyn DiscoverySink>,
    event_tx: broadcast::Sender<DiscoveryEvent>,
    origin: ScanOrigin,
    started_at: chrono::DateTime<Utc>,
    timeout_at: Instant,
    cancel: CancellationToken,
}

impl Pass {
    async fn run(self) -> ScanReport {
        let (tx, mut rx) = mpsc::channel(CANDIDATE_BUFFER);
        let probe = Arc::clone(&self.probe);
        let probe_scope = self.scope.clone();
        let mut probe_task =
            tokio::spawn(async move { probe.enumerate(&probe_scope, CandidateSender::new(tx)).await });

        let mut reconciler = Reconciler::new(self.scope.clone(), Arc::clone(&self.index), Arc::clone(&self.sink));
        let mut tally = Tally::default();
        let deadline = tokio::time::sleep_until(self.timeout_at);
        tokio::pin!(deadline);

        let mut channel_open = true;
        let mut probe_outcome: Option<ScanOutcome> = None;
        let outcome = loop {
            if !channel_open {
                if let Some(outcome) = probe_outcome.take() {
                    break outcome;
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break ScanOutcome::Cancelled,
                _ = &mut deadline => break ScanOutcome::TimedOut,
                candidate = rx.recv(), if channel_open => match candidate {
                    Some(candidate) => self.reconcile(&mut reconciler, candidate, &mut tally).await,
                    None => channel_open = false,
                },
                joined = &mut probe_task, if probe_outcome.is_none() => {
                    probe_outcome = Some(match joined {
                        Ok(Ok(())) => ScanOutcome::Completed,
                        Ok(Err(e)) => {
                            warn!(scope = %self.scope.id, probe = self.probe.name(), error = %e, "Probe failed");
                            ScanOutcome::Failed(e.to_string())
                        }
                        Err(e) => {
                            error!(scope = %self.scope.id, probe = self.probe.name(), error = %e, "Probe task aborted");
                            ScanOutcome::Failed(format!("probe aborted: {}", e))
                        }
                    });
                }
            }
        };

        // Interrupt the probe; whatever it already produced is still reconciled
        probe_task.abort();
        rx.close();
        while let Ok(candidate) = rx.try_recv() {
            self.reconcile(&mut reconciler, candidate, &mut tally).await;
        }

        let mut withdrawn = 0;
        if outcome == ScanOutcome::Completed && self.scope.remove_stale_results {
            withdrawn = self
                .sink
                .remove_older_results(&self.scope.id, self.started_at)
                .await
                .len();
        }

        ScanReport {
            outcome,
            finished_at: Utc::now(),
            candidates: tally.candidates,
            published: tally.published,
            dropped: tally.dropped,
            withdrawn,
            ..self.empty_report()
        }
    }

    async fn reconcile(&self, reconciler: &mut Reconciler, candidate: CandidateDevice, tally: &mut Tally) {
        tally.candidates += 1;
        let raw_id = candidate.raw_id.clone();
        match reconciler.reconcile(candidate).await {
            Reconciled::Published(result) => {
                tally.published += 1;
                let _ = self.event_tx.send(DiscoveryEvent::ResultPublished(result));
            }
            Reconciled::Dropped(reason) => {
                tally.dropped += 1;
                let _ = self.event_tx.send(DiscoveryEvent::CandidateDropped {
                    scope: self.scope.id.clone(),
                    raw_id,
                    reason,
                });
            }
        }
    }

    fn empty_report(&self) -> ScanReport {
        ScanReport {
            scope: self.scope.id.clone(),
            origin: self.origin,
            outcome: ScanOutcome::Completed,
            started_at: self.started_at,
            finished_at: self.started_at,
            candidates: 0,
            published: 0,
            dropped: 0,
            withdrawn: 0,
        }
    }
}

//! Epic reconciliation: fetch, diff, detect completions, commit.
//!
//! One [`Reconciler`] owns the last-known-good snapshot of the monitored
//! epic and the completion detector's history. A sync commits the new
//! snapshot, derived phases, counts and `last_check` under one lock, so
//! readers never see new state paired with old counts. A failed fetch
//! leaves all of them untouched.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn, Instrument};

use super::completion::{aggregate_counts, CompletionDetector};
use super::phase;
pub use super::single_flight::Trigger;
use super::single_flight::{Entry, SingleFlight};
use crate::config::PolicyConfig;
use crate::gateway::TrackerGateway;
use crate::models::epic::{EpicId, EpicSnapshot, Phase};
use crate::models::session::{SessionStatus, WorkerSession};
use crate::models::snapshot::{CompletionEvent, Counts};
use crate::{AppError, Result};

/// Result of a successful sync.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Epic that was synced.
    pub epic: EpicId,
    /// Newly committed snapshot.
    pub snapshot: EpicSnapshot,
    /// Counts committed with it.
    pub counts: Counts,
    /// Completions detected this cycle.
    pub completions: Vec<CompletionEvent>,
    /// Item-complete hook failures, by issue.
    pub notify_failures: Vec<(u64, String)>,
    /// Phases that became complete this cycle, with the following phase.
    pub completed_phases: Vec<(u32, Option<u32>)>,
}

/// Outcome of [`Reconciler::sync`].
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// New state committed.
    Applied(Box<SyncReport>),
    /// Timer tick dropped because a sync was in flight.
    Skipped,
    /// Forced sync waited for an in-flight sync and reuses its result.
    Coalesced,
    /// The monitored epic changed while the fetch was in flight; result discarded.
    Stale,
}

/// Point-in-time copy of the monitoring state.
#[derive(Debug, Clone, Default)]
pub struct MonitorView {
    /// Monitored epic.
    pub target: Option<EpicId>,
    /// Last-known-good snapshot.
    pub snapshot: Option<EpicSnapshot>,
    /// Derived phases.
    pub phases: Vec<Phase>,
    /// Aggregate counts.
    pub counts: Counts,
    /// Last successful sync.
    pub last_check: Option<DateTime<Utc>>,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Completions since monitoring began.
    pub completed_since_start: u64,
    /// Next eligible phase.
    pub eligible_phase: Option<u32>,
    /// Completions from the latest sync.
    pub recent_completions: Vec<CompletionEvent>,
    /// Local checkout path.
    pub local_repo_path: Option<String>,
}

#[derive(Debug, Default)]
struct MonitorState {
    view: MonitorView,
    detector: CompletionDetector,
    /// Phases already reported complete by a merge, not yet seen done by a sync.
    announced: BTreeSet<u32>,
    epoch: u64,
}

/// Owner of the authoritative epic snapshot.
pub struct Reconciler {
    tracker: Arc<dyn TrackerGateway>,
    policy: PolicyConfig,
    flight: SingleFlight,
    state: Mutex<MonitorState>,
}

impl Reconciler {
    /// Create an idle reconciler.
    #[must_use]
    pub fn new(tracker: Arc<dyn TrackerGateway>, policy: PolicyConfig) -> Self {
        Self {
            tracker,
            policy,
            flight: SingleFlight::new(),
            state: Mutex::new(MonitorState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Point the reconciler at an epic.
    ///
    /// Switching epics discards all previous state and primes the detector
    /// from `seed` (typically the persisted snapshot). Returns `false`, with
    /// state kept, when `epic` is already the target.
    pub fn begin(&self, epic: &EpicId, seed: Option<EpicSnapshot>, local_repo_path: Option<String>) -> bool {
        let mut state = self.lock();
        if state.view.target.as_ref() == Some(epic) {
            if local_repo_path.is_some() {
                state.view.local_repo_path = local_repo_path;
            }
            return false;
        }

        let detector = seed.as_ref().map(CompletionDetector::seeded).unwrap_or_default();
        let phases = seed.as_ref().map(phase::derive_phases).unwrap_or_default();
        let gate = self.gate(&phases);
        let counts = seed
            .as_ref()
            .map(|snapshot| aggregate_counts(snapshot, gate))
            .unwrap_or_default();
        let eligible_phase = self.eligible(&phases);
        let local_repo_path =
            local_repo_path.or_else(|| seed.as_ref().and_then(|s| s.epic.local_repo_path.clone()));

        state.epoch += 1;
        state.detector = detector;
        state.announced.clear();
        state.view = MonitorView {
            target: Some(epic.clone()),
            snapshot: seed,
            phases,
            counts,
            eligible_phase,
            local_repo_path,
            ..MonitorView::default()
        };
        info!(epic = %epic, tracked = state.detector.tracked(), "reconciler target set");
        true
    }

    /// Copy of the current monitoring state.
    #[must_use]
    pub fn view(&self) -> MonitorView {
        self.lock().view.clone()
    }

    /// Monitored epic, if any.
    #[must_use]
    pub fn target(&self) -> Option<EpicId> {
        self.lock().view.target.clone()
    }

    /// Last-known-good snapshot, if any.
    #[must_use]
    pub fn latest(&self) -> Option<EpicSnapshot> {
        self.lock().view.snapshot.clone()
    }

    /// Record the local checkout path for the monitored epic.
    pub fn set_local_repo_path(&self, path: &str) {
        let mut state = self.lock();
        state.view.local_repo_path = Some(path.to_owned());
        if let Some(snapshot) = state.view.snapshot.as_mut() {
            snapshot.epic.local_repo_path = Some(path.to_owned());
        }
    }

    /// Record phases whose completion was already published elsewhere.
    ///
    /// The next sync that sees them done does not report them again.
    pub fn note_phases_completed(&self, phases: &[u32]) {
        if phases.is_empty() {
            return;
        }
        self.lock().announced.extend(phases.iter().copied());
    }

    /// Whether a sync is currently in flight.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.flight.is_busy()
    }

    fn gate(&self, phases: &[Phase]) -> Option<u32> {
        if self.policy.auto_advance {
            phase::current_phase(phases)
        } else {
            None
        }
    }

    fn eligible(&self, phases: &[Phase]) -> Option<u32> {
        if self.policy.auto_advance {
            phase::eligible_phase(phases)
        } else {
            None
        }
    }

    /// Run one reconciliation cycle.
    ///
    /// `sessions` is the supervisor's current session list, used to bind
    /// running workers to their sub-issues.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if no epic is targeted, or the tracker
    /// error when the fetch fails (after recording it as `last_error`).
    pub async fn sync(&self, trigger: Trigger, sessions: &[WorkerSession]) -> Result<SyncOutcome> {
        let _guard = match self.flight.enter(trigger).await {
            Entry::Leader(guard) => guard,
            Entry::Skipped => {
                debug!("sync in flight; tick dropped");
                return Ok(SyncOutcome::Skipped);
            }
            Entry::Joined => {
                debug!("forced sync joined in-flight sync");
                return Ok(SyncOutcome::Coalesced);
            }
        };

        let (target, epoch, local_repo_path) = {
            let state = self.lock();
            let target = state
                .view
                .target
                .clone()
                .ok_or_else(|| AppError::Validation("no epic is being monitored".into()))?;
            (target, state.epoch, state.view.local_repo_path.clone())
        };

        let span = info_span!("epic_sync", epic = %target, ?trigger);
        self.run_cycle(target, epoch, local_repo_path, sessions)
            .instrument(span)
            .await
    }

    async fn run_cycle(
        &self,
        target: EpicId,
        epoch: u64,
        local_repo_path: Option<String>,
        sessions: &[WorkerSession],
    ) -> Result<SyncOutcome> {
        let mut fresh = match self.tracker.fetch_epic_state(&target.repo, target.number).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let mut state = self.lock();
                if state.epoch == epoch {
                    state.view.last_error = Some(err.to_string());
                    state.view.consecutive_failures = state.view.consecutive_failures.saturating_add(1);
                    warn!(%err, failures = state.view.consecutive_failures, "epic fetch failed; keeping previous snapshot");
                }
                return Err(err);
            }
        };
        fresh.epic.local_repo_path = local_repo_path;
        bind_sessions(&mut fresh, sessions);

        let completions = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return Ok(SyncOutcome::Stale);
            }
            state.detector.detect(&fresh.sub_issues)
        };

        let mut notify_failures = Vec::new();
        if self.policy.auto_notify {
            for event in &completions {
                if let Err(err) = self.tracker.notify_item_complete(event.issue_number, true).await {
                    warn!(issue_number = event.issue_number, %err, "item-complete hook failed");
                    notify_failures.push((event.issue_number, err.to_string()));
                }
            }
        }

        let phases = phase::derive_phases(&fresh);
        let counts = aggregate_counts(&fresh, self.gate(&phases));
        let eligible_phase = self.eligible(&phases);

        let completed_phases = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return Ok(SyncOutcome::Stale);
            }
            let completed: Vec<(u32, Option<u32>)> = if state.view.snapshot.is_some() {
                phase::newly_completed(&state.view.phases, &phases)
                    .into_iter()
                    .filter(|number| !state.announced.contains(number))
                    .map(|number| (number, phase::next_phase(&phases, number)))
                    .collect()
            } else {
                Vec::new()
            };
            state.announced.retain(|number| {
                !phases
                    .iter()
                    .any(|phase| phase.number == *number && phase.status.is_done())
            });

            let view = &mut state.view;
            view.snapshot = Some(fresh.clone());
            view.phases = phases;
            view.counts = counts;
            view.last_check = Some(Utc::now());
            view.last_error = None;
            view.consecutive_failures = 0;
            view.completed_since_start += u64::try_from(completions.len()).unwrap_or(u64::MAX);
            view.recent_completions.clone_from(&completions);
            view.eligible_phase = eligible_phase;
            completed
        };

        info!(
            sub_issues = fresh.sub_issues.len(),
            completions = completions.len(),
            queued = counts.queued,
            in_progress = counts.in_progress,
            ready = counts.ready,
            completed = counts.completed,
            "epic synced"
        );

        Ok(SyncOutcome::Applied(Box::new(SyncReport {
            epic: target,
            snapshot: fresh,
            counts,
            completions,
            notify_failures,
            completed_phases,
        })))
    }
}

/// Attach running worker sessions to their open sub-issues.
fn bind_sessions(snapshot: &mut EpicSnapshot, sessions: &[WorkerSession]) {
    let running: HashMap<u64, &str> = sessions
        .iter()
        .filter(|session| session.status == SessionStatus::Running)
        .filter_map(|session| session.issue_number().map(|n| (n, session.name.as_str())))
        .collect();
    for issue in &mut snapshot.sub_issues {
        if issue.session_name.is_none() && issue.is_open() {
            issue.session_name = running.get(&issue.number).map(|name| (*name).to_owned());
        }
    }
}

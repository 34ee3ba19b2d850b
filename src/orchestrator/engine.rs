//! The orchestrator: explicit composition of reconciler, supervisor,
//! pipeline and notifier behind one cloneable handle.
//!
//! Each concern runs on its own timer. Timer tasks hold only a weak
//! reference to the engine, so dropping the last [`Orchestrator`] handle
//! cancels every timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::notifier::{Notifier, SubscriptionId};
use super::pipeline::{MergeBatchReport, MergeResult, PipelineAutomation};
use super::reconciler::{Reconciler, SyncOutcome, SyncReport};
use super::single_flight::Trigger;
use super::supervisor::{RecoveryResult, SessionSupervisor};
use super::ticker::{spawn_ticker, TimerHandle};
use crate::config::GlobalConfig;
use crate::gateway::{SessionGateway, TrackerGateway};
use crate::models::epic::{EpicId, PhaseStatus};
use crate::models::pipeline::{MergeMethod, PipelineItem, PipelineSummary};
use crate::models::session::WorkerSession;
use crate::models::snapshot::{ChangeKind, EngineSnapshot, Notification};
use crate::persistence::epic_repo::{EpicRecord, EpicRepo};
use crate::{AppError, Result};

struct MonitorSlot {
    epic: EpicId,
    timer: TimerHandle,
}

struct Inner {
    config: GlobalConfig,
    tracker: Arc<dyn TrackerGateway>,
    reconciler: Reconciler,
    supervisor: Arc<SessionSupervisor>,
    pipeline: PipelineAutomation,
    notifier: Notifier,
    repo: Option<EpicRepo>,
    root: CancellationToken,
    monitor: AsyncMutex<Option<MonitorSlot>>,
    background: AsyncMutex<Vec<TimerHandle>>,
    monitoring: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

/// Cloneable handle to one engine instance.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build an engine from configuration and injected gateways.
    ///
    /// `repo` enables durable epic snapshots; without it nothing is persisted.
    #[must_use]
    pub fn new(
        config: GlobalConfig,
        tracker: Arc<dyn TrackerGateway>,
        sessions: Arc<dyn SessionGateway>,
        repo: Option<EpicRepo>,
    ) -> Self {
        let supervisor = Arc::new(SessionSupervisor::new(
            sessions,
            config.sessions.clone(),
            config.agents.clone(),
        ));
        let pipeline = PipelineAutomation::new(
            Arc::clone(&supervisor),
            Arc::clone(&tracker),
            config.policy.history_limit,
        );
        let reconciler = Reconciler::new(Arc::clone(&tracker), config.policy.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                tracker,
                reconciler,
                supervisor,
                pipeline,
                notifier: Notifier::new(),
                repo,
                root: CancellationToken::new(),
                monitor: AsyncMutex::new(None),
                background: AsyncMutex::new(Vec::new()),
                monitoring: AtomicBool::new(false),
            }),
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.inner.config
    }

    /// Consistent copy of everything the engine knows.
    #[must_use]
    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        Arc::new(self.inner.build_snapshot())
    }

    /// Register a change callback.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe(callback)
    }

    /// Remove a change callback. Returns `false` if unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.notifier.unsubscribe(id)
    }

    /// Receiver tracking the latest published snapshot.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<EngineSnapshot>> {
        self.inner.notifier.watch()
    }

    /// Whether the epic timer is running.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.inner.monitoring.load(Ordering::Acquire)
    }

    /// Local checkout path recorded for the monitored epic.
    #[must_use]
    pub fn local_repo_path(&self) -> Option<String> {
        self.inner.reconciler.view().local_repo_path
    }

    /// Start polling an epic.
    ///
    /// Returns `Ok(false)` without spawning a second timer when the epic is
    /// already being monitored. Monitoring a different epic stops the old
    /// timer and resets all diffing state from the new epic's stored
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the stored snapshot cannot be read.
    pub async fn start_monitoring(&self, epic: EpicId, local_repo_path: Option<String>) -> Result<bool> {
        let mut slot = self.inner.monitor.lock().await;
        if let Some(current) = slot.as_ref() {
            if current.epic == epic && !current.timer.is_finished() {
                if let Some(path) = local_repo_path.as_deref() {
                    self.inner.remember_path(&epic, path).await;
                }
                return Ok(false);
            }
        }
        if let Some(previous) = slot.take() {
            info!(epic = %previous.epic, "switching monitored epic");
            previous.timer.cancel();
        }

        self.inner.attach(&epic, local_repo_path).await?;

        let weak = Arc::downgrade(&self.inner);
        let timer = spawn_ticker(
            "epic",
            self.inner.config.polling.epic_interval(),
            self.inner.root.child_token(),
            move || {
                let weak = Weak::clone(&weak);
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return false;
                    };
                    let _ = inner.sync(Trigger::Timer).await;
                    true
                }
            },
        );
        *slot = Some(MonitorSlot {
            epic: epic.clone(),
            timer,
        });
        self.inner.monitoring.store(true, Ordering::Release);
        drop(slot);

        info!(epic = %epic, "monitoring started");
        self.inner.publish(ChangeKind::Monitoring { active: true });
        Ok(true)
    }

    /// Stop polling. A sync already in flight still completes and applies.
    ///
    /// Returns `false` if nothing was being monitored.
    pub async fn stop_monitoring(&self) -> bool {
        let previous = self.inner.monitor.lock().await.take();
        let Some(previous) = previous else {
            return false;
        };
        previous.timer.cancel();
        self.inner.monitoring.store(false, Ordering::Release);
        info!(epic = %previous.epic, "monitoring stopped");
        self.inner.publish(ChangeKind::Monitoring { active: false });
        true
    }

    /// Point the engine at an epic without starting its timer.
    ///
    /// Used for one-shot syncs. Switching epics resets diffing state from
    /// the stored snapshot exactly as [`Self::start_monitoring`] does.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the stored snapshot cannot be read.
    pub async fn attach(&self, epic: &EpicId, local_repo_path: Option<String>) -> Result<()> {
        self.inner.attach(epic, local_repo_path).await
    }

    /// Epic stored as active, with its local checkout path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the stored record cannot be read.
    pub async fn stored_active(&self) -> Result<Option<(EpicId, Option<String>)>> {
        let Some(repo) = self.inner.repo.as_ref() else {
            return Ok(None);
        };
        Ok(repo
            .active()
            .await?
            .map(|record| (record.id, record.local_repo_path)))
    }

    /// Every stored epic, archived ones included, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the records cannot be read.
    pub async fn stored_epics(&self) -> Result<Vec<EpicRecord>> {
        match self.inner.repo.as_ref() {
            Some(repo) => repo.list().await,
            None => Ok(Vec::new()),
        }
    }

    /// Unlink an epic: stop monitoring it and archive its stored record.
    ///
    /// The record keeps its last snapshot; monitoring the epic again
    /// un-archives it. Returns `false` when nothing was stored for it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the record cannot be written.
    pub async fn unlink(&self, epic: &EpicId) -> Result<bool> {
        let monitored = self
            .inner
            .monitor
            .lock()
            .await
            .as_ref()
            .is_some_and(|slot| &slot.epic == epic);
        if monitored {
            self.stop_monitoring().await;
        }
        let Some(repo) = self.inner.repo.as_ref() else {
            return Ok(false);
        };
        let archived = repo.archive(epic).await?;
        if archived {
            info!(epic = %epic, "epic unlinked");
        }
        Ok(archived)
    }

    /// Resume monitoring the epic stored as active, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the stored record cannot be read.
    pub async fn resume(&self) -> Result<Option<EpicId>> {
        let Some((epic, local_repo_path)) = self.stored_active().await? else {
            return Ok(None);
        };
        self.start_monitoring(epic.clone(), local_repo_path).await?;
        Ok(Some(epic))
    }

    /// Sync immediately, joining an in-flight sync rather than duplicating it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if no epic is attached, or the tracker
    /// error if the fetch fails.
    pub async fn force_sync(&self) -> Result<SyncOutcome> {
        self.inner.sync(Trigger::Forced).await
    }

    /// Re-read the live session list.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` if the gateway fails.
    pub async fn refresh_sessions(&self) -> Result<Vec<WorkerSession>> {
        self.inner.refresh_sessions(Trigger::Forced).await
    }

    /// Reconcile pipeline items with the latest epic and session state.
    pub async fn refresh_agents(&self) -> bool {
        self.inner.refresh_agents(Trigger::Forced).await
    }

    /// Start a worker on a queued sub-issue.
    ///
    /// # Errors
    ///
    /// See [`PipelineAutomation::assign`].
    pub async fn assign(&self, issue_number: u64, agent_type: &str, repo_path: &str) -> Result<PipelineItem> {
        let item = self
            .inner
            .pipeline
            .assign(issue_number, agent_type, repo_path)
            .await?;
        if let Some(epic) = self.inner.reconciler.target() {
            self.inner.remember_path(&epic, repo_path).await;
        }
        self.inner.publish(ChangeKind::Pipeline);
        Ok(item)
    }

    /// Skip a queued sub-issue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::InvalidTransition`.
    pub fn skip(&self, issue_number: u64, reason: Option<&str>) -> Result<PipelineItem> {
        let item = self.inner.pipeline.skip(issue_number, reason)?;
        self.inner.publish(ChangeKind::Pipeline);
        Ok(item)
    }

    /// Mark a sub-issue's item failed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::InvalidTransition`.
    pub fn fail(&self, issue_number: u64, reason: &str) -> Result<PipelineItem> {
        let item = self.inner.pipeline.fail(issue_number, reason)?;
        self.inner.publish(ChangeKind::Pipeline);
        Ok(item)
    }

    /// Move a pipeline item into history.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id.
    pub fn archive(&self, item_id: &str) -> Result<PipelineItem> {
        let item = self.inner.pipeline.archive(item_id)?;
        self.inner.publish(ChangeKind::Pipeline);
        Ok(item)
    }

    /// Archived pipeline items, newest first.
    #[must_use]
    pub fn history(&self, limit: usize) -> Vec<PipelineItem> {
        self.inner.pipeline.history(limit)
    }

    /// Pipeline tallies.
    #[must_use]
    pub fn pipeline_summary(&self) -> PipelineSummary {
        self.inner.pipeline.summary()
    }

    /// Merge one sub-issue's pull request, then sync.
    ///
    /// `method` and `delete_branch` fall back to the configured defaults.
    ///
    /// # Errors
    ///
    /// See [`PipelineAutomation::merge_one`].
    pub async fn merge_one(
        &self,
        issue_number: u64,
        method: Option<MergeMethod>,
        delete_branch: Option<bool>,
    ) -> Result<MergeResult> {
        let defaults = &self.inner.config.merge;
        let snapshot = self.inner.reconciler.latest();
        let result = self
            .inner
            .pipeline
            .merge_one(
                issue_number,
                method.unwrap_or(defaults.method),
                delete_branch.unwrap_or(defaults.delete_branch),
                snapshot.as_ref(),
            )
            .await?;

        self.inner.publish(ChangeKind::Pipeline);
        if let (true, Some(number)) = (
            result.phase_complete,
            snapshot
                .as_ref()
                .and_then(|s| s.sub_issue(issue_number))
                .and_then(|issue| issue.phase),
        ) {
            self.inner.reconciler.note_phases_completed(&[number]);
            self.inner.publish(ChangeKind::PhaseCompleted {
                phase: number,
                next_phase: result.next_phase,
            });
        }
        self.inner.sync_after_write().await;
        Ok(result)
    }

    /// Merge every ready pull request, one at a time, then sync.
    pub async fn merge_all_ready(
        &self,
        method: Option<MergeMethod>,
        delete_branch: Option<bool>,
    ) -> MergeBatchReport {
        let defaults = &self.inner.config.merge;
        let snapshot = self.inner.reconciler.latest();
        let report = self
            .inner
            .pipeline
            .merge_all_ready(
                method.unwrap_or(defaults.method),
                delete_branch.unwrap_or(defaults.delete_branch),
                snapshot.as_ref(),
            )
            .await;

        if !report.results.is_empty() {
            self.inner.publish(ChangeKind::Pipeline);
        }
        self.inner
            .reconciler
            .note_phases_completed(&report.completed_phases);
        for &phase in &report.completed_phases {
            let next_phase = snapshot
                .as_ref()
                .and_then(|s| super::phase::next_phase(&s.epic.phases, phase));
            self.inner
                .publish(ChangeKind::PhaseCompleted { phase, next_phase });
        }
        if report.succeeded() > 0 {
            self.inner.sync_after_write().await;
        }
        report
    }

    /// Write a phase status override to the tracker, then sync.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if no epic is attached or the phase is
    /// unknown, or the tracker error if the write fails.
    pub async fn mark_phase_status(&self, phase_number: u32, status: PhaseStatus) -> Result<()> {
        let epic = self
            .inner
            .reconciler
            .target()
            .ok_or_else(|| AppError::Validation("no epic is being monitored".into()))?;
        if let Some(snapshot) = self.inner.reconciler.latest() {
            if snapshot.phase(phase_number).is_none() {
                return Err(AppError::Validation(format!(
                    "epic {epic} has no phase {phase_number}"
                )));
            }
        }
        self.inner
            .tracker
            .set_phase_status(&epic.repo, epic.number, phase_number, status)
            .await?;
        info!(epic = %epic, phase = phase_number, ?status, "phase status written");
        self.inner.sync_after_write().await;
        Ok(())
    }

    /// Kill a worker session. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` on gateway failure.
    pub async fn kill(&self, name: &str) -> Result<bool> {
        let killed = self.inner.supervisor.kill(name).await?;
        self.inner.after_session_change();
        Ok(killed)
    }

    /// Restart a stopped session bound to an issue.
    ///
    /// # Errors
    ///
    /// See [`SessionSupervisor::restart`].
    pub async fn restart(&self, name: &str) -> Result<WorkerSession> {
        let session = self.inner.supervisor.restart(name).await?;
        self.inner.after_session_change();
        Ok(session)
    }

    /// Restart every recoverable session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` only if listing sessions fails.
    pub async fn recover_all(&self, dry_run: bool, cleanup_orphans: bool) -> Result<Vec<RecoveryResult>> {
        let results = self
            .inner
            .supervisor
            .recover_all(dry_run, cleanup_orphans)
            .await?;
        if !dry_run {
            self.inner.after_session_change();
        }
        Ok(results)
    }

    /// Type a line into a session.
    ///
    /// # Errors
    ///
    /// See [`SessionSupervisor::send_input`].
    pub async fn send_input(&self, name: &str, text: &str) -> Result<()> {
        self.inner.supervisor.send_input(name, text).await
    }

    /// Capture recent session output.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` on gateway failure.
    pub async fn read_output(&self, name: &str, max_lines: usize) -> Result<String> {
        self.inner.supervisor.read_output(name, max_lines).await
    }

    /// Start the session and agent refresh timers. Idempotent.
    pub async fn start_background(&self) {
        let mut timers = self.inner.background.lock().await;
        if !timers.is_empty() {
            return;
        }
        let polling = &self.inner.config.polling;
        timers.push(self.spawn_refresh("sessions", polling.session_interval(), |inner| {
            Box::pin(async move {
                let _ = inner.refresh_sessions(Trigger::Timer).await;
            })
        }));
        timers.push(self.spawn_refresh("agents", polling.agent_interval(), |inner| {
            Box::pin(async move {
                inner.refresh_agents(Trigger::Timer).await;
            })
        }));
        info!("background refresh started");
    }

    fn spawn_refresh(
        &self,
        name: &'static str,
        period: Duration,
        run: fn(Arc<Inner>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
    ) -> TimerHandle {
        let weak = Arc::downgrade(&self.inner);
        spawn_ticker(name, period, self.inner.root.child_token(), move || {
            let weak = Weak::clone(&weak);
            async move {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                run(inner).await;
                true
            }
        })
    }

    /// Cancel every timer and wait for in-flight ticks to finish.
    pub async fn shutdown(&self) {
        let monitor = self.inner.monitor.lock().await.take();
        let background: Vec<TimerHandle> = self.inner.background.lock().await.drain(..).collect();
        self.inner.root.cancel();
        self.inner.monitoring.store(false, Ordering::Release);

        if let Some(slot) = monitor {
            slot.timer.shutdown().await;
        }
        for timer in background {
            let name = timer.name();
            timer.shutdown().await;
            info!(timer = name, "timer stopped");
        }
        info!("orchestrator shut down");
    }
}

impl Inner {
    fn build_snapshot(&self) -> EngineSnapshot {
        let view = self.reconciler.view();
        EngineSnapshot {
            target: view.target,
            epic: view.snapshot,
            phases: view.phases,
            pipeline: self.pipeline.items(),
            pipeline_summary: self.pipeline.summary(),
            sessions: self.supervisor.sessions(),
            counts: view.counts,
            completed_since_start: view.completed_since_start,
            is_monitoring: self.monitoring.load(Ordering::Acquire),
            last_check: view.last_check,
            last_error: view.last_error,
            consecutive_failures: view.consecutive_failures,
            eligible_phase: view.eligible_phase,
            recent_completions: view.recent_completions,
        }
    }

    fn publish(&self, kind: ChangeKind) {
        self.notifier.publish(kind, Arc::new(self.build_snapshot()));
    }

    async fn attach(&self, epic: &EpicId, local_repo_path: Option<String>) -> Result<()> {
        let stored = match self.repo.as_ref() {
            Some(repo) => repo.load(epic).await?,
            None => None,
        };
        let (seed, stored_path) = stored
            .map(|record| (record.snapshot, record.local_repo_path))
            .unwrap_or_default();
        let path = local_repo_path.or(stored_path);

        if self.reconciler.begin(epic, seed.clone(), path.clone()) {
            self.pipeline.clear();
            if let Some(seed) = seed.as_ref() {
                self.pipeline.sync_from_epic(seed);
            }
        }

        if let Some(repo) = self.repo.as_ref() {
            if let Err(err) = repo.set_active(epic).await {
                warn!(epic = %epic, %err, "failed to mark epic active");
            }
            if let Some(path) = path.as_deref() {
                if let Err(err) = repo.set_local_repo_path(epic, path).await {
                    warn!(epic = %epic, %err, "failed to store local repo path");
                }
            }
        }
        Ok(())
    }

    async fn remember_path(&self, epic: &EpicId, path: &str) {
        self.reconciler.set_local_repo_path(path);
        if let Some(repo) = self.repo.as_ref() {
            if let Err(err) = repo.set_local_repo_path(epic, path).await {
                warn!(epic = %epic, %err, "failed to store local repo path");
            }
        }
    }

    async fn sync(&self, trigger: Trigger) -> Result<SyncOutcome> {
        let sessions = self.supervisor.sessions();
        match self.reconciler.sync(trigger, &sessions).await {
            Ok(SyncOutcome::Applied(report)) => {
                self.apply_report(&report).await;
                Ok(SyncOutcome::Applied(report))
            }
            Ok(other) => Ok(other),
            Err(err) => {
                if trigger == Trigger::Timer {
                    warn!(%err, "scheduled sync failed; retrying next tick");
                }
                self.publish(ChangeKind::SyncFailed {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn apply_report(&self, report: &SyncReport) {
        if let Some(repo) = self.repo.as_ref() {
            if let Err(err) = repo.save_snapshot(&report.snapshot).await {
                warn!(epic = %report.epic, %err, "failed to persist snapshot");
            }
        }
        self.pipeline.sync_from_epic(&report.snapshot);

        self.publish(ChangeKind::Synced);
        if !report.completions.is_empty() {
            self.publish(ChangeKind::Completed {
                issues: report.completions.iter().map(|e| e.issue_number).collect(),
            });
        }
        for &(phase, next_phase) in &report.completed_phases {
            info!(phase, ?next_phase, "phase completed");
            self.publish(ChangeKind::PhaseCompleted { phase, next_phase });
        }
    }

    async fn sync_after_write(&self) {
        if self.reconciler.target().is_none() {
            return;
        }
        if let Err(err) = self.sync(Trigger::AfterWrite).await {
            warn!(%err, "sync after write failed");
        }
    }

    async fn refresh_sessions(&self, trigger: Trigger) -> Result<Vec<WorkerSession>> {
        match self.supervisor.refresh(trigger).await {
            Ok(sessions) => {
                self.pipeline.reconcile_sessions(&sessions);
                self.publish(ChangeKind::Sessions);
                Ok(sessions)
            }
            Err(err) => {
                warn!(%err, "session refresh failed");
                Err(err)
            }
        }
    }

    async fn refresh_agents(&self, trigger: Trigger) -> bool {
        let snapshot = self.reconciler.latest();
        let sessions = self.supervisor.sessions();
        let changed = self
            .pipeline
            .refresh(trigger, snapshot.as_ref(), &sessions)
            .await;
        if changed {
            self.publish(ChangeKind::Pipeline);
        }
        changed
    }

    fn after_session_change(&self) {
        self.pipeline.reconcile_sessions(&self.supervisor.sessions());
        self.publish(ChangeKind::Sessions);
    }
}

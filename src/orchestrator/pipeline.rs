//! Pipeline item bookkeeping, assignment and merge automation.
//!
//! Items are keyed by sub-issue number and reference sessions and
//! sub-issues by identifier only. Merges are serialized by their own lock,
//! which assignment never takes, so a long merge batch does not hold up
//! new assignments.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, info_span, warn, Instrument};

use super::phase;
use super::single_flight::{Entry, SingleFlight, Trigger};
use super::supervisor::{SessionSupervisor, WorkerRequest};
use crate::gateway::{MergeOutcome, TrackerGateway};
use crate::models::epic::{EpicSnapshot, SubIssue};
use crate::models::pipeline::{MergeMethod, PipelineItem, PipelineStatus, PipelineSummary, PrStatus};
use crate::models::session::{SessionStatus, WorkerSession};
use crate::{AppError, Result};

/// Result of merging one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeResult {
    /// Sub-issue number.
    pub issue_number: u64,
    /// Pull request number, when known.
    pub pr_number: Option<u64>,
    /// Whether the merge succeeded.
    pub success: bool,
    /// Failure detail.
    pub error: Option<String>,
    /// Whether this merge closed out the item's phase.
    pub phase_complete: bool,
    /// Phase after the completed one.
    pub next_phase: Option<u32>,
}

/// Result of [`PipelineAutomation::merge_all_ready`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeBatchReport {
    /// One entry per attempted item, in issue order.
    pub results: Vec<MergeResult>,
    /// Phases whose last open items were all merged in this batch.
    pub completed_phases: Vec<u32>,
    /// Phase following the highest completed one.
    pub next_phase: Option<u32>,
}

impl MergeBatchReport {
    /// Number of successful merges.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// Number of failed merges.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

#[derive(Debug, Default)]
struct PipelineState {
    items: BTreeMap<u64, PipelineItem>,
    history: VecDeque<PipelineItem>,
}

/// Owner of pipeline items.
pub struct PipelineAutomation {
    supervisor: Arc<SessionSupervisor>,
    tracker: Arc<dyn TrackerGateway>,
    history_limit: usize,
    flight: SingleFlight,
    merge_lock: AsyncMutex<()>,
    state: Mutex<PipelineState>,
}

impl PipelineAutomation {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new(
        supervisor: Arc<SessionSupervisor>,
        tracker: Arc<dyn TrackerGateway>,
        history_limit: usize,
    ) -> Self {
        Self {
            supervisor,
            tracker,
            history_limit,
            flight: SingleFlight::new(),
            merge_lock: AsyncMutex::new(()),
            state: Mutex::new(PipelineState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live items in issue order.
    #[must_use]
    pub fn items(&self) -> Vec<PipelineItem> {
        self.lock().items.values().cloned().collect()
    }

    /// Item for a sub-issue.
    #[must_use]
    pub fn item(&self, issue_number: u64) -> Option<PipelineItem> {
        self.lock().items.get(&issue_number).cloned()
    }

    /// Tallies of live items.
    #[must_use]
    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary::from_items(self.lock().items.values())
    }

    /// Archived items, newest first.
    #[must_use]
    pub fn history(&self, limit: usize) -> Vec<PipelineItem> {
        self.lock().history.iter().rev().take(limit).cloned().collect()
    }

    /// Drop all items, e.g. when switching epics.
    pub fn clear(&self) {
        self.lock().items.clear();
    }

    /// Create missing items and advance existing ones from tracker state.
    ///
    /// Returns `true` if anything changed.
    pub fn sync_from_epic(&self, snapshot: &EpicSnapshot) -> bool {
        let tracking_repo = snapshot.epic.id.repo.as_str();
        let work_repo = snapshot.epic.work_repo.as_deref().unwrap_or(tracking_repo);
        let mut state = self.lock();
        let mut changed = false;

        for issue in &snapshot.sub_issues {
            if let Some(item) = state.items.get_mut(&issue.number) {
                changed |= apply_issue(item, issue);
                continue;
            }
            if !issue.is_open() {
                continue;
            }
            let mut item = PipelineItem::from_sub_issue(issue, tracking_repo, work_repo);
            apply_issue(&mut item, issue);
            state.items.insert(issue.number, item);
            changed = true;
        }
        changed
    }

    /// Mark items whose worker session is gone or stopped.
    ///
    /// Returns `true` if anything changed.
    pub fn reconcile_sessions(&self, sessions: &[WorkerSession]) -> bool {
        let mut state = self.lock();
        let mut changed = false;
        for item in state.items.values_mut() {
            let Some(name) = item.session_name.as_deref() else {
                continue;
            };
            if item.status.is_terminal() {
                continue;
            }
            let stopped = sessions
                .iter()
                .find(|session| session.name == name)
                .is_none_or(|session| session.status == SessionStatus::Stopped);
            if stopped != item.session_stopped {
                item.session_stopped = stopped;
                changed = true;
            }
        }
        changed
    }

    /// Agent refresh: reconcile items with the latest epic and session list.
    ///
    /// Returns `false` when skipped or nothing changed.
    pub async fn refresh(
        &self,
        trigger: Trigger,
        snapshot: Option<&EpicSnapshot>,
        sessions: &[WorkerSession],
    ) -> bool {
        let _guard = match self.flight.enter(trigger).await {
            Entry::Leader(guard) => guard,
            Entry::Skipped | Entry::Joined => return false,
        };
        let from_epic = snapshot.is_some_and(|s| self.sync_from_epic(s));
        let from_sessions = self.reconcile_sessions(sessions);
        from_epic || from_sessions
    }

    /// Start a worker on a queued item.
    ///
    /// Input is validated before any gateway call.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an empty repository path or agent
    /// type, `AppError::NotFound` for an unknown issue,
    /// `AppError::InvalidTransition` unless the item is queued, and the
    /// supervisor's error if the session cannot be started.
    pub async fn assign(&self, issue_number: u64, agent_type: &str, repo_path: &str) -> Result<PipelineItem> {
        if repo_path.trim().is_empty() {
            return Err(AppError::Validation(
                "a local repository path is required to assign work".into(),
            ));
        }
        if agent_type.trim().is_empty() {
            return Err(AppError::Validation("agent type must not be empty".into()));
        }

        let request = {
            let state = self.lock();
            let item = state
                .items
                .get(&issue_number)
                .ok_or_else(|| AppError::NotFound(format!("no pipeline item for issue #{issue_number}")))?;
            if item.status != PipelineStatus::Queued {
                return Err(AppError::InvalidTransition(format!(
                    "issue #{issue_number} is {} and cannot be assigned",
                    item.status
                )));
            }
            WorkerRequest {
                issue_number,
                title: item.title.clone(),
                tracking_repo: item.tracking_repo.clone(),
                work_repo: item.work_repo.clone(),
                working_dir: repo_path.to_owned(),
                agent_type: agent_type.to_owned(),
            }
        };

        let session = self.supervisor.spawn_worker(&request).await?;

        let mut state = self.lock();
        let item = state
            .items
            .get_mut(&issue_number)
            .ok_or_else(|| AppError::NotFound(format!("no pipeline item for issue #{issue_number}")))?;
        item.start_work(agent_type, &session.name)?;
        info!(issue_number, session = %session.name, agent_type, "issue assigned");
        Ok(item.clone())
    }

    /// Skip a queued item.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::InvalidTransition`.
    pub fn skip(&self, issue_number: u64, reason: Option<&str>) -> Result<PipelineItem> {
        self.update(issue_number, |item| item.skip(reason))
    }

    /// Fail a non-terminal item.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` or `AppError::InvalidTransition`.
    pub fn fail(&self, issue_number: u64, reason: &str) -> Result<PipelineItem> {
        self.update(issue_number, |item| item.fail(reason))
    }

    fn update(
        &self,
        issue_number: u64,
        apply: impl FnOnce(&mut PipelineItem) -> Result<()>,
    ) -> Result<PipelineItem> {
        let mut state = self.lock();
        let item = state
            .items
            .get_mut(&issue_number)
            .ok_or_else(|| AppError::NotFound(format!("no pipeline item for issue #{issue_number}")))?;
        apply(item)?;
        Ok(item.clone())
    }

    /// Remove an item from the live set into history.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no live item has the id.
    pub fn archive(&self, item_id: &str) -> Result<PipelineItem> {
        let mut state = self.lock();
        let issue_number = state
            .items
            .values()
            .find(|item| item.id == item_id)
            .map(|item| item.issue_number)
            .ok_or_else(|| AppError::NotFound(format!("no pipeline item with id {item_id}")))?;
        let item = state
            .items
            .remove(&issue_number)
            .ok_or_else(|| AppError::NotFound(format!("no pipeline item with id {item_id}")))?;
        state.history.push_back(item.clone());
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
        Ok(item)
    }

    fn mark_merged(&self, issue_number: u64) {
        let mut state = self.lock();
        if let Some(item) = state.items.get_mut(&issue_number) {
            item.link_pr(None, None, Some(PrStatus::Merged));
            if let Err(err) = item.advance_to(PipelineStatus::Completed) {
                warn!(issue_number, %err, "merged item could not be completed");
            }
        }
    }

    fn merge_target(&self, issue_number: u64) -> Result<Option<u64>> {
        if issue_number == 0 {
            return Err(AppError::Validation("issue number must be positive".into()));
        }
        let state = self.lock();
        let item = state
            .items
            .get(&issue_number)
            .ok_or_else(|| AppError::NotFound(format!("no pipeline item for issue #{issue_number}")))?;
        if item.pr_number.is_none() {
            return Err(AppError::Validation(format!(
                "issue #{issue_number} has no pull request to merge"
            )));
        }
        if item.status.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "issue #{issue_number} is already {}",
                item.status
            )));
        }
        Ok(item.pr_number)
    }

    /// Merge one item's pull request.
    ///
    /// `snapshot` is the epic state used to decide whether the merge closed
    /// out the item's phase; the tracker's own flag is used only when the
    /// snapshot does not know the issue's phase.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for issue 0 or an item without a PR,
    /// `AppError::NotFound` for an unknown issue, and `AppError::Tracker`
    /// if the merge call fails or is rejected.
    pub async fn merge_one(
        &self,
        issue_number: u64,
        method: MergeMethod,
        delete_branch: bool,
        snapshot: Option<&EpicSnapshot>,
    ) -> Result<MergeResult> {
        let pr_number = self.merge_target(issue_number)?;
        let _merging = self.merge_lock.lock().await;
        let outcome = self
            .tracker
            .merge_pull_request(issue_number, pr_number, method, delete_branch)
            .await?;
        if !outcome.success {
            return Err(AppError::Tracker(outcome.error.unwrap_or_else(|| {
                format!("merge of issue #{issue_number} was rejected")
            })));
        }
        self.mark_merged(issue_number);

        let merged = HashSet::from([issue_number]);
        let (phase_complete, next_phase) = phase_signal(snapshot, issue_number, &merged, &outcome);
        info!(issue_number, phase_complete, "pull request merged");
        Ok(MergeResult {
            issue_number,
            pr_number,
            success: true,
            error: None,
            phase_complete,
            next_phase,
        })
    }

    /// Merge every item whose PR is ready or awaiting review.
    ///
    /// Merges run one after another; a failure is recorded for that item
    /// and the batch moves on.
    pub async fn merge_all_ready(
        &self,
        method: MergeMethod,
        delete_branch: bool,
        snapshot: Option<&EpicSnapshot>,
    ) -> MergeBatchReport {
        let _merging = self.merge_lock.lock().await;
        let candidates: Vec<(u64, Option<u64>)> = self
            .lock()
            .items
            .values()
            .filter(|item| item.is_mergeable())
            .map(|item| (item.issue_number, item.pr_number))
            .collect();

        let span = info_span!("merge_batch", candidates = candidates.len());
        async {
            let mut attempts = Vec::with_capacity(candidates.len());
            let mut merged = HashSet::new();
            for (issue_number, pr_number) in candidates {
                let attempt = self
                    .tracker
                    .merge_pull_request(issue_number, pr_number, method, delete_branch)
                    .await;
                match attempt {
                    Ok(outcome) if outcome.success => {
                        self.mark_merged(issue_number);
                        merged.insert(issue_number);
                        attempts.push((issue_number, pr_number, Ok(outcome)));
                    }
                    Ok(outcome) => {
                        let error = outcome
                            .error
                            .unwrap_or_else(|| "merge rejected".to_owned());
                        warn!(issue_number, %error, "merge failed");
                        attempts.push((issue_number, pr_number, Err(error)));
                    }
                    Err(err) => {
                        warn!(issue_number, %err, "merge failed");
                        attempts.push((issue_number, pr_number, Err(err.to_string())));
                    }
                }
            }

            let results = attempts
                .into_iter()
                .map(|(issue_number, pr_number, attempt)| match attempt {
                    Ok(outcome) => {
                        let (phase_complete, next_phase) =
                            phase_signal(snapshot, issue_number, &merged, &outcome);
                        MergeResult {
                            issue_number,
                            pr_number,
                            success: true,
                            error: None,
                            phase_complete,
                            next_phase,
                        }
                    }
                    Err(error) => MergeResult {
                        issue_number,
                        pr_number,
                        success: false,
                        error: Some(error),
                        phase_complete: false,
                        next_phase: None,
                    },
                })
                .collect();

            let completed_phases = snapshot
                .map(|s| phase::phases_closed_by(s, &merged))
                .unwrap_or_default();
            let next_phase = match (snapshot, completed_phases.iter().max()) {
                (Some(s), Some(&last)) => phase::next_phase(&s.epic.phases, last),
                _ => None,
            };

            let report = MergeBatchReport {
                results,
                completed_phases,
                next_phase,
            };
            info!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                phases = ?report.completed_phases,
                "merge batch finished"
            );
            report
        }
        .instrument(span)
        .await
    }
}

/// Decide whether merging `issue_number` (with the rest of `merged`)
/// closed out its phase.
fn phase_signal(
    snapshot: Option<&EpicSnapshot>,
    issue_number: u64,
    merged: &HashSet<u64>,
    outcome: &MergeOutcome,
) -> (bool, Option<u32>) {
    let known_phase = snapshot.and_then(|s| s.sub_issue(issue_number).and_then(|i| i.phase).map(|p| (s, p)));
    match known_phase {
        Some((snapshot, number)) => {
            let complete = phase::phases_closed_by(snapshot, merged).contains(&number);
            let next = complete
                .then(|| phase::next_phase(&snapshot.epic.phases, number))
                .flatten();
            (complete, next)
        }
        None => (outcome.phase_complete, outcome.next_phase),
    }
}

/// Advance an item from the sub-issue's tracker state. Returns `true` on change.
fn apply_issue(item: &mut PipelineItem, issue: &SubIssue) -> bool {
    if item.status.is_terminal() {
        return false;
    }
    let before = item.clone();

    item.title.clone_from(&issue.title);
    item.phase = issue.phase;
    item.link_pr(issue.pr_number, issue.pr_url.clone(), issue.pr_status);

    if item.status == PipelineStatus::Queued
        && issue.is_open()
        && issue.has_active_worker()
        && item.transition(PipelineStatus::InProgress).is_ok()
        && item.session_name.is_none()
    {
        item.session_name.clone_from(&issue.session_name);
    }

    let target = if !issue.is_open() {
        Some(PipelineStatus::Completed)
    } else if issue.has_pr() && item.status != PipelineStatus::Queued {
        Some(PipelineStatus::PrReview)
    } else {
        None
    };
    if let Some(target) = target {
        if item.status != target {
            if let Err(err) = item.advance_to(target) {
                warn!(issue_number = item.issue_number, %err, "pipeline item not advanced");
            }
        }
    }

    *item != before
}

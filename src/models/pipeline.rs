//! Pipeline item state machine and pull request status.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::epic::SubIssue;
use crate::{AppError, Result};

/// Lifecycle status of a pipeline item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Waiting for assignment.
    Queued,
    /// A worker session is on it.
    InProgress,
    /// Worker produced a branch; PR not yet in review.
    PrPending,
    /// PR open and awaiting merge.
    PrReview,
    /// Merged or closed out.
    Completed,
    /// Skipped before any work started.
    Skipped,
    /// Unrecoverable error.
    Failed,
}

impl PipelineStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }

    /// Next status on the forward path, if any.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Queued => Some(Self::InProgress),
            Self::InProgress => Some(Self::PrPending),
            Self::PrPending => Some(Self::PrReview),
            Self::PrReview => Some(Self::Completed),
            Self::Completed | Self::Skipped | Self::Failed => None,
        }
    }

    /// Determine whether a single-step transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::InProgress | Self::Skipped)
                | (Self::InProgress, Self::PrPending)
                | (Self::PrPending, Self::PrReview)
                | (Self::PrReview, Self::Completed)
                | (
                    Self::Queued | Self::InProgress | Self::PrPending | Self::PrReview,
                    Self::Failed
                )
        )
    }
}

impl Display for PipelineStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::PrPending => "pr_pending",
            Self::PrReview => "pr_review",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Review state of a pull request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    /// Draft PR.
    Draft,
    /// Marked ready for review.
    Ready,
    /// Review requested or changes requested.
    NeedsReview,
    /// Approved.
    Approved,
    /// Merged.
    Merged,
    /// Closed without merging.
    Closed,
}

impl PrStatus {
    /// Whether a batch merge should pick up this PR.
    #[must_use]
    pub fn is_mergeable(self) -> bool {
        matches!(self, Self::Ready | Self::NeedsReview)
    }
}

/// Merge strategy passed to the tracker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    /// Merge commit.
    Merge,
    /// Squash into one commit.
    #[default]
    Squash,
    /// Rebase onto the base branch.
    Rebase,
}

impl MergeMethod {
    /// Lower-case name as used by the `gh` CLI flag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Squash => "squash",
            Self::Rebase => "rebase",
        }
    }
}

impl FromStr for MergeMethod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "squash" => Ok(Self::Squash),
            "rebase" => Ok(Self::Rebase),
            other => Err(AppError::Validation(format!("unknown merge method: {other}"))),
        }
    }
}

/// Orchestration record tracking one sub-issue from assignment through merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineItem {
    /// Unique record identifier.
    pub id: String,
    /// Sub-issue number.
    pub issue_number: u64,
    /// Sub-issue title.
    pub title: String,
    /// Phase the sub-issue belongs to.
    pub phase: Option<u32>,
    /// Repository holding the epic and sub-issue.
    pub tracking_repo: String,
    /// Repository the work lands in.
    pub work_repo: String,
    /// Agent type assigned, once assigned.
    pub agent_type: Option<String>,
    /// Current state.
    pub status: PipelineStatus,
    /// Linked PR number.
    pub pr_number: Option<u64>,
    /// Linked PR URL.
    pub pr_url: Option<String>,
    /// Linked PR review state.
    pub pr_status: Option<PrStatus>,
    /// Worker session (reference only).
    pub session_name: Option<String>,
    /// Set when the bound session was observed stopped.
    pub session_stopped: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// When the item moved to `in_progress`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the item reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last error or skip reason.
    pub error: Option<String>,
}

impl PipelineItem {
    /// Build a queued item for a sub-issue.
    #[must_use]
    pub fn from_sub_issue(issue: &SubIssue, tracking_repo: &str, work_repo: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            issue_number: issue.number,
            title: issue.title.clone(),
            phase: issue.phase,
            tracking_repo: tracking_repo.to_owned(),
            work_repo: work_repo.to_owned(),
            agent_type: None,
            status: PipelineStatus::Queued,
            pr_number: issue.pr_number,
            pr_url: issue.pr_url.clone(),
            pr_status: issue.pr_status,
            session_name: issue.session_name.clone(),
            session_stopped: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Apply a single-step transition.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the step is not permitted.
    pub fn transition(&mut self, next: PipelineStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition(format!(
                "pipeline item #{} cannot move from {} to {next}",
                self.issue_number, self.status
            )));
        }
        let now = Utc::now();
        if next == PipelineStatus::InProgress {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Walk the forward chain until `target` is reached.
    ///
    /// A no-op when already at `target`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if `target` is not ahead of the
    /// current status on the forward path.
    pub fn advance_to(&mut self, target: PipelineStatus) -> Result<()> {
        if self.status == target {
            return Ok(());
        }
        let mut probe = self.status;
        let mut reachable = false;
        while let Some(next) = probe.next() {
            if next == target {
                reachable = true;
                break;
            }
            probe = next;
        }
        if !reachable {
            return Err(AppError::InvalidTransition(format!(
                "pipeline item #{} cannot advance from {} to {target}",
                self.issue_number, self.status
            )));
        }
        while self.status != target {
            if let Some(next) = self.status.next() {
                self.transition(next)?;
            }
        }
        Ok(())
    }

    /// Record the worker session and move `queued → in_progress`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` unless the item is queued.
    pub fn start_work(&mut self, agent_type: &str, session_name: &str) -> Result<()> {
        self.transition(PipelineStatus::InProgress)?;
        self.agent_type = Some(agent_type.to_owned());
        self.session_name = Some(session_name.to_owned());
        self.session_stopped = false;
        Ok(())
    }

    /// Attach PR details seen on the tracker.
    pub fn link_pr(&mut self, number: Option<u64>, url: Option<String>, status: Option<PrStatus>) {
        if number.is_some() {
            self.pr_number = number;
        }
        if url.is_some() {
            self.pr_url = url;
        }
        if status.is_some() {
            self.pr_status = status;
        }
    }

    /// Move `queued → skipped`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` unless the item is queued.
    pub fn skip(&mut self, reason: Option<&str>) -> Result<()> {
        self.transition(PipelineStatus::Skipped)?;
        self.error = reason.map(str::to_owned);
        Ok(())
    }

    /// Move any non-terminal item to `failed`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the item is already terminal.
    pub fn fail(&mut self, reason: &str) -> Result<()> {
        self.transition(PipelineStatus::Failed)?;
        self.error = Some(reason.to_owned());
        Ok(())
    }

    /// Whether the PR is ready for a batch merge.
    #[must_use]
    pub fn is_mergeable(&self) -> bool {
        self.pr_number.is_some()
            && !self.status.is_terminal()
            && self.pr_status.is_some_and(PrStatus::is_mergeable)
    }
}

/// Item counts by status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PipelineSummary {
    /// All live items.
    pub total: usize,
    /// Queued items.
    pub queued: usize,
    /// In-progress items.
    pub in_progress: usize,
    /// Items with a PR pending or in review.
    pub pr_pending: usize,
    /// Completed items.
    pub completed: usize,
    /// Skipped items.
    pub skipped: usize,
    /// Failed items.
    pub failed: usize,
}

impl PipelineSummary {
    /// Tally a set of items.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a PipelineItem>) -> Self {
        let mut summary = Self::default();
        for item in items {
            summary.total += 1;
            match item.status {
                PipelineStatus::Queued => summary.queued += 1,
                PipelineStatus::InProgress => summary.in_progress += 1,
                PipelineStatus::PrPending | PipelineStatus::PrReview => summary.pr_pending += 1,
                PipelineStatus::Completed => summary.completed += 1,
                PipelineStatus::Skipped => summary.skipped += 1,
                PipelineStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

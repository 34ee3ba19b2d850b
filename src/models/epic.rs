//! Epic, phase and sub-issue records mirrored from the issue tracker.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::pipeline::PrStatus;
use crate::AppError;

/// Remote state of a tracker issue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    /// Issue still open.
    Open,
    /// Issue closed (done or abandoned).
    Closed,
}

impl FromStr for IssueState {
    type Err = AppError;

    /// Parse the tracker's state string; comparison ignores ASCII case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("open") {
            Ok(Self::Open)
        } else if s.eq_ignore_ascii_case("closed") {
            Ok(Self::Closed)
        } else {
            Err(AppError::Validation(format!("unknown issue state: {s}")))
        }
    }
}

/// Displayed status of a phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// No work has started.
    NotStarted,
    /// At least one open sub-issue has a pull request.
    Ready,
    /// A worker is active on an open sub-issue.
    InProgress,
    /// Every sub-issue is done, or the tracker says so.
    Completed,
    /// Deliberately skipped.
    Skipped,
}

impl PhaseStatus {
    /// Whether the phase no longer gates later phases.
    #[must_use]
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Human label as written in the epic body.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::NotStarted => "Not Started",
            Self::Ready => "Ready",
            Self::InProgress => "In Progress",
            Self::Completed => "Completed",
            Self::Skipped => "Skipped",
        }
    }
}

impl FromStr for PhaseStatus {
    type Err = AppError;

    /// Accepts both the snake-case wire form and the human label.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "not_started" => Ok(Self::NotStarted),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "completed" | "complete" | "done" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(AppError::Validation(format!("unknown phase status: {s}"))),
        }
    }
}

/// Identity of an epic: tracking repository plus issue number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EpicId {
    /// Tracking repository in `owner/name` form.
    pub repo: String,
    /// Epic issue number.
    pub number: u64,
}

impl EpicId {
    /// Construct an epic identity.
    #[must_use]
    pub fn new(repo: impl Into<String>, number: u64) -> Self {
        Self {
            repo: repo.into(),
            number,
        }
    }

    /// Durable storage key, `"<repo>#<number>"`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}#{}", self.repo, self.number)
    }
}

impl Display for EpicId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

/// One ordered stage of an epic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Phase {
    /// 1-based ordinal defining execution order.
    pub number: u32,
    /// Display name.
    pub name: String,
    /// Status as reported by the tracker (or derived, in engine snapshots).
    pub status: PhaseStatus,
    /// Closed sub-issues in this phase.
    #[serde(default)]
    pub completed_count: usize,
    /// All sub-issues in this phase.
    #[serde(default)]
    pub total_count: usize,
}

impl Phase {
    /// Construct a phase with zero counts.
    #[must_use]
    pub fn new(number: u32, name: impl Into<String>, status: PhaseStatus) -> Self {
        Self {
            number,
            name: name.into(),
            status,
            completed_count: 0,
            total_count: 0,
        }
    }
}

/// A tracker issue representing one unit of phase work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubIssue {
    /// Issue number in the tracking repository.
    pub number: u64,
    /// Issue title.
    pub title: String,
    /// Remote URL.
    #[serde(default)]
    pub url: String,
    /// Open or closed.
    pub state: IssueState,
    /// Whether a worker is known to be on the issue.
    #[serde(default)]
    pub has_agent_working: bool,
    /// Linked pull request URL.
    #[serde(default)]
    pub pr_url: Option<String>,
    /// Linked pull request number.
    #[serde(default)]
    pub pr_number: Option<u64>,
    /// Review state of the linked pull request.
    #[serde(default)]
    pub pr_status: Option<PrStatus>,
    /// Worker session bound to the issue.
    #[serde(default)]
    pub session_name: Option<String>,
    /// Phase the issue belongs to.
    #[serde(default)]
    pub phase: Option<u32>,
}

impl SubIssue {
    /// Construct an open sub-issue with no PR or worker.
    #[must_use]
    pub fn open(number: u64, title: impl Into<String>, phase: Option<u32>) -> Self {
        Self {
            number,
            title: title.into(),
            url: String::new(),
            state: IssueState::Open,
            has_agent_working: false,
            pr_url: None,
            pr_number: None,
            pr_status: None,
            session_name: None,
            phase,
        }
    }

    /// Whether the issue is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == IssueState::Open
    }

    /// Whether a pull request is attached.
    #[must_use]
    pub fn has_pr(&self) -> bool {
        self.pr_number.is_some() || self.pr_url.is_some()
    }

    /// Whether a worker is on the issue, by label or bound session.
    #[must_use]
    pub fn has_active_worker(&self) -> bool {
        self.has_agent_working || self.session_name.is_some()
    }
}

/// Epic header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Epic {
    /// Tracker identity.
    pub id: EpicId,
    /// Epic title.
    pub title: String,
    /// Remote URL.
    #[serde(default)]
    pub url: String,
    /// Repository where the code changes land.
    #[serde(default)]
    pub work_repo: Option<String>,
    /// Local checkout used as worker working directory.
    #[serde(default)]
    pub local_repo_path: Option<String>,
    /// Phases ordered by number.
    #[serde(default)]
    pub phases: Vec<Phase>,
}

/// Aggregate completion of an epic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EpicProgress {
    /// Total sub-issues.
    pub total: usize,
    /// Closed sub-issues.
    pub completed: usize,
    /// Whole-number percentage, 0 when there are no sub-issues.
    pub percentage: u8,
    /// Open sub-issues.
    pub remaining: usize,
}

/// Epic header plus its sub-issues as fetched in one tracker read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EpicSnapshot {
    /// Epic header and phases.
    pub epic: Epic,
    /// Every sub-issue of the epic.
    #[serde(default)]
    pub sub_issues: Vec<SubIssue>,
}

impl EpicSnapshot {
    /// Look up a sub-issue by number.
    #[must_use]
    pub fn sub_issue(&self, number: u64) -> Option<&SubIssue> {
        self.sub_issues.iter().find(|issue| issue.number == number)
    }

    /// Look up a phase by ordinal.
    #[must_use]
    pub fn phase(&self, number: u32) -> Option<&Phase> {
        self.epic.phases.iter().find(|phase| phase.number == number)
    }

    /// Sub-issues assigned to the given phase.
    pub fn phase_issues(&self, number: u32) -> impl Iterator<Item = &SubIssue> {
        self.sub_issues
            .iter()
            .filter(move |issue| issue.phase == Some(number))
    }

    /// Completion totals across all sub-issues.
    #[must_use]
    pub fn progress(&self) -> EpicProgress {
        let total = self.sub_issues.len();
        let completed = self.sub_issues.iter().filter(|i| !i.is_open()).count();
        let percentage = if total == 0 {
            0
        } else {
            u8::try_from(completed * 100 / total).unwrap_or(100)
        };
        EpicProgress {
            total,
            completed,
            percentage,
            remaining: total - completed,
        }
    }
}

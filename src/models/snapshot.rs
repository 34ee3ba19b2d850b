//! Read-only engine state handed to subscribers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::epic::{EpicId, EpicSnapshot, Phase};
use super::pipeline::{PipelineItem, PipelineSummary};
use super::session::WorkerSession;

/// Aggregate sub-issue counts derived from the latest snapshot.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub struct Counts {
    /// Open, unassigned and not gated.
    pub queued: usize,
    /// Open with a worker and no PR.
    pub in_progress: usize,
    /// Open with a PR attached.
    pub ready: usize,
    /// Closed.
    pub completed: usize,
    /// Open, unassigned, in a phase waiting on an earlier one.
    pub blocked: usize,
}

/// One detected open-to-closed transition.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompletionEvent {
    /// Sub-issue number.
    pub issue_number: u64,
    /// Sub-issue title.
    pub title: String,
    /// Phase of the sub-issue.
    pub phase: Option<u32>,
}

/// Consistent view of everything the engine knows.
#[derive(Debug, Clone, Serialize, Default)]
pub struct EngineSnapshot {
    /// Epic being monitored.
    pub target: Option<EpicId>,
    /// Last-known-good tracker state.
    pub epic: Option<EpicSnapshot>,
    /// Phases with derived status and counts.
    pub phases: Vec<Phase>,
    /// Live pipeline items.
    pub pipeline: Vec<PipelineItem>,
    /// Pipeline tallies.
    pub pipeline_summary: PipelineSummary,
    /// Worker sessions.
    pub sessions: Vec<WorkerSession>,
    /// Aggregate counts.
    pub counts: Counts,
    /// Completions detected since monitoring began.
    pub completed_since_start: u64,
    /// Whether the epic timer is active.
    pub is_monitoring: bool,
    /// Time of the last successful sync.
    pub last_check: Option<DateTime<Utc>>,
    /// Last sync failure, cleared on success.
    pub last_error: Option<String>,
    /// Failed syncs since the last success.
    pub consecutive_failures: u32,
    /// Phase the caller may start next when auto-advance is on.
    pub eligible_phase: Option<u32>,
    /// Completions from the most recent sync.
    pub recent_completions: Vec<CompletionEvent>,
}

/// What changed in a notification.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    /// A sync applied new tracker state.
    Synced,
    /// A sync failed; previous state retained.
    SyncFailed {
        /// Failure message.
        error: String,
    },
    /// Sub-issues closed since the previous sync.
    Completed {
        /// Closed issue numbers.
        issues: Vec<u64>,
    },
    /// A phase became complete.
    PhaseCompleted {
        /// Completed phase.
        phase: u32,
        /// Next phase, if any.
        next_phase: Option<u32>,
    },
    /// Session list refreshed or mutated.
    Sessions,
    /// Pipeline items changed.
    Pipeline,
    /// Monitoring started or stopped.
    Monitoring {
        /// New monitoring flag.
        active: bool,
    },
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Change kind.
    pub kind: ChangeKind,
    /// Snapshot taken after the change.
    pub snapshot: Arc<EngineSnapshot>,
}

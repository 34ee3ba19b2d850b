//! Narrow interfaces to the external issue tracker and session manager.
//!
//! The engine never talks to `gh` or `tmux` directly; everything goes
//! through [`TrackerGateway`] and [`SessionGateway`] so the orchestrator
//! can be driven by in-memory fakes in tests.

pub mod gh;
pub mod tmux;

use std::future::Future;
use std::pin::Pin;

use crate::models::epic::{EpicSnapshot, PhaseStatus};
use crate::models::pipeline::MergeMethod;
use crate::models::session::SessionMetadata;
use crate::Result;

/// Boxed future returned by gateway methods.
pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Result of a tracker merge call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Whether the PR was merged.
    pub success: bool,
    /// Tracker's view of whether the merge closed out the phase.
    pub phase_complete: bool,
    /// Next phase number when `phase_complete` is set.
    pub next_phase: Option<u32>,
    /// Failure detail when `success` is false.
    pub error: Option<String>,
}

/// Issue tracker operations consumed by the engine.
pub trait TrackerGateway: Send + Sync {
    /// Read the epic header, phases and all sub-issues.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Tracker`](crate::AppError::Tracker) on network or CLI failure.
    fn fetch_epic_state(&self, repo: &str, epic_number: u64) -> GatewayFuture<'_, EpicSnapshot>;

    /// Write a phase status override to the tracker.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Tracker`](crate::AppError::Tracker) on failure.
    fn set_phase_status(
        &self,
        repo: &str,
        epic_number: u64,
        phase_number: u32,
        status: PhaseStatus,
    ) -> GatewayFuture<'_, ()>;

    /// Merge the pull request linked to a sub-issue.
    ///
    /// `pr_number` is the pull request already linked to the sub-issue, if
    /// known; otherwise the gateway resolves it. A rejected merge is reported through [`MergeOutcome::success`]; `Err`
    /// is reserved for the call itself failing.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Tracker`](crate::AppError::Tracker) if the tracker is unreachable.
    fn merge_pull_request(
        &self,
        issue_number: u64,
        pr_number: Option<u64>,
        method: MergeMethod,
        delete_branch: bool,
    ) -> GatewayFuture<'_, MergeOutcome>;

    /// Tell the tracker a sub-issue finished.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Tracker`](crate::AppError::Tracker) on failure.
    fn notify_item_complete(&self, issue_number: u64, success: bool) -> GatewayFuture<'_, ()>;
}

/// Live session as reported by the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session name.
    pub name: String,
    /// Whether the agent process is alive.
    pub running: bool,
    /// Work metadata stored with the session.
    pub metadata: Option<SessionMetadata>,
}

/// Parameters for creating a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSpec {
    /// Unique session name.
    pub name: String,
    /// Working directory for the worker.
    pub working_dir: Option<String>,
    /// Issue reference stored as metadata.
    pub issue_ref: Option<String>,
    /// Repository stored as metadata.
    pub repo: Option<String>,
    /// Agent type stored as metadata.
    pub agent_type: Option<String>,
}

/// Session manager operations consumed by the engine.
pub trait SessionGateway: Send + Sync {
    /// List every managed session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Session`](crate::AppError::Session) on process failure.
    fn list_sessions(&self) -> GatewayFuture<'_, Vec<SessionInfo>>;

    /// Create a detached session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Session`](crate::AppError::Session) on process failure.
    fn create_session(&self, spec: &SessionSpec) -> GatewayFuture<'_, ()>;

    /// Kill a session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Session`](crate::AppError::Session) on process failure.
    fn kill_session(&self, name: &str) -> GatewayFuture<'_, ()>;

    /// Type a line of text into the session followed by Enter.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Session`](crate::AppError::Session) on process failure.
    fn send_command(&self, name: &str, text: &str) -> GatewayFuture<'_, ()>;

    /// Capture the last `max_lines` of session output.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Session`](crate::AppError::Session) on process failure.
    fn read_output(&self, name: &str, max_lines: usize) -> GatewayFuture<'_, String>;
}

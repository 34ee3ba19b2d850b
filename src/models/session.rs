//! Worker session model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Derived status of a worker session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Agent process is alive.
    Running,
    /// Session exists but the agent exited.
    Stopped,
}

/// Work metadata carried by a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SessionMetadata {
    /// Issue reference, `"#<number>"` or `"<repo>#<number>"`.
    pub issue_ref: Option<String>,
    /// Repository the worker operates on.
    pub repo: Option<String>,
    /// Working directory (checkout or worktree).
    pub worktree: Option<String>,
    /// Agent type launched in the session.
    pub agent_type: Option<String>,
    /// When the session was created.
    pub started_at: Option<DateTime<Utc>>,
    /// Whether a terminal client is attached.
    #[serde(default)]
    pub attached: bool,
}

impl SessionMetadata {
    /// Issue number parsed from the trailing `#<n>` of `issue_ref`.
    #[must_use]
    pub fn issue_number(&self) -> Option<u64> {
        let reference = self.issue_ref.as_deref()?;
        let digits = reference.rsplit('#').next()?.trim();
        digits.parse().ok()
    }
}

/// A worker session known to the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerSession {
    /// Unique session name.
    pub name: String,
    /// Running or stopped.
    pub status: SessionStatus,
    /// Work metadata, absent for sessions the engine did not create.
    pub metadata: Option<SessionMetadata>,
}

impl WorkerSession {
    /// A stopped session that still references an issue can be restarted.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.status == SessionStatus::Stopped && self.issue_number().is_some()
    }

    /// Issue number this session works on, if known.
    #[must_use]
    pub fn issue_number(&self) -> Option<u64> {
        self.metadata.as_ref().and_then(SessionMetadata::issue_number)
    }
}

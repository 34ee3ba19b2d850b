//! Worker session supervision: create, kill, restart and recover sessions.
//!
//! The supervisor is the only writer of [`WorkerSession`] records. Every
//! mutation re-reads the live session list from the gateway and runs
//! under one async lock, so two callers can never create the same name.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, info_span, warn, Instrument};

use super::single_flight::{Entry, SingleFlight, Trigger};
use crate::config::SessionsConfig;
use crate::gateway::{SessionGateway, SessionInfo, SessionSpec};
use crate::models::session::{SessionMetadata, SessionStatus, WorkerSession};
use crate::{AppError, Result};

/// Request to start a worker on one sub-issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    /// Sub-issue number.
    pub issue_number: u64,
    /// Sub-issue title, substituted into the launch command.
    pub title: String,
    /// Repository holding the sub-issue.
    pub tracking_repo: String,
    /// Repository the worker changes.
    pub work_repo: String,
    /// Local checkout used as working directory.
    pub working_dir: String,
    /// Agent type to launch.
    pub agent_type: String,
}

/// Result of one session in a recovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// Dry run: the session would be restarted or cleaned up.
    Planned,
    /// Session restarted with its previous metadata.
    Restarted,
    /// Orphaned session removed.
    CleanedUp,
    /// Restart or cleanup failed.
    Failed {
        /// Failure message.
        error: String,
    },
}

/// Per-session entry of [`SessionSupervisor::recover_all`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryResult {
    /// Session name.
    pub session: String,
    /// Issue the session was bound to.
    pub issue_number: Option<u64>,
    /// What happened.
    #[serde(flatten)]
    pub status: RecoveryStatus,
}

/// Substitute `{issue}`, `{repo}` and `{title}` in a launch command template.
#[must_use]
pub fn render_command(template: &str, issue_number: u64, repo: &str, title: &str) -> String {
    template
        .replace("{issue}", &issue_number.to_string())
        .replace("{repo}", repo)
        .replace("{title}", title)
}

fn to_worker(info: SessionInfo) -> WorkerSession {
    WorkerSession {
        name: info.name,
        status: if info.running {
            SessionStatus::Running
        } else {
            SessionStatus::Stopped
        },
        metadata: info.metadata,
    }
}

/// Owner of the worker session set.
pub struct SessionSupervisor {
    gateway: Arc<dyn SessionGateway>,
    config: SessionsConfig,
    agents: HashMap<String, String>,
    flight: SingleFlight,
    mutation: AsyncMutex<()>,
    sessions: Mutex<BTreeMap<String, WorkerSession>>,
}

impl SessionSupervisor {
    /// Create a supervisor with an empty session cache.
    #[must_use]
    pub fn new(
        gateway: Arc<dyn SessionGateway>,
        config: SessionsConfig,
        agents: HashMap<String, String>,
    ) -> Self {
        Self {
            gateway,
            config,
            agents,
            flight: SingleFlight::new(),
            mutation: AsyncMutex::new(()),
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, BTreeMap<String, WorkerSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session name bound to a sub-issue.
    #[must_use]
    pub fn session_name_for(&self, issue_number: u64) -> String {
        self.config.session_name_for_issue(issue_number)
    }

    /// Agent type used when none is given.
    #[must_use]
    pub fn default_agent(&self) -> &str {
        &self.config.default_agent
    }

    /// Cached session list.
    #[must_use]
    pub fn sessions(&self) -> Vec<WorkerSession> {
        self.cache().values().cloned().collect()
    }

    /// Cached session by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<WorkerSession> {
        self.cache().get(name).cloned()
    }

    /// Re-read the live session list into the cache.
    ///
    /// A timer refresh is dropped while another refresh is running, and a
    /// forced refresh joins it; both then return the cached list.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` if the gateway call fails; the cache is
    /// left as it was.
    pub async fn refresh(&self, trigger: Trigger) -> Result<Vec<WorkerSession>> {
        let _guard = match self.flight.enter(trigger).await {
            Entry::Leader(guard) => guard,
            Entry::Skipped | Entry::Joined => return Ok(self.sessions()),
        };
        let live = self.gateway.list_sessions().await?;
        Ok(self.replace_cache(live))
    }

    fn replace_cache(&self, live: Vec<SessionInfo>) -> Vec<WorkerSession> {
        let fresh: BTreeMap<String, WorkerSession> = live
            .into_iter()
            .map(to_worker)
            .map(|session| (session.name.clone(), session))
            .collect();
        let list = fresh.values().cloned().collect();
        *self.cache() = fresh;
        list
    }

    async fn live(&self, name: &str) -> Result<Option<WorkerSession>> {
        let live = self.gateway.list_sessions().await?;
        let list = self.replace_cache(live);
        Ok(list.into_iter().find(|session| session.name == name))
    }

    /// Create a session, replacing a stopped one with the same name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if a running session already has the
    /// name (it is left untouched), or `AppError::Session` on gateway failure.
    pub async fn create(&self, spec: &SessionSpec) -> Result<WorkerSession> {
        let _lock = self.mutation.lock().await;
        self.create_locked(spec).await
    }

    async fn create_locked(&self, spec: &SessionSpec) -> Result<WorkerSession> {
        if let Some(existing) = self.live(&spec.name).await? {
            if existing.status == SessionStatus::Running {
                return Err(AppError::Conflict(format!(
                    "session {} is already running",
                    spec.name
                )));
            }
            info!(session = %spec.name, "replacing stopped session");
            self.gateway.kill_session(&spec.name).await?;
        }

        self.gateway.create_session(spec).await?;
        let session = WorkerSession {
            name: spec.name.clone(),
            status: SessionStatus::Running,
            metadata: Some(SessionMetadata {
                issue_ref: spec.issue_ref.clone(),
                repo: spec.repo.clone(),
                worktree: spec.working_dir.clone(),
                agent_type: spec.agent_type.clone(),
                started_at: Some(Utc::now()),
                attached: false,
            }),
        };
        self.cache().insert(session.name.clone(), session.clone());
        info!(session = %spec.name, "session created");
        Ok(session)
    }

    async fn launch(&self, name: &str, agent_type: &str, issue_number: u64, repo: &str, title: &str) -> Result<()> {
        let template = self
            .agents
            .get(agent_type)
            .map_or(agent_type, String::as_str);
        let command = render_command(template, issue_number, repo, title);
        self.gateway.send_command(name, &command).await
    }

    /// Create the session for a sub-issue and launch its agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the issue's session is already
    /// running, or `AppError::Session` on gateway failure.
    pub async fn spawn_worker(&self, request: &WorkerRequest) -> Result<WorkerSession> {
        let _lock = self.mutation.lock().await;
        let spec = SessionSpec {
            name: self.session_name_for(request.issue_number),
            working_dir: Some(request.working_dir.clone()),
            issue_ref: Some(format!("{}#{}", request.tracking_repo, request.issue_number)),
            repo: Some(request.work_repo.clone()),
            agent_type: Some(request.agent_type.clone()),
        };
        let session = self.create_locked(&spec).await?;
        let launched = self
            .launch(
                &session.name,
                &request.agent_type,
                request.issue_number,
                &request.work_repo,
                &request.title,
            )
            .await;
        if let Err(err) = launched {
            // No session outlives a failed launch.
            if let Err(kill_err) = self.gateway.kill_session(&session.name).await {
                warn!(session = %session.name, err = %kill_err, "failed to remove unlaunched session");
            }
            self.cache().remove(&session.name);
            return Err(err);
        }
        Ok(session)
    }

    /// Kill a session. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` on gateway failure.
    pub async fn kill(&self, name: &str) -> Result<bool> {
        let _lock = self.mutation.lock().await;
        if self.live(name).await?.is_none() {
            self.cache().remove(name);
            return Ok(false);
        }
        self.gateway.kill_session(name).await?;
        self.cache().remove(name);
        info!(session = %name, "session killed");
        Ok(true)
    }

    /// Re-spawn a stopped session with its previous issue metadata.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown name,
    /// `AppError::InvalidTransition` if the session is running,
    /// `AppError::Validation` if it carries no issue metadata, or
    /// `AppError::Session` on gateway failure.
    pub async fn restart(&self, name: &str) -> Result<WorkerSession> {
        let _lock = self.mutation.lock().await;
        let session = self
            .live(name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {name} does not exist")))?;
        self.restart_locked(session).await
    }

    async fn restart_locked(&self, session: WorkerSession) -> Result<WorkerSession> {
        if session.status == SessionStatus::Running {
            return Err(AppError::InvalidTransition(format!(
                "session {} is running; only stopped sessions can be restarted",
                session.name
            )));
        }
        let Some(issue_number) = session.issue_number() else {
            return Err(AppError::Validation(format!(
                "session {} has no issue metadata; re-assign the issue instead",
                session.name
            )));
        };
        let metadata = session.metadata.unwrap_or_default();
        let agent_type = metadata
            .agent_type
            .clone()
            .unwrap_or_else(|| self.config.default_agent.clone());
        let repo = metadata.repo.clone().unwrap_or_default();

        self.gateway.kill_session(&session.name).await?;
        self.cache().remove(&session.name);

        let spec = SessionSpec {
            name: session.name.clone(),
            working_dir: metadata.worktree.clone(),
            issue_ref: metadata.issue_ref.clone(),
            repo: metadata.repo.clone(),
            agent_type: Some(agent_type.clone()),
        };
        let restarted = self.create_locked(&spec).await?;
        self.launch(&restarted.name, &agent_type, issue_number, &repo, "")
            .await?;
        info!(session = %restarted.name, issue_number, "session restarted");
        Ok(restarted)
    }

    /// Restart every stopped session that still carries issue metadata.
    ///
    /// With `cleanup_orphans`, stopped sessions without metadata are killed.
    /// With `dry_run`, nothing is mutated and every candidate is reported
    /// as planned. Failures are reported per session and never stop the run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` only if the initial session listing fails.
    pub async fn recover_all(&self, dry_run: bool, cleanup_orphans: bool) -> Result<Vec<RecoveryResult>> {
        let _lock = self.mutation.lock().await;
        let span = info_span!("recover_all", dry_run, cleanup_orphans);
        async {
            let live = self.gateway.list_sessions().await?;
            let stopped: Vec<WorkerSession> = self
                .replace_cache(live)
                .into_iter()
                .filter(|session| session.status == SessionStatus::Stopped)
                .collect();

            let mut results = Vec::new();
            for session in stopped {
                let name = session.name.clone();
                let issue_number = session.issue_number();
                let recoverable = session.is_recoverable();
                if !recoverable && !cleanup_orphans {
                    continue;
                }

                let status = if dry_run {
                    RecoveryStatus::Planned
                } else if recoverable {
                    match self.restart_locked(session).await {
                        Ok(_) => RecoveryStatus::Restarted,
                        Err(err) => {
                            warn!(session = %name, %err, "session restart failed");
                            RecoveryStatus::Failed { error: err.to_string() }
                        }
                    }
                } else {
                    match self.gateway.kill_session(&name).await {
                        Ok(()) => {
                            self.cache().remove(&name);
                            RecoveryStatus::CleanedUp
                        }
                        Err(err) => {
                            warn!(session = %name, %err, "orphan cleanup failed");
                            RecoveryStatus::Failed { error: err.to_string() }
                        }
                    }
                };
                results.push(RecoveryResult {
                    session: name,
                    issue_number,
                    status,
                });
            }

            info!(sessions = results.len(), "recovery finished");
            Ok(results)
        }
        .instrument(span)
        .await
    }

    /// Type a line into a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for empty input, or `AppError::Session`
    /// on gateway failure.
    pub async fn send_input(&self, name: &str, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(AppError::Validation("input text must not be empty".into()));
        }
        self.gateway.send_command(name, text).await
    }

    /// Capture recent session output.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` on gateway failure.
    pub async fn read_output(&self, name: &str, max_lines: usize) -> Result<String> {
        self.gateway.read_output(name, max_lines).await
    }
}

//! Session gateway backed by `tmux` on a dedicated socket.
//!
//! Work metadata lives in per-session environment variables so it
//! survives engine restarts and can be read back by `show-environment`.

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::debug;

use super::{GatewayFuture, SessionGateway, SessionInfo, SessionSpec};
use crate::config::SessionsConfig;
use crate::models::session::SessionMetadata;
use crate::{AppError, Result};

/// Environment key holding the issue reference.
pub const ENV_ISSUE_REF: &str = "CONDUCTOR_ISSUE_REF";
/// Environment key holding the repository.
pub const ENV_REPO: &str = "CONDUCTOR_REPO";
/// Environment key holding the working directory.
pub const ENV_WORKTREE: &str = "CONDUCTOR_WORKTREE";
/// Environment key holding the agent type.
pub const ENV_AGENT_TYPE: &str = "CONDUCTOR_AGENT_TYPE";
/// Environment key holding the RFC 3339 creation time.
pub const ENV_STARTED_AT: &str = "CONDUCTOR_STARTED_AT";

const SHELLS: [&str; 5] = ["bash", "zsh", "sh", "fish", "dash"];

const LIST_FORMAT: &str = "#{session_name}\t#{session_attached}";

/// Whether a pane command is an idle shell rather than an agent.
#[must_use]
pub fn is_idle_shell(command: &str) -> bool {
    let command = command.trim().trim_start_matches('-');
    command.is_empty() || SHELLS.contains(&command)
}

/// Parse one `list-sessions` line into `(name, attached)`.
#[must_use]
pub fn parse_session_line(line: &str) -> Option<(String, bool)> {
    let mut parts = line.split('\t');
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let attached = parts.next().is_some_and(|flag| flag.trim() != "0");
    Some((name.to_owned(), attached))
}

/// Read work metadata from `show-environment` output.
///
/// Returns `None` when no engine keys are present.
#[must_use]
pub fn parse_environment(output: &str) -> Option<SessionMetadata> {
    let mut metadata = SessionMetadata::default();
    let mut found = false;
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = Some(value.to_owned());
        match key {
            ENV_ISSUE_REF => metadata.issue_ref = value,
            ENV_REPO => metadata.repo = value,
            ENV_WORKTREE => metadata.worktree = value,
            ENV_AGENT_TYPE => metadata.agent_type = value,
            ENV_STARTED_AT => {
                metadata.started_at = value
                    .as_deref()
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|ts| ts.with_timezone(&Utc));
            }
            _ => continue,
        }
        found = true;
    }
    found.then_some(metadata)
}

/// [`SessionGateway`] implementation shelling out to `tmux -L <socket>`.
pub struct TmuxSessions {
    socket: String,
    prefix: String,
}

impl TmuxSessions {
    /// Build a gateway from configuration.
    #[must_use]
    pub fn new(config: &SessionsConfig) -> Self {
        Self {
            socket: config.tmux_socket.clone(),
            prefix: config.prefix.clone(),
        }
    }

    async fn tmux(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(socket = %self.socket, ?args, "invoking tmux");
        Command::new("tmux")
            .arg("-L")
            .arg(&self.socket)
            .args(args)
            .output()
            .await
            .map_err(|err| AppError::Session(format!("failed to execute tmux: {err}")))
    }

    async fn tmux_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.tmux(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Session(format!(
                "tmux {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn list(&self) -> Result<Vec<SessionInfo>> {
        let output = self.tmux(&["list-sessions", "-F", LIST_FORMAT]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no server running") || stderr.contains("no sessions") {
                return Ok(Vec::new());
            }
            return Err(AppError::Session(format!("tmux list-sessions failed: {}", stderr.trim())));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut sessions = Vec::new();
        for (name, attached) in stdout.lines().filter_map(parse_session_line) {
            if !name.starts_with(&self.prefix) {
                continue;
            }
            let pane = self
                .tmux_ok(&["list-panes", "-t", &name, "-F", "#{pane_current_command}"])
                .await
                .unwrap_or_default();
            let running = pane.lines().next().is_some_and(|cmd| !is_idle_shell(cmd));
            let mut metadata = self
                .tmux_ok(&["show-environment", "-t", &name])
                .await
                .ok()
                .as_deref()
                .and_then(parse_environment);
            if let Some(meta) = metadata.as_mut() {
                meta.attached = attached;
            }
            sessions.push(SessionInfo {
                name,
                running,
                metadata,
            });
        }
        Ok(sessions)
    }

    async fn create(&self, spec: SessionSpec) -> Result<()> {
        let mut args = vec!["new-session", "-d", "-s", spec.name.as_str()];
        if let Some(dir) = spec.working_dir.as_deref() {
            args.push("-c");
            args.push(dir);
        }
        self.tmux_ok(&args).await?;

        let started_at = Utc::now().to_rfc3339();
        let entries = [
            (ENV_ISSUE_REF, spec.issue_ref.as_deref()),
            (ENV_REPO, spec.repo.as_deref()),
            (ENV_WORKTREE, spec.working_dir.as_deref()),
            (ENV_AGENT_TYPE, spec.agent_type.as_deref()),
            (ENV_STARTED_AT, Some(started_at.as_str())),
        ];
        for (key, value) in entries
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| (key, value)))
        {
            self.tmux_ok(&["set-environment", "-t", &spec.name, key, value])
                .await?;
        }
        Ok(())
    }
}

impl SessionGateway for TmuxSessions {
    fn list_sessions(&self) -> GatewayFuture<'_, Vec<SessionInfo>> {
        Box::pin(self.list())
    }

    fn create_session(&self, spec: &SessionSpec) -> GatewayFuture<'_, ()> {
        Box::pin(self.create(spec.clone()))
    }

    fn kill_session(&self, name: &str) -> GatewayFuture<'_, ()> {
        let name = name.to_owned();
        Box::pin(async move {
            self.tmux_ok(&["kill-session", "-t", &name]).await?;
            Ok(())
        })
    }

    fn send_command(&self, name: &str, text: &str) -> GatewayFuture<'_, ()> {
        let name = name.to_owned();
        let text = text.to_owned();
        Box::pin(async move {
            self.tmux_ok(&["send-keys", "-t", &name, "-l", &text]).await?;
            self.tmux_ok(&["send-keys", "-t", &name, "Enter"]).await?;
            Ok(())
        })
    }

    fn read_output(&self, name: &str, max_lines: usize) -> GatewayFuture<'_, String> {
        let name = name.to_owned();
        Box::pin(async move {
            let start = format!("-{max_lines}");
            self.tmux_ok(&["capture-pane", "-p", "-t", &name, "-S", &start])
                .await
        })
    }
}

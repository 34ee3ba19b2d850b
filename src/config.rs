//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::pipeline::MergeMethod;
use crate::{AppError, Result};

/// Polling cadence for the independent timers (seconds).
///
/// The defaults are staggered so the three loops do not burst against
/// the same external services at the same instant.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct PollingConfig {
    /// Epic reconciliation interval.
    pub epic_interval_seconds: u64,
    /// Worker session refresh interval.
    pub session_interval_seconds: u64,
    /// Agent/pipeline refresh interval.
    pub agent_interval_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            epic_interval_seconds: 30,
            session_interval_seconds: 10,
            agent_interval_seconds: 12,
        }
    }
}

impl PollingConfig {
    /// Epic reconciliation interval as a [`Duration`].
    #[must_use]
    pub fn epic_interval(&self) -> Duration {
        Duration::from_secs(self.epic_interval_seconds)
    }

    /// Session refresh interval as a [`Duration`].
    #[must_use]
    pub fn session_interval(&self) -> Duration {
        Duration::from_secs(self.session_interval_seconds)
    }

    /// Agent refresh interval as a [`Duration`].
    #[must_use]
    pub fn agent_interval(&self) -> Duration {
        Duration::from_secs(self.agent_interval_seconds)
    }
}

/// Behavioural switches for completion handling and phase gating.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct PolicyConfig {
    /// Call the tracker's item-complete hook for each detected completion.
    pub auto_notify: bool,
    /// Gate later phases on earlier ones and surface the next eligible phase.
    pub auto_advance: bool,
    /// Number of archived pipeline items retained in history.
    pub history_limit: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            auto_notify: true,
            auto_advance: true,
            history_limit: 100,
        }
    }
}

/// Defaults applied to merge operations when the caller does not override them.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct MergeConfig {
    /// Merge strategy.
    pub method: MergeMethod,
    /// Delete the head branch after merging.
    pub delete_branch: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            method: MergeMethod::Squash,
            delete_branch: true,
        }
    }
}

/// Worker session naming and multiplexer settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct SessionsConfig {
    /// Prefix every managed session name carries.
    pub prefix: String,
    /// Dedicated tmux socket name.
    pub tmux_socket: String,
    /// Agent type used when the caller does not name one.
    pub default_agent: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            prefix: "conductor-agent-".into(),
            tmux_socket: "conductor".into(),
            default_agent: "claude".into(),
        }
    }
}

impl SessionsConfig {
    /// Session name bound to a sub-issue.
    #[must_use]
    pub fn session_name_for_issue(&self, issue_number: u64) -> String {
        format!("{}{issue_number}", self.prefix)
    }
}

/// Issue tracker CLI settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct TrackerConfig {
    /// Path or name of the `gh` binary.
    pub gh_binary: String,
    /// Labels meaning an agent is working on the issue.
    pub working_labels: Vec<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            gh_binary: "gh".into(),
            working_labels: vec!["staging".into(), "agent-assigned".into()],
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".epic-conductor").join("state.db")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` file holding durable epic snapshots.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Timer cadence.
    #[serde(default)]
    pub polling: PollingConfig,
    /// Completion and phase policy.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Merge defaults.
    #[serde(default)]
    pub merge: MergeConfig,
    /// Session naming.
    #[serde(default)]
    pub sessions: SessionsConfig,
    /// Tracker CLI settings.
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Agent type to launch command template (`{issue}`, `{repo}`, `{title}` placeholders).
    #[serde(default)]
    pub agents: HashMap<String, String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            polling: PollingConfig::default(),
            policy: PolicyConfig::default(),
            merge: MergeConfig::default(),
            sessions: SessionsConfig::default(),
            tracker: TrackerConfig::default(),
            agents: HashMap::new(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Launch command for an agent type, falling back to the agent name itself.
    #[must_use]
    pub fn agent_command_template(&self, agent_type: &str) -> String {
        self.agents
            .get(agent_type)
            .cloned()
            .unwrap_or_else(|| agent_type.to_owned())
    }

    fn validate(&self) -> Result<()> {
        let polling = &self.polling;
        if polling.epic_interval_seconds == 0
            || polling.session_interval_seconds == 0
            || polling.agent_interval_seconds == 0
        {
            return Err(AppError::Config(
                "polling intervals must be greater than zero".into(),
            ));
        }

        if self.policy.history_limit == 0 {
            return Err(AppError::Config(
                "policy.history_limit must be greater than zero".into(),
            ));
        }

        if self.sessions.prefix.trim().is_empty() {
            return Err(AppError::Config("sessions.prefix must not be empty".into()));
        }

        if self.tracker.gh_binary.trim().is_empty() {
            return Err(AppError::Config("tracker.gh_binary must not be empty".into()));
        }

        Ok(())
    }
}

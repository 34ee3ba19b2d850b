//! Tracker gateway backed by the GitHub `gh` CLI.
//!
//! Epics and sub-issues are plain issues whose bodies carry markdown
//! metadata lines (`**Work Repository**:`, `**Epic**: #N`, `**Phase**: N`)
//! and a `## Phases` section with one `### Phase N: Name` heading and a
//! `**Status**:` line per phase.

use std::sync::{Mutex, PoisonError};

use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{GatewayFuture, MergeOutcome, TrackerGateway};
use crate::config::TrackerConfig;
use crate::models::epic::{
    Epic, EpicId, EpicSnapshot, IssueState, Phase, PhaseStatus, SubIssue,
};
use crate::models::pipeline::{MergeMethod, PrStatus};
use crate::{AppError, Result};

/// Upper bound on issues listed when scanning for sub-issues.
const ISSUE_LIST_LIMIT: &str = "1000";

/// Upper bound on open pull requests scanned for issue links.
const PR_LIST_LIMIT: &str = "200";

const PR_FIELDS: &str = "number,url,isDraft,reviewDecision,body,headRefName";

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    url: String,
    state: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPullRequest {
    number: u64,
    url: String,
    #[serde(default)]
    is_draft: bool,
    #[serde(default)]
    review_decision: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    head_ref_name: String,
}

/// Markdown body parser for epic and sub-issue metadata.
#[derive(Debug, Clone)]
pub struct BodyParser {
    heading: Regex,
    status: Regex,
    phase_ref: Regex,
    epic_ref: Regex,
    work_repo: Regex,
    closing_ref: Regex,
    branch_ref: Regex,
}

impl BodyParser {
    /// Compile the body patterns.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a pattern fails to compile.
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|err| AppError::Config(format!("invalid body pattern: {err}")))
        };
        Ok(Self {
            heading: compile(r"^###\s+(?:Phase\s+(\d+)\s*:\s*)?(.+?)\s*$")?,
            status: compile(r"^\*\*Status\*\*:\s*(.*?)\s*$")?,
            phase_ref: compile(r"(?m)^\s*\*\*Phase\*\*:\s*(\d+)")?,
            epic_ref: compile(r"\*\*Epic\*\*:\s*#(\d+)")?,
            work_repo: compile(r"(?m)^\s*\*\*Work Repository\*\*:\s*(\S+)")?,
            closing_ref: compile(
                r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?):?\s+(?:[\w.-]+/[\w.-]+)?#(\d+)\b",
            )?,
            branch_ref: compile(r"(?i)(?:^|[/_-])issue[-_/]?(\d+)(?:$|[/_-])")?,
        })
    }

    /// Repository named on the `**Work Repository**:` line.
    #[must_use]
    pub fn work_repo(&self, body: &str) -> Option<String> {
        self.work_repo
            .captures(body)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_owned())
    }

    /// Phase number named on the `**Phase**:` line.
    #[must_use]
    pub fn phase_number(&self, body: &str) -> Option<u32> {
        self.phase_ref
            .captures(body)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Whether a sub-issue body links to the given epic.
    #[must_use]
    pub fn references_epic(&self, body: &str, epic_number: u64) -> bool {
        self.epic_ref
            .captures_iter(body)
            .filter_map(|caps| caps.get(1))
            .any(|m| m.as_str().parse::<u64>().ok() == Some(epic_number))
    }

    /// Whether a pull request belongs to a sub-issue.
    ///
    /// Only a closing keyword (`Closes #N`, `fixes owner/repo#N`, ...) in the
    /// body or an `issue-N` segment in the head branch counts; a bare
    /// mention of `#N` does not.
    #[must_use]
    pub fn pr_links_issue(&self, body: &str, head_branch: &str, issue_number: u64) -> bool {
        let matches = |re: &Regex, text: &str| {
            re.captures_iter(text)
                .filter_map(|caps| caps.get(1))
                .any(|m| m.as_str().parse::<u64>().ok() == Some(issue_number))
        };
        matches(&self.closing_ref, body) || matches(&self.branch_ref, head_branch)
    }

    /// Phases listed under `## Phases`, in body order.
    ///
    /// Headings without an explicit number take their 1-based position.
    /// Missing or unknown status lines read as not started.
    #[must_use]
    pub fn phases(&self, body: &str) -> Vec<Phase> {
        let mut phases: Vec<Phase> = Vec::new();
        let mut in_section = false;

        for line in body.lines() {
            let trimmed = line.trim();
            if trimmed == "## Phases" {
                in_section = true;
                continue;
            }
            if !in_section {
                continue;
            }
            if trimmed.starts_with("## ") {
                break;
            }
            if let Some(caps) = self.heading.captures(trimmed) {
                let position = u32::try_from(phases.len() + 1).unwrap_or(u32::MAX);
                let number = caps
                    .get(1)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(position);
                let name = caps.get(2).map_or("", |m| m.as_str());
                phases.push(Phase::new(number, name, PhaseStatus::NotStarted));
                continue;
            }
            if let (Some(caps), Some(current)) = (self.status.captures(trimmed), phases.last_mut()) {
                let raw = caps.get(1).map_or("", |m| m.as_str());
                current.status = parse_status_label(raw).unwrap_or(PhaseStatus::NotStarted);
            }
        }

        phases
    }

    /// Replace the `**Status**:` line of one phase.
    ///
    /// Returns `None` when the phase or its status line is not present.
    #[must_use]
    pub fn rewrite_phase_status(
        &self,
        body: &str,
        phase_number: u32,
        status: PhaseStatus,
    ) -> Option<String> {
        let mut in_section = false;
        let mut position = 0_u32;
        let mut current: Option<u32> = None;
        let mut replaced = false;
        let mut lines: Vec<String> = Vec::new();

        for line in body.lines() {
            let trimmed = line.trim();
            if trimmed == "## Phases" {
                in_section = true;
            } else if in_section && trimmed.starts_with("## ") {
                in_section = false;
                current = None;
            } else if in_section {
                if let Some(caps) = self.heading.captures(trimmed) {
                    position += 1;
                    current = Some(
                        caps.get(1)
                            .and_then(|m| m.as_str().parse().ok())
                            .unwrap_or(position),
                    );
                } else if !replaced
                    && current == Some(phase_number)
                    && self.status.is_match(trimmed)
                {
                    lines.push(format!("**Status**: {} {}", status_emoji(status), status.label()));
                    replaced = true;
                    continue;
                }
            }
            lines.push(line.to_owned());
        }

        if !replaced {
            return None;
        }
        let mut rewritten = lines.join("\n");
        if body.ends_with('\n') {
            rewritten.push('\n');
        }
        Some(rewritten)
    }
}

/// Parse a status label, ignoring any leading emoji.
#[must_use]
pub fn parse_status_label(raw: &str) -> Option<PhaseStatus> {
    let label = raw.trim_start_matches(|c: char| !c.is_ascii_alphabetic());
    label.parse().ok()
}

fn status_emoji(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::NotStarted => "⏸️",
        PhaseStatus::Ready => "🔵",
        PhaseStatus::InProgress => "🔄",
        PhaseStatus::Completed => "✅",
        PhaseStatus::Skipped => "⏭️",
    }
}

/// Map `gh` PR fields onto a review status.
#[must_use]
pub fn pr_status_from(is_draft: bool, review_decision: Option<&str>) -> PrStatus {
    if is_draft {
        return PrStatus::Draft;
    }
    match review_decision {
        Some("APPROVED") => PrStatus::Approved,
        Some("CHANGES_REQUESTED" | "REVIEW_REQUIRED") => PrStatus::NeedsReview,
        _ => PrStatus::Ready,
    }
}

#[derive(Debug, Clone)]
struct LastEpic {
    tracking_repo: String,
    work_repo: String,
}

/// [`TrackerGateway`] implementation shelling out to `gh`.
pub struct GhTracker {
    binary: String,
    working_labels: Vec<String>,
    parser: BodyParser,
    last_epic: Mutex<Option<LastEpic>>,
}

impl GhTracker {
    /// Build a tracker from configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the body patterns fail to compile.
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        Ok(Self {
            binary: config.gh_binary.clone(),
            working_labels: config.working_labels.clone(),
            parser: BodyParser::new()?,
            last_epic: Mutex::new(None),
        })
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(binary = %self.binary, ?args, "invoking gh");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|err| AppError::Tracker(format!("failed to execute gh: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Tracker(format!(
                "gh {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_json<T: for<'de> Deserialize<'de>>(&self, args: &[&str]) -> Result<T> {
        let stdout = self.run(args).await?;
        serde_json::from_str(&stdout)
            .map_err(|err| AppError::Tracker(format!("failed to parse gh output: {err}")))
    }

    async fn view_issue(&self, repo: &str, number: u64) -> Result<GhIssue> {
        let number = number.to_string();
        self.run_json(&[
            "issue",
            "view",
            &number,
            "--repo",
            repo,
            "--json",
            "number,title,body,url,state,labels",
        ])
        .await
    }

    async fn open_prs(&self, work_repo: &str) -> Result<Vec<GhPullRequest>> {
        self.run_json(&[
            "pr",
            "list",
            "--repo",
            work_repo,
            "--state",
            "open",
            "--json",
            PR_FIELDS,
            "--limit",
            PR_LIST_LIMIT,
        ])
        .await
    }

    fn linked_pr<'a>(&self, prs: &'a [GhPullRequest], issue_number: u64) -> Option<&'a GhPullRequest> {
        prs.iter().find(|pr| {
            self.parser
                .pr_links_issue(pr.body.as_deref().unwrap_or_default(), &pr.head_ref_name, issue_number)
        })
    }

    fn remember(&self, tracking_repo: &str, work_repo: &str) {
        let mut guard = self.last_epic.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(LastEpic {
            tracking_repo: tracking_repo.to_owned(),
            work_repo: work_repo.to_owned(),
        });
    }

    fn last_epic(&self) -> Result<LastEpic> {
        self.last_epic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| AppError::Tracker("no epic has been fetched yet".into()))
    }

    async fn fetch(&self, repo: String, epic_number: u64) -> Result<EpicSnapshot> {
        let issue = self.view_issue(&repo, epic_number).await?;
        let body = issue.body.unwrap_or_default();
        let work_repo = self.parser.work_repo(&body).unwrap_or_else(|| repo.clone());
        let phases = self.parser.phases(&body);

        let listed: Vec<GhIssue> = self
            .run_json(&[
                "issue",
                "list",
                "--repo",
                &repo,
                "--state",
                "all",
                "--limit",
                ISSUE_LIST_LIMIT,
                "--json",
                "number,title,body,url,state,labels",
            ])
            .await?;

        let open_prs = if listed.iter().any(|c| c.state.eq_ignore_ascii_case("open")) {
            self.open_prs(&work_repo).await?
        } else {
            Vec::new()
        };

        let mut sub_issues = Vec::new();
        for candidate in listed {
            let body = candidate.body.as_deref().unwrap_or_default();
            if candidate.number == epic_number || !self.parser.references_epic(body, epic_number) {
                continue;
            }
            let state: IssueState = candidate.state.parse()?;
            let has_agent_working = candidate
                .labels
                .iter()
                .any(|label| self.working_labels.iter().any(|w| w == &label.name));
            let mut sub = SubIssue {
                number: candidate.number,
                title: candidate.title,
                url: candidate.url,
                state,
                has_agent_working,
                pr_url: None,
                pr_number: None,
                pr_status: None,
                session_name: None,
                phase: self.parser.phase_number(body),
            };

            // Closed issues are done; only open ones need a PR.
            if state == IssueState::Open {
                if let Some(pr) = self.linked_pr(&open_prs, sub.number) {
                    sub.pr_status = Some(pr_status_from(pr.is_draft, pr.review_decision.as_deref()));
                    sub.pr_number = Some(pr.number);
                    sub.pr_url = Some(pr.url.clone());
                }
            }
            sub_issues.push(sub);
        }
        sub_issues.sort_by_key(|sub| sub.number);

        self.remember(&repo, &work_repo);

        Ok(EpicSnapshot {
            epic: Epic {
                id: EpicId::new(repo, epic_number),
                title: issue.title.trim_start_matches("[EPIC]").trim().to_owned(),
                url: issue.url,
                work_repo: Some(work_repo),
                local_repo_path: None,
                phases,
            },
            sub_issues,
        })
    }

    async fn write_phase_status(
        &self,
        repo: String,
        epic_number: u64,
        phase_number: u32,
        status: PhaseStatus,
    ) -> Result<()> {
        let issue = self.view_issue(&repo, epic_number).await?;
        let body = issue.body.unwrap_or_default();
        let rewritten = self
            .parser
            .rewrite_phase_status(&body, phase_number, status)
            .ok_or_else(|| {
                AppError::NotFound(format!("phase {phase_number} has no status line in epic #{epic_number}"))
            })?;
        let number = epic_number.to_string();
        self.run(&["issue", "edit", &number, "--repo", &repo, "--body", &rewritten])
            .await?;
        Ok(())
    }

    async fn merge(
        &self,
        issue_number: u64,
        pr_number: Option<u64>,
        method: MergeMethod,
        delete_branch: bool,
    ) -> Result<MergeOutcome> {
        let last = self.last_epic()?;
        let pr_number = match pr_number {
            Some(number) => number,
            None => {
                let prs = self.open_prs(&last.work_repo).await?;
                let Some(pr) = self.linked_pr(&prs, issue_number) else {
                    return Ok(MergeOutcome {
                        error: Some(format!("no open pull request for issue #{issue_number}")),
                        ..MergeOutcome::default()
                    });
                };
                pr.number
            }
        };

        let number = pr_number.to_string();
        let flag = format!("--{}", method.as_str());
        let mut args = vec!["pr", "merge", number.as_str(), "--repo", last.work_repo.as_str(), flag.as_str()];
        if delete_branch {
            args.push("--delete-branch");
        }

        match self.run(&args).await {
            Ok(_) => Ok(MergeOutcome {
                success: true,
                ..MergeOutcome::default()
            }),
            // A rejected merge (conflicts, checks) is an item result, not a call failure.
            Err(AppError::Tracker(detail)) => Ok(MergeOutcome {
                error: Some(detail),
                ..MergeOutcome::default()
            }),
            Err(err) => Err(err),
        }
    }

    async fn comment_complete(&self, issue_number: u64, success: bool) -> Result<()> {
        let last = self.last_epic()?;
        let body = if success {
            "✅ **Work Complete**\n\nThis sub-issue was closed and counted toward its phase."
        } else {
            "⚠️ **Work Incomplete**\n\nThis sub-issue was closed without a merged change."
        };
        let number = issue_number.to_string();
        self.run(&["issue", "comment", &number, "--repo", &last.tracking_repo, "--body", body])
            .await?;
        Ok(())
    }
}

impl TrackerGateway for GhTracker {
    fn fetch_epic_state(&self, repo: &str, epic_number: u64) -> GatewayFuture<'_, EpicSnapshot> {
        let repo = repo.to_owned();
        Box::pin(self.fetch(repo, epic_number))
    }

    fn set_phase_status(
        &self,
        repo: &str,
        epic_number: u64,
        phase_number: u32,
        status: PhaseStatus,
    ) -> GatewayFuture<'_, ()> {
        let repo = repo.to_owned();
        Box::pin(self.write_phase_status(repo, epic_number, phase_number, status))
    }

    fn merge_pull_request(
        &self,
        issue_number: u64,
        pr_number: Option<u64>,
        method: MergeMethod,
        delete_branch: bool,
    ) -> GatewayFuture<'_, MergeOutcome> {
        Box::pin(self.merge(issue_number, pr_number, method, delete_branch))
    }

    fn notify_item_complete(&self, issue_number: u64, success: bool) -> GatewayFuture<'_, ()> {
        Box::pin(self.comment_complete(issue_number, success))
    }
}

//! In-memory gateways for driving the engine without `gh` or `tmux`.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use epic_conductor::config::GlobalConfig;
use epic_conductor::gateway::{
    GatewayFuture, MergeOutcome, SessionGateway, SessionInfo, SessionSpec, TrackerGateway,
};
use epic_conductor::models::epic::{
    Epic, EpicId, EpicSnapshot, IssueState, Phase, PhaseStatus, SubIssue,
};
use epic_conductor::models::pipeline::{MergeMethod, PrStatus};
use epic_conductor::models::session::SessionMetadata;
use epic_conductor::persistence::epic_repo::EpicRepo;
use epic_conductor::{AppError, Orchestrator};

pub const REPO: &str = "acme/tracking";

pub fn epic_id() -> EpicId {
    EpicId::new(REPO, 1)
}

pub fn epic(phases: Vec<Phase>, sub_issues: Vec<SubIssue>) -> EpicSnapshot {
    EpicSnapshot {
        epic: Epic {
            id: epic_id(),
            title: "Payments rewrite".into(),
            url: format!("https://github.com/{REPO}/issues/1"),
            work_repo: Some("acme/work".into()),
            local_repo_path: None,
            phases,
        },
        sub_issues,
    }
}

pub fn two_phases() -> Vec<Phase> {
    vec![
        Phase::new(1, "Foundation", PhaseStatus::NotStarted),
        Phase::new(2, "Rollout", PhaseStatus::NotStarted),
    ]
}

/// Phase 1 holds #10 and #11 (#11 has a worker), phase 2 holds #12.
pub fn scenario() -> EpicSnapshot {
    let mut working = SubIssue::open(11, "Add ledger table", Some(1));
    working.has_agent_working = true;
    epic(
        two_phases(),
        vec![
            SubIssue::open(10, "Schema migration", Some(1)),
            working,
            SubIssue::open(12, "Enable flag", Some(2)),
        ],
    )
}

pub fn close(snapshot: &mut EpicSnapshot, number: u64) {
    if let Some(issue) = snapshot.sub_issues.iter_mut().find(|i| i.number == number) {
        issue.state = IssueState::Closed;
        issue.has_agent_working = false;
    }
}

pub fn with_pr(snapshot: &mut EpicSnapshot, number: u64, pr_number: u64) {
    if let Some(issue) = snapshot.sub_issues.iter_mut().find(|i| i.number == number) {
        issue.pr_number = Some(pr_number);
        issue.pr_url = Some(format!("https://github.com/acme/work/pull/{pr_number}"));
        issue.pr_status = Some(PrStatus::Ready);
    }
}

#[derive(Default)]
struct TrackerState {
    snapshot: Option<EpicSnapshot>,
    fail_fetch: bool,
    fetch_delay: Option<Duration>,
    merge_delay: Option<Duration>,
    fetches: usize,
    merge_failures: HashSet<u64>,
    merged: Vec<(u64, MergeMethod, bool)>,
    notified: Vec<u64>,
    fail_notify: bool,
    phase_writes: Vec<(u32, PhaseStatus)>,
}

/// Scripted tracker that records every call.
#[derive(Default)]
pub struct FakeTracker {
    state: Mutex<TrackerState>,
}

impl FakeTracker {
    pub fn new(snapshot: EpicSnapshot) -> Arc<Self> {
        let tracker = Self::default();
        tracker.set_snapshot(snapshot);
        Arc::new(tracker)
    }

    pub fn set_snapshot(&self, snapshot: EpicSnapshot) {
        self.state.lock().unwrap().snapshot = Some(snapshot);
    }

    pub fn update(&self, edit: impl FnOnce(&mut EpicSnapshot)) {
        let mut state = self.state.lock().unwrap();
        if let Some(snapshot) = state.snapshot.as_mut() {
            edit(snapshot);
        }
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.state.lock().unwrap().fail_fetch = fail;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.lock().unwrap().fetch_delay = Some(delay);
    }

    pub fn set_merge_delay(&self, delay: Duration) {
        self.state.lock().unwrap().merge_delay = Some(delay);
    }

    pub fn set_fail_notify(&self, fail: bool) {
        self.state.lock().unwrap().fail_notify = fail;
    }

    pub fn fail_merge(&self, issue_number: u64) {
        self.state.lock().unwrap().merge_failures.insert(issue_number);
    }

    pub fn fetches(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    pub fn merged(&self) -> Vec<(u64, MergeMethod, bool)> {
        self.state.lock().unwrap().merged.clone()
    }

    pub fn notified(&self) -> Vec<u64> {
        self.state.lock().unwrap().notified.clone()
    }

    pub fn phase_writes(&self) -> Vec<(u32, PhaseStatus)> {
        self.state.lock().unwrap().phase_writes.clone()
    }
}

impl TrackerGateway for FakeTracker {
    fn fetch_epic_state(&self, _repo: &str, _epic_number: u64) -> GatewayFuture<'_, EpicSnapshot> {
        Box::pin(async move {
            // The reply reflects the tracker as it was when the request went out.
            let (reply, delay) = {
                let mut state = self.state.lock().unwrap();
                state.fetches += 1;
                let reply = if state.fail_fetch {
                    Err(AppError::Tracker("connection reset by peer".into()))
                } else {
                    state
                        .snapshot
                        .clone()
                        .ok_or_else(|| AppError::NotFound("epic not scripted".into()))
                };
                (reply, state.fetch_delay)
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            reply
        })
    }

    fn set_phase_status(
        &self,
        _repo: &str,
        _epic_number: u64,
        phase_number: u32,
        status: PhaseStatus,
    ) -> GatewayFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.phase_writes.push((phase_number, status));
            if let Some(phase) = state
                .snapshot
                .as_mut()
                .and_then(|s| s.epic.phases.iter_mut().find(|p| p.number == phase_number))
            {
                phase.status = status;
            }
            Ok(())
        })
    }

    fn merge_pull_request(
        &self,
        issue_number: u64,
        _pr_number: Option<u64>,
        method: MergeMethod,
        delete_branch: bool,
    ) -> GatewayFuture<'_, MergeOutcome> {
        Box::pin(async move {
            let delay = self.state.lock().unwrap().merge_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = self.state.lock().unwrap();
            if state.merge_failures.contains(&issue_number) {
                return Ok(MergeOutcome {
                    success: false,
                    error: Some("merge conflict".into()),
                    ..MergeOutcome::default()
                });
            }
            state.merged.push((issue_number, method, delete_branch));
            if let Some(snapshot) = state.snapshot.as_mut() {
                close(snapshot, issue_number);
            }
            Ok(MergeOutcome {
                success: true,
                ..MergeOutcome::default()
            })
        })
    }

    fn notify_item_complete(&self, issue_number: u64, _success: bool) -> GatewayFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.fail_notify {
                return Err(AppError::Tracker("comment rejected".into()));
            }
            state.notified.push(issue_number);
            Ok(())
        })
    }
}

#[derive(Default)]
struct SessionState {
    sessions: BTreeMap<String, SessionInfo>,
    calls: Vec<String>,
    fail_list: bool,
    fail_send: bool,
}

/// In-memory session manager that records every call.
#[derive(Default)]
pub struct FakeSessions {
    state: Mutex<SessionState>,
}

impl FakeSessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, name: &str, running: bool, issue_ref: Option<&str>) {
        let metadata = issue_ref.map(|issue_ref| SessionMetadata {
            issue_ref: Some(issue_ref.to_owned()),
            repo: Some("acme/work".into()),
            worktree: Some("/work/acme".into()),
            agent_type: Some("claude".into()),
            ..SessionMetadata::default()
        });
        self.state.lock().unwrap().sessions.insert(
            name.to_owned(),
            SessionInfo {
                name: name.to_owned(),
                running,
                metadata,
            },
        );
    }

    pub fn set_running(&self, name: &str, running: bool) {
        if let Some(info) = self.state.lock().unwrap().sessions.get_mut(name) {
            info.running = running;
        }
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.state.lock().unwrap().fail_list = fail;
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.state.lock().unwrap().fail_send = fail;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls other than listing.
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call != "list")
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().unwrap().sessions.keys().cloned().collect()
    }
}

impl SessionGateway for FakeSessions {
    fn list_sessions(&self) -> GatewayFuture<'_, Vec<SessionInfo>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.calls.push("list".into());
            if state.fail_list {
                return Err(AppError::Session("no server running".into()));
            }
            Ok(state.sessions.values().cloned().collect())
        })
    }

    fn create_session(&self, spec: &SessionSpec) -> GatewayFuture<'_, ()> {
        let spec = spec.clone();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("create:{}", spec.name));
            state.sessions.insert(
                spec.name.clone(),
                SessionInfo {
                    name: spec.name.clone(),
                    running: true,
                    metadata: Some(SessionMetadata {
                        issue_ref: spec.issue_ref,
                        repo: spec.repo,
                        worktree: spec.working_dir,
                        agent_type: spec.agent_type,
                        ..SessionMetadata::default()
                    }),
                },
            );
            Ok(())
        })
    }

    fn kill_session(&self, name: &str) -> GatewayFuture<'_, ()> {
        let name = name.to_owned();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("kill:{name}"));
            state.sessions.remove(&name);
            Ok(())
        })
    }

    fn send_command(&self, name: &str, text: &str) -> GatewayFuture<'_, ()> {
        let call = format!("send:{name}:{text}");
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call);
            if state.fail_send {
                return Err(AppError::Session("pane is dead".into()));
            }
            Ok(())
        })
    }

    fn read_output(&self, name: &str, max_lines: usize) -> GatewayFuture<'_, String> {
        let name = name.to_owned();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("read:{name}"));
            if !state.sessions.contains_key(&name) {
                return Err(AppError::Session(format!("can't find session: {name}")));
            }
            Ok(format!("{max_lines} lines from {name}"))
        })
    }
}

pub fn config() -> GlobalConfig {
    let mut config = GlobalConfig::default();
    config
        .agents
        .insert("claude".into(), "claude --issue {issue} --repo {repo}".into());
    config
}

pub struct Harness {
    pub engine: Orchestrator,
    pub tracker: Arc<FakeTracker>,
    pub sessions: Arc<FakeSessions>,
}

pub fn harness(snapshot: EpicSnapshot) -> Harness {
    harness_with(snapshot, config(), None)
}

pub fn harness_with(snapshot: EpicSnapshot, config: GlobalConfig, repo: Option<EpicRepo>) -> Harness {
    let tracker = FakeTracker::new(snapshot);
    let sessions = FakeSessions::new();
    let engine = Orchestrator::new(config, tracker.clone(), sessions.clone(), repo);
    Harness {
        engine,
        tracker,
        sessions,
    }
}

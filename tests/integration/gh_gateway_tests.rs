//! `GhTracker` driven against a scripted `gh` stand-in.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use epic_conductor::config::TrackerConfig;
use epic_conductor::gateway::gh::GhTracker;
use epic_conductor::gateway::TrackerGateway;
use epic_conductor::models::pipeline::{MergeMethod, PrStatus};
use epic_conductor::AppError;

const SCRIPT: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
echo "$*" >> "$dir/calls"
case "$1 $2" in
  "issue view") cat "$dir/epic.json" ;;
  "issue list") cat "$dir/issues.json" ;;
  "pr list")
    if [ -f "$dir/pr_fail" ]; then echo "HTTP 502: Bad Gateway" >&2; exit 1; fi
    cat "$dir/prs.json" ;;
  "pr merge") ;;
  *) echo "unexpected call: $*" >&2; exit 1 ;;
esac
"#;

const EPIC: &str = r#"{"number":1,"title":"[EPIC] Payments rewrite","body":"**Work Repository**: acme/work\n\n## Phases\n\n### Phase 1: Foundation\n**Status**: Not Started\n","url":"https://github.com/acme/tracking/issues/1","state":"OPEN","labels":[]}"#;

const ISSUES: &str = r#"[
  {"number":10,"title":"Schema migration","body":"**Epic**: #1\n**Phase**: 1","url":"https://github.com/acme/tracking/issues/10","state":"OPEN","labels":[]},
  {"number":11,"title":"Add ledger table","body":"**Epic**: #1\n**Phase**: 1","url":"https://github.com/acme/tracking/issues/11","state":"OPEN","labels":[{"name":"agent-assigned"}]}
]"#;

const PRS: &str = r#"[
  {"number":501,"url":"https://github.com/acme/work/pull/501","isDraft":false,"reviewDecision":null,"body":"Follow-up to the ledger work, see #10 and #11","headRefName":"followup"},
  {"number":500,"url":"https://github.com/acme/work/pull/500","isDraft":false,"reviewDecision":null,"body":"Closes acme/tracking#10","headRefName":"agent/schema"}
]"#;

fn install(dir: &Path) -> GhTracker {
    fs::write(dir.join("epic.json"), EPIC).unwrap();
    fs::write(dir.join("issues.json"), ISSUES).unwrap();
    fs::write(dir.join("prs.json"), PRS).unwrap();
    let script = dir.join("gh");
    fs::write(&script, SCRIPT).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let config = TrackerConfig {
        gh_binary: script.display().to_string(),
        ..TrackerConfig::default()
    };
    GhTracker::new(&config).unwrap()
}

fn pr_listings(dir: &Path) -> usize {
    fs::read_to_string(dir.join("calls"))
        .unwrap_or_default()
        .lines()
        .filter(|line| line.starts_with("pr list"))
        .count()
}

#[tokio::test]
async fn scripted_gh_links_merges_and_fails_whole_fetches() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tracker = install(dir.path());

    let snapshot = tracker.fetch_epic_state("acme/tracking", 1).await.unwrap();
    assert_eq!(snapshot.epic.title, "Payments rewrite");
    assert_eq!(snapshot.epic.work_repo.as_deref(), Some("acme/work"));
    let linked = &snapshot.sub_issues[0];
    assert_eq!(linked.pr_number, Some(500), "closing reference wins over a mention");
    assert_eq!(linked.pr_status, Some(PrStatus::Ready));
    let mentioned = &snapshot.sub_issues[1];
    assert_eq!(mentioned.pr_number, None);
    assert!(mentioned.has_agent_working);
    assert_eq!(pr_listings(dir.path()), 1, "one listing per fetch");

    let merged = tracker
        .merge_pull_request(10, Some(500), MergeMethod::Squash, true)
        .await
        .unwrap();
    assert!(merged.success);
    assert_eq!(pr_listings(dir.path()), 1, "a known PR is merged without a lookup");
    let calls = fs::read_to_string(dir.path().join("calls")).unwrap();
    assert!(calls.contains("pr merge 500 --repo acme/work --squash --delete-branch"));

    let unlinked = tracker
        .merge_pull_request(11, None, MergeMethod::Merge, false)
        .await
        .unwrap();
    assert!(!unlinked.success);
    assert_eq!(
        unlinked.error.as_deref(),
        Some("no open pull request for issue #11")
    );

    fs::write(dir.path().join("pr_fail"), "").unwrap();
    let err = tracker
        .fetch_epic_state("acme/tracking", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Tracker(_)));
}

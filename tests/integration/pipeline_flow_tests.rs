use std::sync::{Arc, Mutex};
use std::time::Duration;

use epic_conductor::models::epic::PhaseStatus;
use epic_conductor::models::pipeline::{MergeMethod, PipelineStatus};
use epic_conductor::models::snapshot::ChangeKind;
use epic_conductor::AppError;

use super::fakes::{close, epic_id, harness, scenario, with_pr, Harness};

async fn synced() -> Harness {
    let h = harness(scenario());
    h.engine.attach(&epic_id(), None).await.unwrap();
    h.engine.force_sync().await.unwrap();
    h
}

fn phase_events(h: &Harness) -> Arc<Mutex<Vec<u32>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    h.engine.subscribe(move |n| {
        if let ChangeKind::PhaseCompleted { phase, .. } = &n.kind {
            sink.lock().unwrap().push(*phase);
        }
    });
    seen
}

fn status_of(h: &Harness, issue_number: u64) -> PipelineStatus {
    h.engine
        .snapshot()
        .pipeline
        .iter()
        .find(|item| item.issue_number == issue_number)
        .map(|item| item.status)
        .expect("pipeline item")
}

#[tokio::test]
async fn sync_creates_items_for_open_sub_issues() {
    let h = synced().await;
    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.pipeline.len(), 3);
    assert_eq!(status_of(&h, 10), PipelineStatus::Queued);
    assert_eq!(status_of(&h, 11), PipelineStatus::InProgress);
    assert_eq!(status_of(&h, 12), PipelineStatus::Queued);
    assert_eq!(snapshot.pipeline[0].work_repo, "acme/work");
    assert_eq!(snapshot.pipeline_summary.queued, 2);
    assert_eq!(snapshot.pipeline_summary.in_progress, 1);
}

#[tokio::test]
async fn assign_with_empty_path_touches_no_gateway() {
    let h = synced().await;
    let err = h.engine.assign(10, "claude", "").await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    let err = h.engine.assign(10, "claude", "   ").await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert!(h.sessions.calls().is_empty());
    assert_eq!(status_of(&h, 10), PipelineStatus::Queued);
}

#[tokio::test]
async fn assign_starts_a_worker_and_launches_the_agent() {
    let h = synced().await;
    let item = h.engine.assign(10, "claude", "/work/acme").await.unwrap();

    assert_eq!(item.status, PipelineStatus::InProgress);
    assert_eq!(item.session_name.as_deref(), Some("conductor-agent-10"));
    assert_eq!(item.agent_type.as_deref(), Some("claude"));
    assert!(item.started_at.is_some());
    assert_eq!(
        h.sessions.mutations(),
        vec![
            "create:conductor-agent-10".to_owned(),
            "send:conductor-agent-10:claude --issue 10 --repo acme/work".to_owned(),
        ]
    );
    assert_eq!(h.engine.local_repo_path().as_deref(), Some("/work/acme"));
}

#[tokio::test]
async fn failed_launch_leaves_the_item_queued() {
    let h = synced().await;
    h.sessions.set_fail_send(true);
    let err = h.engine.assign(10, "claude", "/work/acme").await.unwrap_err();
    assert!(matches!(err, AppError::Session(_)));
    assert_eq!(status_of(&h, 10), PipelineStatus::Queued);
    assert!(h.sessions.names().is_empty());

    h.sessions.set_fail_send(false);
    let item = h.engine.assign(10, "claude", "/work/acme").await.unwrap();
    assert_eq!(item.status, PipelineStatus::InProgress);
}

#[tokio::test]
async fn assign_rejects_unknown_and_started_items() {
    let h = synced().await;
    let err = h.engine.assign(99, "claude", "/work/acme").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = h.engine.assign(11, "claude", "/work/acme").await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));
    assert!(h.sessions.mutations().is_empty());
}

#[tokio::test]
async fn assign_conflicts_with_a_running_session() {
    let h = synced().await;
    h.sessions.insert("conductor-agent-10", true, Some("acme/tracking#10"));
    let err = h.engine.assign(10, "claude", "/work/acme").await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(status_of(&h, 10), PipelineStatus::Queued);
}

#[tokio::test]
async fn skip_fail_and_archive() {
    let h = synced().await;
    let skipped = h.engine.skip(10, Some("out of scope")).unwrap();
    assert_eq!(skipped.status, PipelineStatus::Skipped);
    assert_eq!(skipped.error.as_deref(), Some("out of scope"));

    let err = h.engine.skip(11, None).unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)), "only queued items skip");

    let failed = h.engine.fail(11, "agent crashed").unwrap();
    assert_eq!(failed.status, PipelineStatus::Failed);
    assert!(failed.completed_at.is_some());
    assert!(h.engine.fail(11, "again").is_err());

    let archived = h.engine.archive(&skipped.id).unwrap();
    assert_eq!(archived.issue_number, 10);
    assert!(matches!(h.engine.archive(&skipped.id), Err(AppError::NotFound(_))));
    assert_eq!(h.engine.history(10).len(), 1);
    assert_eq!(h.engine.pipeline_summary().total, 2);
}

#[tokio::test]
async fn tracker_progress_advances_items() {
    let h = synced().await;
    h.tracker.update(|s| with_pr(s, 11, 501));
    h.engine.force_sync().await.unwrap();
    assert_eq!(status_of(&h, 11), PipelineStatus::PrReview);

    h.tracker.update(|s| close(s, 11));
    h.engine.force_sync().await.unwrap();
    assert_eq!(status_of(&h, 11), PipelineStatus::Completed);
}

#[tokio::test]
async fn stopped_worker_is_surfaced_on_its_item() {
    let h = synced().await;
    h.engine.assign(10, "claude", "/work/acme").await.unwrap();
    h.sessions.set_running("conductor-agent-10", false);
    h.engine.refresh_sessions().await.unwrap();

    let snapshot = h.engine.snapshot();
    let item = snapshot
        .pipeline
        .iter()
        .find(|item| item.issue_number == 10)
        .unwrap();
    assert!(item.session_stopped);
}

#[tokio::test]
async fn merge_one_completes_the_item() {
    let h = synced().await;
    h.tracker.update(|s| with_pr(s, 11, 501));
    h.engine.force_sync().await.unwrap();

    let result = h
        .engine
        .merge_one(11, Some(MergeMethod::Rebase), Some(false))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.pr_number, Some(501));
    assert!(!result.phase_complete, "#10 is still open in phase 1");
    assert_eq!(h.tracker.merged(), vec![(11, MergeMethod::Rebase, false)]);
    assert_eq!(status_of(&h, 11), PipelineStatus::Completed);
}

#[tokio::test]
async fn merge_one_uses_configured_defaults_and_signals_phase_completion() {
    let h = synced().await;
    h.tracker.update(|s| {
        close(s, 10);
        with_pr(s, 11, 501);
    });
    h.engine.force_sync().await.unwrap();

    let result = h.engine.merge_one(11, None, None).await.unwrap();
    assert!(result.phase_complete);
    assert_eq!(result.next_phase, Some(2));
    assert_eq!(h.tracker.merged(), vec![(11, MergeMethod::Squash, true)]);
}

#[tokio::test]
async fn merged_phase_is_announced_once() {
    let h = synced().await;
    h.tracker.update(|s| {
        close(s, 10);
        with_pr(s, 11, 501);
    });
    h.engine.force_sync().await.unwrap();
    let seen = phase_events(&h);

    let result = h.engine.merge_one(11, None, None).await.unwrap();
    assert!(result.phase_complete);
    h.engine.force_sync().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![1]);
    assert_eq!(h.engine.snapshot().phases[0].status, PhaseStatus::Completed);
}

#[tokio::test]
async fn merge_one_rejects_bad_input() {
    let h = synced().await;
    assert!(matches!(
        h.engine.merge_one(0, None, None).await,
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        h.engine.merge_one(10, None, None).await,
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        h.engine.merge_one(77, None, None).await,
        Err(AppError::NotFound(_))
    ));

    h.tracker.update(|s| with_pr(s, 11, 501));
    h.engine.force_sync().await.unwrap();
    h.tracker.fail_merge(11);
    let err = h.engine.merge_one(11, None, None).await.unwrap_err();
    assert!(matches!(err, AppError::Tracker(_)));
    assert_eq!(status_of(&h, 11), PipelineStatus::PrReview);
    assert!(h.tracker.merged().is_empty());
}

#[tokio::test]
async fn mark_phase_status_writes_through_and_resyncs() {
    let h = synced().await;
    h.engine
        .mark_phase_status(1, PhaseStatus::Skipped)
        .await
        .unwrap();
    assert_eq!(h.tracker.phase_writes(), vec![(1, PhaseStatus::Skipped)]);

    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.phases[0].status, PhaseStatus::Skipped);
    assert_eq!(snapshot.counts.blocked, 0, "phase 2 is now current");

    let err = h
        .engine
        .mark_phase_status(9, PhaseStatus::Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn mark_phase_status_requires_an_epic() {
    let h = harness(scenario());
    let err = h
        .engine
        .mark_phase_status(1, PhaseStatus::Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert!(h.tracker.phase_writes().is_empty());
}

#[tokio::test]
async fn phase_override_is_not_hidden_by_an_in_flight_sync() {
    let h = synced().await;
    h.tracker.set_fetch_delay(Duration::from_millis(50));

    let (forced, marked) = tokio::join!(h.engine.force_sync(), async {
        tokio::task::yield_now().await;
        h.engine.mark_phase_status(1, PhaseStatus::Skipped).await
    });
    forced.unwrap();
    marked.unwrap();

    assert_eq!(h.tracker.fetches(), 3, "the write gets a fetch of its own");
    assert_eq!(h.engine.snapshot().phases[0].status, PhaseStatus::Skipped);
}

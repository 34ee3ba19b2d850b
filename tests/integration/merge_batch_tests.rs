use std::sync::{Arc, Mutex};
use std::time::Duration;

use epic_conductor::models::pipeline::{MergeMethod, PipelineStatus};
use epic_conductor::models::snapshot::ChangeKind;

use super::fakes::{epic_id, harness, scenario, with_pr, Harness};

async fn all_ready() -> Harness {
    let mut snapshot = scenario();
    with_pr(&mut snapshot, 10, 500);
    with_pr(&mut snapshot, 11, 501);
    with_pr(&mut snapshot, 12, 502);
    let h = harness(snapshot);
    h.engine.attach(&epic_id(), None).await.unwrap();
    h.engine.force_sync().await.unwrap();
    h
}

#[tokio::test]
async fn one_failure_does_not_stop_the_batch() {
    let h = all_ready().await;
    h.tracker.fail_merge(11);

    let report = h.engine.merge_all_ready(None, None).await;
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);

    let failed = report.results.iter().find(|r| !r.success).unwrap();
    assert_eq!(failed.issue_number, 11);
    assert_eq!(failed.error.as_deref(), Some("merge conflict"));

    let merged: Vec<u64> = h.tracker.merged().iter().map(|m| m.0).collect();
    assert_eq!(merged, vec![10, 12], "merges run in issue order");

    assert_eq!(report.completed_phases, vec![2]);
    assert_eq!(report.next_phase, None);

    let snapshot = h.engine.snapshot();
    let status = |n: u64| {
        snapshot
            .pipeline
            .iter()
            .find(|item| item.issue_number == n)
            .map(|item| item.status)
    };
    assert_eq!(status(10), Some(PipelineStatus::Completed));
    assert_eq!(status(11), Some(PipelineStatus::PrReview));
    assert_eq!(status(12), Some(PipelineStatus::Completed));
}

#[tokio::test]
async fn full_batch_reports_every_closed_phase() {
    let h = all_ready().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    h.engine.subscribe(move |n| sink.lock().unwrap().push(n.kind.clone()));

    let report = h
        .engine
        .merge_all_ready(Some(MergeMethod::Merge), Some(false))
        .await;
    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.completed_phases, vec![1, 2]);
    assert!(report
        .results
        .iter()
        .all(|r| r.success && r.phase_complete));
    let first = &report.results[0];
    assert_eq!(first.next_phase, Some(2));
    assert!(h
        .tracker
        .merged()
        .iter()
        .all(|m| m.1 == MergeMethod::Merge && !m.2));

    let phase_events: Vec<u32> = seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|kind| match kind {
            ChangeKind::PhaseCompleted { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(phase_events, vec![1, 2]);
}

#[tokio::test]
async fn assign_proceeds_while_batch_merging() {
    let mut snapshot = scenario();
    with_pr(&mut snapshot, 11, 501);
    with_pr(&mut snapshot, 12, 502);
    let h = harness(snapshot);
    h.engine.attach(&epic_id(), None).await.unwrap();
    h.engine.force_sync().await.unwrap();
    h.tracker.set_merge_delay(Duration::from_millis(50));

    let (report, merged_at_assign) = tokio::join!(h.engine.merge_all_ready(None, None), async {
        tokio::task::yield_now().await;
        let item = h.engine.assign(10, "claude", "/work/acme").await.unwrap();
        assert_eq!(item.status, PipelineStatus::InProgress);
        h.tracker.merged().len()
    });
    assert_eq!(merged_at_assign, 0, "assign finished before the first merge landed");
    assert_eq!(report.succeeded(), 2);
    assert!(h
        .sessions
        .mutations()
        .contains(&"create:conductor-agent-10".to_owned()));
}

#[tokio::test]
async fn nothing_ready_is_an_empty_report() {
    let h = harness(scenario());
    h.engine.attach(&epic_id(), None).await.unwrap();
    h.engine.force_sync().await.unwrap();

    let report = h.engine.merge_all_ready(None, None).await;
    assert!(report.results.is_empty());
    assert!(report.completed_phases.is_empty());
    assert!(h.tracker.merged().is_empty());
}

#[tokio::test]
async fn second_batch_skips_already_merged_items() {
    let h = all_ready().await;
    h.tracker.fail_merge(11);
    h.engine.merge_all_ready(None, None).await;

    let report = h.engine.merge_all_ready(None, None).await;
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].issue_number, 11);
    assert_eq!(h.tracker.merged().len(), 2);
}

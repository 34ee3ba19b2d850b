use std::sync::Arc;

use epic_conductor::models::epic::{Epic, EpicId, EpicSnapshot, Phase, PhaseStatus, SubIssue};
use epic_conductor::persistence::{db, epic_repo::EpicRepo};

async fn repo() -> EpicRepo {
    let pool = db::connect_memory().await.expect("in-memory db");
    EpicRepo::new(Arc::new(pool))
}

fn snapshot(repo: &str, number: u64) -> EpicSnapshot {
    EpicSnapshot {
        epic: Epic {
            id: EpicId::new(repo, number),
            title: "Epic".into(),
            url: String::new(),
            work_repo: Some("acme/work".into()),
            local_repo_path: None,
            phases: vec![Phase::new(1, "One", PhaseStatus::InProgress)],
        },
        sub_issues: vec![SubIssue::open(10, "Task", Some(1))],
    }
}

#[tokio::test]
async fn schema_bootstrap_is_idempotent() {
    let pool = db::connect_memory().await.expect("connect");
    epic_conductor::persistence::schema::bootstrap_schema(&pool)
        .await
        .expect("second bootstrap");
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM epic_state")
        .fetch_one(&pool)
        .await
        .expect("table queryable");
    assert_eq!(row.0, 0);
}

#[tokio::test]
async fn unknown_epic_loads_as_none() {
    let repo = repo().await;
    assert!(repo.load(&EpicId::new("acme/x", 1)).await.unwrap().is_none());
    assert!(repo.active().await.unwrap().is_none());
}

#[tokio::test]
async fn snapshot_round_trips_and_keeps_path() {
    let repo = repo().await;
    let id = EpicId::new("acme/tracking", 1);
    repo.set_local_repo_path(&id, "/work/acme").await.unwrap();
    repo.save_snapshot(&snapshot("acme/tracking", 1)).await.unwrap();

    let record = repo.load(&id).await.unwrap().expect("stored");
    assert_eq!(record.snapshot, Some(snapshot("acme/tracking", 1)));
    assert_eq!(record.local_repo_path.as_deref(), Some("/work/acme"));
    assert!(!record.active);

    let mut updated = snapshot("acme/tracking", 1);
    updated.sub_issues.clear();
    repo.save_snapshot(&updated).await.unwrap();
    let record = repo.load(&id).await.unwrap().unwrap();
    assert!(record.snapshot.unwrap().sub_issues.is_empty());
    assert_eq!(record.local_repo_path.as_deref(), Some("/work/acme"));
}

#[tokio::test]
async fn only_one_epic_is_active() {
    let repo = repo().await;
    let first = EpicId::new("acme/tracking", 1);
    let second = EpicId::new("acme/tracking", 2);
    repo.save_snapshot(&snapshot("acme/tracking", 1)).await.unwrap();

    repo.set_active(&first).await.unwrap();
    assert_eq!(repo.active().await.unwrap().map(|r| r.id), Some(first.clone()));
    assert!(repo.load(&first).await.unwrap().unwrap().snapshot.is_some());

    repo.set_active(&second).await.unwrap();
    assert_eq!(repo.active().await.unwrap().map(|r| r.id), Some(second));
    assert!(!repo.load(&first).await.unwrap().unwrap().active);
}

#[tokio::test]
async fn archive_clears_active_and_stamps_time() {
    let repo = repo().await;
    let id = EpicId::new("acme/tracking", 3);
    repo.set_active(&id).await.unwrap();

    assert!(repo.archive(&id).await.unwrap());
    let record = repo.load(&id).await.unwrap().unwrap();
    assert!(!record.active);
    assert!(record.archived_at.is_some());
    assert!(repo.active().await.unwrap().is_none());
    assert!(!repo.archive(&EpicId::new("acme/none", 9)).await.unwrap());

    repo.set_active(&id).await.unwrap();
    assert!(repo.load(&id).await.unwrap().unwrap().archived_at.is_none());
}

#[tokio::test]
async fn list_returns_every_epic() {
    let repo = repo().await;
    repo.save_snapshot(&snapshot("acme/a", 1)).await.unwrap();
    repo.save_snapshot(&snapshot("acme/b", 2)).await.unwrap();
    let mut keys: Vec<String> = repo
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id.key())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["acme/a#1".to_owned(), "acme/b#2".to_owned()]);
}

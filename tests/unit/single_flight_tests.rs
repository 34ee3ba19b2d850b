use std::time::Duration;

use epic_conductor::orchestrator::single_flight::{Entry, SingleFlight, Trigger};

#[tokio::test]
async fn try_begin_is_exclusive() {
    let flight = SingleFlight::new();
    let guard = flight.try_begin().expect("idle");
    assert!(flight.is_busy());
    assert!(flight.try_begin().is_none());
    drop(guard);
    assert!(!flight.is_busy());
    assert_eq!(flight.completed_runs(), 1);
    assert!(flight.try_begin().is_some());
}

#[tokio::test]
async fn timer_entry_skips_while_busy() {
    let flight = SingleFlight::new();
    let _guard = flight.try_begin().unwrap();
    assert!(matches!(flight.enter(Trigger::Timer).await, Entry::Skipped));
}

#[tokio::test]
async fn forced_entry_leads_when_idle() {
    let flight = SingleFlight::new();
    assert!(matches!(flight.enter(Trigger::Forced).await, Entry::Leader(_)));
}

#[tokio::test]
async fn forced_entry_joins_a_run_in_progress() {
    let flight = SingleFlight::new();
    let ((), joined) = tokio::join!(
        async {
            let guard = flight.try_begin().expect("idle");
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        },
        async {
            tokio::task::yield_now().await;
            matches!(flight.enter(Trigger::Forced).await, Entry::Joined)
        },
    );
    assert!(joined);
    assert_eq!(flight.completed_runs(), 1);
}

#[tokio::test]
async fn after_write_entry_runs_again_once_the_busy_run_ends() {
    let flight = SingleFlight::new();
    let ((), led) = tokio::join!(
        async {
            let guard = flight.try_begin().expect("idle");
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        },
        async {
            tokio::task::yield_now().await;
            assert!(flight.is_busy());
            match flight.enter(Trigger::AfterWrite).await {
                Entry::Leader(guard) => {
                    assert_eq!(flight.completed_runs(), 1, "waited for the first run");
                    drop(guard);
                    true
                }
                _ => false,
            }
        },
    );
    assert!(led);
    assert_eq!(flight.completed_runs(), 2);
}
